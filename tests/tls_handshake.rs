//! Full-stack tests: real TLS handshakes against a bound gateway

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderMap, HeaderName},
    routing::any,
};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use security_server_gateway::config::{Config, TlsConfig};
use security_server_gateway::gateway::{AUTHENTICATION_HEADER, CLIENT_HEADER, Gateway};
use security_server_gateway::mtls::cert_manager::{
    CaParams, CertGenerator, GeneratedCert, LeafCertParams, Validity,
};
use security_server_gateway::{AuthenticationPolicy, ConfigurationSnapshot, TrustStore};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

// ============================================================================
// Harness
// ============================================================================

struct Pki {
    ca: GeneratedCert,
    org_a: GeneratedCert,
    intruder: GeneratedCert,
}

impl Pki {
    fn new() -> Self {
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "Gateway Test CA",
            validity: Validity::days_from_now(30).unwrap(),
        })
        .unwrap();
        let client = |cn: &str| {
            CertGenerator::self_signed(&LeafCertParams {
                cn,
                organization: None,
                san_dns: vec![],
                validity: Validity::days_from_now(30).unwrap(),
            })
            .unwrap()
        };
        Self {
            org_a: client("org-a-is"),
            intruder: client("intruder"),
            ca,
        }
    }

    fn write(&self, dir: &Path) -> TlsConfig {
        let server = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn: "localhost",
                organization: None,
                san_dns: vec!["localhost".to_string()],
                validity: Validity::days_from_now(30).unwrap(),
            },
            &self.ca.cert_pem,
            &self.ca.key_pem,
        )
        .unwrap();
        CertGenerator::write_to_dir(&server, dir, "server").unwrap();
        CertGenerator::write_to_dir(&self.org_a, dir, "org-a").unwrap();
        TlsConfig {
            server_cert: dir.join("server.crt").display().to_string(),
            server_key: dir.join("server.key").display().to_string(),
        }
    }
}

fn der(generated: &GeneratedCert) -> CertificateDer<'static> {
    CertificateDer::from_pem_slice(generated.cert_pem.as_bytes()).unwrap()
}

/// Backend answering with the identity headers the gateway set.
async fn spawn_backend() -> String {
    let app = Router::new().fallback(any(|headers: HeaderMap| async move {
        let get = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        format!("{}|{}", get(&CLIENT_HEADER), get(&AUTHENTICATION_HEADER))
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Running {
    addr: SocketAddr,
    store: TrustStore,
    shutdown: broadcast::Sender<()>,
    _dir: tempfile::TempDir,
}

/// ORG-A verify_client (org-a.crt), ORG-B none, ORG-C verify_none.
async fn start(pki: &Pki) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let tls = pki.write(dir.path());
    let yaml = format!(
        r#"
server:
  host: 127.0.0.1
  http_port: 0
  https_port: 0
  handshake_timeout_secs: 2
backend:
  url: {backend}
trust:
  clients:
    - id: EE/GOV/ORG-A
      authentication: verify_client
      certificates: [org-a.crt]
    - id: EE/GOV/ORG-B
      authentication: none
    - id: EE/GOV/ORG-C
      authentication: verify_none
"#,
        backend = spawn_backend().await
    );
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, yaml).unwrap();

    let mut config = Config::load(Some(&path)).unwrap();
    config.server.tls = Some(tls);

    let gateway = Gateway::new(config, None).unwrap();
    let store = gateway.store();
    let bound = gateway.bind().await.unwrap();
    let addr = bound.https_addr().unwrap();
    assert!(bound.http_addr().is_none());

    let (shutdown, _) = broadcast::channel(1);
    let tx = shutdown.clone();
    tokio::spawn(async move { bound.serve(tx).await.unwrap() });

    Running {
        addr,
        store,
        shutdown,
        _dir: dir,
    }
}

/// HTTPS client trusting the test CA, resolving `localhost` to the gateway,
/// optionally presenting `identity` as its client certificate.
fn client(pki: &Pki, addr: SocketAddr, identity: Option<&GeneratedCert>) -> reqwest::Client {
    let ca = reqwest::Certificate::from_pem(pki.ca.cert_pem.as_bytes()).unwrap();
    let mut builder = reqwest::Client::builder()
        .tls_certs_only([ca])
        .https_only(true)
        .resolve("localhost", addr)
        .timeout(Duration::from_secs(10));
    if let Some(cert) = identity {
        let pem = format!("{}{}", cert.cert_pem, cert.key_pem);
        builder = builder.identity(reqwest::Identity::from_pem(pem.as_bytes()).unwrap());
    }
    builder.build().unwrap()
}

async fn request(client: &reqwest::Client, addr: SocketAddr, claim: &str) -> reqwest::Response {
    client
        .get(format!("https://localhost:{}/services/getState", addr.port()))
        .header("X-Road-Client", claim)
        .send()
        .await
        .unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn registered_client_certificate_reaches_backend() {
    let pki = Pki::new();
    let gw = start(&pki).await;
    let org_a = client(&pki, gw.addr, Some(&pki.org_a));

    let response = request(&org_a, gw.addr, "EE/GOV/ORG-A").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "EE/GOV/ORG-A|verify_client");
    let _ = gw.shutdown.send(());
}

#[tokio::test]
async fn foreign_certificate_gets_ssl_auth_fault() {
    // GIVEN: a peer presenting a certificate ORG-A never registered
    let pki = Pki::new();
    let gw = start(&pki).await;
    let intruder = client(&pki, gw.addr, Some(&pki.intruder));

    // WHEN: it claims ORG-A
    let response = request(&intruder, gw.addr, "EE/GOV/ORG-A").await;

    // THEN: the handshake succeeded, the request was refused with a fault
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.headers()["x-road-error"],
        "Server.ClientProxy.SslAuthFailed"
    );
    let fault: serde_json::Value = response.json().await.unwrap();
    assert_eq!(fault["type"], "Server.ClientProxy.SslAuthFailed");
    let _ = gw.shutdown.send(());
}

#[tokio::test]
async fn missing_certificate_for_verify_client_is_refused() {
    let pki = Pki::new();
    let gw = start(&pki).await;

    let response = request(&client(&pki, gw.addr, None), gw.addr, "EE/GOV/ORG-A").await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let fault: serde_json::Value = response.json().await.unwrap();
    assert_eq!(fault["type"], "Server.ClientProxy.SslAuthFailed");
    let _ = gw.shutdown.send(());
}

#[tokio::test]
async fn verify_none_and_none_accept_tls_without_certificate() {
    let pki = Pki::new();
    let gw = start(&pki).await;
    let anonymous = client(&pki, gw.addr, None);

    let org_c = request(&anonymous, gw.addr, "EE/GOV/ORG-C").await;
    assert_eq!(org_c.status(), StatusCode::OK);
    assert_eq!(org_c.text().await.unwrap(), "EE/GOV/ORG-C|verify_none");

    let org_b = request(&anonymous, gw.addr, "EE/GOV/ORG-B").await;
    assert_eq!(org_b.status(), StatusCode::OK);
    assert_eq!(org_b.text().await.unwrap(), "EE/GOV/ORG-B|none");
    let _ = gw.shutdown.send(());
}

#[tokio::test]
async fn unknown_client_gets_unknown_client_fault() {
    let pki = Pki::new();
    let gw = start(&pki).await;
    let org_a = client(&pki, gw.addr, Some(&pki.org_a));

    let response = request(&org_a, gw.addr, "EE/GOV/ORG-Z").await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let fault: serde_json::Value = response.json().await.unwrap();
    assert_eq!(fault["type"], "Server.ClientProxy.UnknownClient");
    let _ = gw.shutdown.send(());
}

#[tokio::test]
async fn reload_takes_effect_on_next_request() {
    // GIVEN: the intruder certificate is refused
    let pki = Pki::new();
    let gw = start(&pki).await;
    let intruder = client(&pki, gw.addr, Some(&pki.intruder));
    assert_eq!(
        request(&intruder, gw.addr, "EE/GOV/ORG-A").await.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );

    // WHEN: a snapshot registering it is published
    let next = ConfigurationSnapshot::builder(true)
        .client(
            "EE/GOV/ORG-A".parse().unwrap(),
            AuthenticationPolicy::VerifyClient,
            vec![der(&pki.intruder)],
        )
        .build()
        .unwrap();
    assert_eq!(gw.store.reload(next).unwrap(), 2);

    // THEN
    let response = request(&intruder, gw.addr, "EE/GOV/ORG-A").await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = gw.shutdown.send(());
}

#[tokio::test]
async fn stalled_handshake_does_not_block_other_clients() {
    let pki = Pki::new();
    let gw = start(&pki).await;

    // A peer that connects and never sends a ClientHello.
    let _stalled = TcpStream::connect(gw.addr).await.unwrap();

    let org_a = client(&pki, gw.addr, Some(&pki.org_a));
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        request(&org_a, gw.addr, "EE/GOV/ORG-A"),
    )
    .await
    .expect("request completes while another handshake stalls");
    assert_eq!(response.status(), StatusCode::OK);
    let _ = gw.shutdown.send(());
}
