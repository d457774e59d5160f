//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{CLIENT_HEADER, Dispatcher};
use super::listener::PeerInfo;
use crate::engine::{self, AuthenticationVerdict};
use crate::fault::{self, Fault, Outcome};
use crate::identifier::ClientId;
use crate::metrics;
use crate::trust::TrustStore;

/// Header naming the fault code on fault responses.
pub const ERROR_HEADER: &str = "x-road-error";

/// Shared application state
pub struct AppState {
    /// Published trust configuration
    pub store: TrustStore,
    /// Backend for authenticated requests
    pub dispatcher: Arc<dyn Dispatcher>,
}

/// Create the router
///
/// `/health` is answered locally; every other path is authenticated and
/// dispatched.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(gateway_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.store.current();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "trust_version": snapshot.version(),
        "clients": snapshot.len(),
    }))
}

/// Authenticate the request's client claim and dispatch or fault.
async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<PeerInfo>,
    request: Request,
) -> Response {
    let claim = match client_claim(request.headers()) {
        Ok(claim) => claim,
        Err(fault) => return fault_response(&fault),
    };

    // One snapshot for the whole request.
    let snapshot = state.store.current();
    let verdict = engine::decide(&claim, &peer.chain, &snapshot);
    metrics::record_verdict(&verdict);
    log_verdict(&claim, &peer, &verdict, snapshot.version());

    match fault::to_outcome(&verdict) {
        Outcome::Proceed(client, policy) => {
            match state.dispatcher.dispatch(&client, policy, request).await {
                Ok(response) => response,
                Err(fault) => fault_response(&fault),
            }
        }
        Outcome::Fault(fault) => fault_response(&fault),
    }
}

/// Parse the `X-Road-Client` header.
fn client_claim(headers: &HeaderMap) -> Result<ClientId, Fault> {
    let raw = headers
        .get(CLIENT_HEADER)
        .ok_or_else(|| Fault::invalid_client_identifier("Missing X-Road-Client header"))?;
    let text = raw
        .to_str()
        .map_err(|_| Fault::invalid_client_identifier("X-Road-Client header is not ASCII"))?;
    text.parse()
        .map_err(|e| Fault::invalid_client_identifier(format!("Invalid X-Road-Client '{text}': {e}")))
}

fn log_verdict(claim: &ClientId, peer: &PeerInfo, verdict: &AuthenticationVerdict, version: u64) {
    let subject = peer
        .chain
        .peer()
        .map_or("-", |id| id.display_name.as_str());
    match verdict {
        AuthenticationVerdict::Allowed(allowed) => {
            if let Some(lapse) = allowed.warning() {
                warn!(
                    client = %claim,
                    peer = %peer.remote_addr,
                    subject,
                    lapse_subject = %lapse.subject,
                    not_after = lapse.not_after,
                    trust_version = version,
                    "Client certificate outside validity period accepted"
                );
            } else {
                debug!(
                    client = %claim,
                    peer = %peer.remote_addr,
                    subject,
                    policy = %allowed.policy(),
                    trust_version = version,
                    "Client authenticated"
                );
            }
        }
        AuthenticationVerdict::Rejected(rejected) => {
            info!(
                client = %claim,
                peer = %peer.remote_addr,
                subject,
                reason = rejected.reason().as_str(),
                code = %rejected.fault_code(),
                trust_version = version,
                "Client rejected"
            );
        }
    }
}

#[derive(Serialize)]
struct FaultBody<'a> {
    #[serde(flatten)]
    fault: &'a Fault,
    detail: String,
}

/// Render a fault as JSON with an `X-Road-Error` header.
///
/// `Client.*` faults are 400, everything else 500.  The `detail` id is fresh
/// per fault and logged so operators can find the server-side record.
pub fn fault_response(fault: &Fault) -> Response {
    let detail = Uuid::new_v4().to_string();
    let status = if fault.code().is_client_fault() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(code = %fault.code(), message = fault.message(), %detail, "Responding with fault");

    let mut response = (status, Json(FaultBody { fault, detail })).into_response();
    if let Ok(value) = HeaderValue::from_str(fault.code().as_str()) {
        response.headers_mut().insert(ERROR_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultCode;
    use crate::mtls::PresentedChain;
    use crate::mtls::cert_manager::test_support::self_signed_der;
    use crate::trust::{AuthenticationPolicy, ConfigurationSnapshot};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    /// Answers with the resolved client and policy instead of forwarding.
    struct EchoDispatcher;

    #[async_trait]
    impl Dispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            client: &ClientId,
            policy: AuthenticationPolicy,
            _request: Request,
        ) -> Result<Response, Fault> {
            Ok(format!("{client} {policy}").into_response())
        }
    }

    fn peer(chain: PresentedChain) -> PeerInfo {
        let remote_addr: SocketAddr = "192.0.2.10:40000".parse().unwrap();
        PeerInfo { remote_addr, chain }
    }

    fn app(snapshot: ConfigurationSnapshot, peer: PeerInfo) -> Router {
        let state = Arc::new(AppState {
            store: TrustStore::new(snapshot).unwrap(),
            dispatcher: Arc::new(EchoDispatcher),
        });
        create_router(state).layer(MockConnectInfo(peer))
    }

    fn request(claim: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/services/getState");
        if let Some(claim) = claim {
            builder = builder.header(CLIENT_HEADER, claim);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn org_b() -> ConfigurationSnapshot {
        ConfigurationSnapshot::builder(true)
            .client(
                "EE/GOV/ORG-B".parse().unwrap(),
                AuthenticationPolicy::None,
                vec![],
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn allowed_client_is_dispatched() {
        let app = app(org_b(), peer(PresentedChain::plaintext()));
        let response = app.oneshot(request(Some("EE/GOV/ORG-B"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "EE/GOV/ORG-B none");
    }

    #[tokio::test]
    async fn missing_claim_is_a_client_fault() {
        let app = app(org_b(), peer(PresentedChain::plaintext()));
        let response = app.oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(ERROR_HEADER).unwrap(),
            "Client.ClientProxy.InvalidClientIdentifier"
        );
        let json = body_json(response).await;
        assert_eq!(json["type"], "Client.ClientProxy.InvalidClientIdentifier");
    }

    #[tokio::test]
    async fn malformed_claim_is_a_client_fault() {
        let app = app(org_b(), peer(PresentedChain::plaintext()));
        let response = app.oneshot(request(Some("EE/GOV"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn padded_claim_component_is_a_client_fault() {
        let app = app(org_b(), peer(PresentedChain::plaintext()));
        let response = app.oneshot(request(Some("EE/ GOV/ORG-B"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["type"], "Client.ClientProxy.InvalidClientIdentifier");
    }

    #[tokio::test]
    async fn unknown_client_gets_fault_document() {
        // GIVEN: a claim for a client the server does not know
        let app = app(org_b(), peer(PresentedChain::plaintext()));

        // WHEN
        let response = app.oneshot(request(Some("EE/GOV/NOBODY"))).await.unwrap();

        // THEN: a server fault with a detail id
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["type"], FaultCode::UNKNOWN_CLIENT.as_str());
        assert!(json["message"].as_str().unwrap().contains("not registered"));
        assert!(Uuid::parse_str(json["detail"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn untrusted_certificate_is_ssl_auth_failure() {
        let snapshot = ConfigurationSnapshot::builder(true)
            .client(
                "EE/GOV/ORG-A".parse().unwrap(),
                AuthenticationPolicy::VerifyClient,
                vec![self_signed_der("org-a-is")],
            )
            .build()
            .unwrap();
        let intruder = peer(PresentedChain::tls(vec![self_signed_der("intruder")]));
        let response = app(snapshot, intruder)
            .oneshot(request(Some("EE/GOV/ORG-A")))
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(ERROR_HEADER).unwrap(),
            "Server.ClientProxy.SslAuthFailed"
        );
    }

    #[tokio::test]
    async fn health_reports_trust_version() {
        let app = app(org_b(), peer(PresentedChain::plaintext()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["trust_version"], 1);
        assert_eq!(json["clients"], 1);
    }

    #[test]
    fn client_claim_parses_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_HEADER, HeaderValue::from_static("EE/COM/123/sub"));
        let claim = client_claim(&headers).unwrap();
        assert_eq!(claim.subsystem_code(), Some("sub"));
    }
}
