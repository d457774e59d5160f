//! Configuration management

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identifier::ClientId;
use crate::mtls::cert_manager::load_certs;
use crate::trust::{AuthenticationPolicy, ConfigurationSnapshot};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Backend dispatch configuration
    pub backend: BackendConfig,
    /// Per-client trust configuration
    pub trust: TrustConfig,
    /// Metrics exporter configuration
    pub metrics: MetricsConfig,
    /// Directory relative certificate paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Plain HTTP port (0 disables the listener)
    pub http_port: u16,
    /// HTTPS port, used when `tls` is set
    pub https_port: u16,
    /// Server certificate and key for the HTTPS listener
    pub tls: Option<TlsConfig>,
    /// Seconds a peer may take to finish the TLS handshake
    pub handshake_timeout_secs: u64,
    /// Seconds to wait for in-flight requests on shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 8080,
            https_port: 8443,
            tls: None,
            handshake_timeout_secs: 10,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Address of the plain HTTP listener, if enabled.
    pub fn http_addr(&self) -> Result<Option<SocketAddr>> {
        if self.http_port == 0 {
            return Ok(None);
        }
        parse_addr(&self.host, self.http_port).map(Some)
    }

    /// Address of the HTTPS listener, if TLS is configured.
    pub fn https_addr(&self) -> Result<Option<SocketAddr>> {
        if self.tls.is_none() {
            return Ok(None);
        }
        parse_addr(&self.host, self.https_port).map(Some)
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address {host}:{port}: {e}")))
}

/// Server certificate material (PEM paths)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Server certificate chain
    pub server_cert: String,
    /// Server private key
    pub server_key: String,
}

/// Backend dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL requests are forwarded to
    pub url: String,
    /// Whole-request timeout in seconds
    pub timeout_secs: u64,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8081".to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

/// Per-client trust configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Reject trusted certificates outside their validity period
    pub enforce_validity_period: bool,
    /// Registered clients
    pub clients: Vec<ClientEntry>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            enforce_validity_period: true,
            clients: Vec::new(),
        }
    }
}

/// One registered client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    /// `INSTANCE/CLASS/MEMBER[/SUBSYSTEM]`
    pub id: ClientId,
    /// Required authentication
    #[serde(default = "default_policy")]
    pub authentication: AuthenticationPolicy,
    /// PEM files holding the client's information-system certificates
    #[serde(default)]
    pub certificates: Vec<PathBuf>,
}

fn default_policy() -> AuthenticationPolicy {
    AuthenticationPolicy::VerifyClient
}

impl TrustConfig {
    /// Load every referenced certificate and build a validated snapshot.
    ///
    /// Relative certificate paths are resolved against `base_dir`.
    pub fn to_snapshot(&self, base_dir: Option<&Path>) -> Result<ConfigurationSnapshot> {
        let mut builder = ConfigurationSnapshot::builder(self.enforce_validity_period);
        for entry in &self.clients {
            let mut certs = Vec::new();
            for path in &entry.certificates {
                let resolved = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path.clone(),
                };
                certs.extend(load_certs(&resolved)?);
            }
            debug!(
                client = %entry.id,
                policy = %entry.authentication,
                certificates = certs.len(),
                "Client trust entry loaded"
            );
            builder = builder.client(entry.id.clone(), entry.authentication, certs);
        }
        Ok(builder.build()?)
    }
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve a Prometheus scrape endpoint
    pub enabled: bool,
    /// Scrape endpoint address
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (SSGW_ prefix)
        figment = figment.merge(Env::prefixed("SSGW_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.base_dir = path.and_then(Path::parent).map(Path::to_path_buf);

        Ok(config)
    }

    /// Build the trust snapshot described by this configuration.
    pub fn trust_snapshot(&self) -> Result<ConfigurationSnapshot> {
        self.trust.to_snapshot(self.base_dir.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::cert_manager::{CertGenerator, LeafCertParams, Validity};
    use pretty_assertions::assert_eq;
    use std::fs;

    fn write_client_cert(dir: &Path, stem: &str) {
        let cert = CertGenerator::self_signed(&LeafCertParams {
            cn: stem,
            organization: None,
            san_dns: vec![],
            validity: Validity::days_from_now(30).unwrap(),
        })
        .unwrap();
        CertGenerator::write_to_dir(&cert, dir, stem).unwrap();
    }

    #[test]
    fn defaults_enforce_validity_and_disable_tls() {
        let config = Config::default();
        assert!(config.trust.enforce_validity_period);
        assert!(config.server.tls.is_none());
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_addr().unwrap(), None);
    }

    #[test]
    fn clients_deserialise_from_yaml() {
        let yaml = r"
trust:
  enforce_validity_period: false
  clients:
    - id: EE/GOV/ORG-A
      authentication: verify_client
      certificates: [certs/org-a.crt]
    - id: EE/GOV/ORG-B/billing
      authentication: NOSSL
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.trust.enforce_validity_period);
        assert_eq!(config.trust.clients.len(), 2);
        assert_eq!(config.trust.clients[0].id.to_string(), "EE/GOV/ORG-A");
        assert_eq!(
            config.trust.clients[1].authentication,
            AuthenticationPolicy::None
        );
        assert_eq!(
            config.trust.clients[1].id.subsystem_code(),
            Some("billing")
        );
    }

    #[test]
    fn invalid_client_id_fails_to_deserialise() {
        let yaml = r"
trust:
  clients:
    - id: EE/GOV
";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/ssgw.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn load_resolves_certificates_relative_to_config_file() {
        // GIVEN: a config file next to a certs/ directory
        let dir = tempfile::tempdir().unwrap();
        write_client_cert(&dir.path().join("certs"), "org-a");
        let path = dir.path().join("ssgw.yaml");
        fs::write(
            &path,
            r"
server:
  http_port: 18080
trust:
  clients:
    - id: EE/GOV/ORG-A
      certificates: [certs/org-a.crt]
",
        )
        .unwrap();

        // WHEN: loading and compiling the trust snapshot
        let config = Config::load(Some(&path)).unwrap();
        let snapshot = config.trust_snapshot().unwrap();

        // THEN: the default policy applies and the certificate is registered
        assert_eq!(config.server.http_port, 18080);
        let id: ClientId = "EE/GOV/ORG-A".parse().unwrap();
        assert_eq!(
            snapshot.policy_for(&id),
            Some(AuthenticationPolicy::VerifyClient)
        );
        assert_eq!(snapshot.trusted_certs_for(&id).unwrap().len(), 1);
    }

    #[test]
    fn verify_client_without_certificates_fails_to_compile() {
        let yaml = r"
trust:
  clients:
    - id: EE/GOV/ORG-A
      authentication: verify_client
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.trust_snapshot().unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
    }

    #[test]
    fn missing_certificate_file_fails_to_compile() {
        let yaml = r"
trust:
  clients:
    - id: EE/GOV/ORG-A
      certificates: [/nonexistent/org-a.crt]
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.trust_snapshot().unwrap_err(),
            Error::Certificate(_)
        ));
    }
}
