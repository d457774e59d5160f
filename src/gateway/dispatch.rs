//! Backend dispatch.
//!
//! [`Dispatcher`] is the seam to whatever serves an authenticated request.
//! [`ForwardingDispatcher`] streams it to an HTTP backend, telling the backend
//! who the resolved client is through two headers:
//!
//! | Header | Value |
//! |--------|-------|
//! | `X-Road-Client` | resolved `INSTANCE/CLASS/MEMBER[/SUBSYSTEM]` |
//! | `X-Road-Authentication` | satisfied policy (`none`, `verify_none`, `verify_client`) |
//!
//! Failures come back as [`Fault`]s in the same taxonomy as authentication
//! rejections.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::Response;
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::fault::Fault;
use crate::identifier::ClientId;
use crate::trust::AuthenticationPolicy;
use crate::{Error, Result};

/// Header carrying the client claim on the way in and the resolved client on
/// the way out.
pub const CLIENT_HEADER: HeaderName = HeaderName::from_static("x-road-client");

/// Header carrying the satisfied authentication policy to the backend.
pub const AUTHENTICATION_HEADER: HeaderName = HeaderName::from_static("x-road-authentication");

/// Serves requests that passed authentication.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Handle `request` on behalf of `client`.
    async fn dispatch(
        &self,
        client: &ClientId,
        policy: AuthenticationPolicy,
        request: Request,
    ) -> std::result::Result<Response, Fault>;
}

/// Forwards requests to an HTTP backend with `reqwest`.
#[derive(Debug, Clone)]
pub struct ForwardingDispatcher {
    http: reqwest::Client,
    base_url: String,
}

impl ForwardingDispatcher {
    /// Build a dispatcher from backend configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Dispatch(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    /// Backend base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Dispatcher for ForwardingDispatcher {
    async fn dispatch(
        &self,
        client: &ClientId,
        policy: AuthenticationPolicy,
        request: Request,
    ) -> std::result::Result<Response, Fault> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let url = format!("{}{path}", self.base_url);

        let mut headers = forwardable(&parts.headers);
        headers.remove(AUTHENTICATION_HEADER);
        let client_value = HeaderValue::from_str(&client.to_string())
            .map_err(|e| Fault::service_failed(format!("Client id not header-safe: {e}")))?;
        headers.insert(CLIENT_HEADER, client_value);
        headers.insert(
            AUTHENTICATION_HEADER,
            HeaderValue::from_static(policy.as_str()),
        );

        debug!(%client, method = %parts.method, %url, "Forwarding to backend");

        let upstream = self
            .http
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            *out = forwardable(upstream.headers());
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| Fault::service_failed(format!("Invalid backend response: {e}")))
    }
}

/// Copy `headers` without hop-by-hop fields.
fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in [
        header::HOST,
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::CONTENT_LENGTH,
        header::UPGRADE,
        header::TE,
        header::TRAILER,
        header::PROXY_AUTHORIZATION,
    ] {
        out.remove(name);
    }
    out
}

fn classify(e: &reqwest::Error) -> Fault {
    if e.is_connect() || e.is_timeout() {
        warn!(error = %e, "Backend unreachable");
        Fault::network_error(format!("Backend unreachable: {e}"))
    } else {
        warn!(error = %e, "Backend request failed");
        Fault::service_failed(format!("Backend request failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultCode;
    use axum::Router;
    use axum::routing::any;

    fn id() -> ClientId {
        "EE/GOV/ORG-A/billing".parse().unwrap()
    }

    /// Backend echoing the identity headers it received.
    async fn spawn_echo_backend() -> String {
        let app = Router::new().route(
            "/{*path}",
            any(|headers: HeaderMap, body: String| async move {
                let get = |n: &HeaderName| {
                    headers
                        .get(n)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string()
                };
                format!(
                    "{}|{}|{body}",
                    get(&CLIENT_HEADER),
                    get(&AUTHENTICATION_HEADER)
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn dispatcher(url: String) -> ForwardingDispatcher {
        ForwardingDispatcher::new(&BackendConfig {
            url,
            timeout_secs: 5,
            connect_timeout_secs: 1,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn forwards_body_and_identity_headers() {
        // GIVEN: an echo backend and a request with a spoofed policy header
        let d = dispatcher(spawn_echo_backend().await);
        let request = Request::builder()
            .method("POST")
            .uri("/services/getState?x=1")
            .header(AUTHENTICATION_HEADER, "verify_client")
            .body(Body::from("payload"))
            .unwrap();

        // WHEN: dispatching as a verify_none client
        let response = d
            .dispatch(&id(), AuthenticationPolicy::VerifyNone, request)
            .await
            .unwrap();

        // THEN: the backend saw the resolved identity and the real policy
        assert!(response.status().is_success());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "EE/GOV/ORG-A/billing|verify_none|payload"
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let d = dispatcher(format!("http://{addr}"));
        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let fault = d
            .dispatch(&id(), AuthenticationPolicy::None, request)
            .await
            .unwrap_err();
        assert_eq!(fault.code(), &FaultCode::NETWORK_ERROR);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        assert_eq!(
            dispatcher("http://backend:8081/".to_string()).base_url(),
            "http://backend:8081"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gw"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/xml"));
        let out = forwardable(&headers);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert_eq!(out.get(header::ACCEPT).unwrap(), "text/xml");
    }
}
