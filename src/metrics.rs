//! Authentication and reload counters.
//!
//! Recorded through the `metrics` facade; without an installed recorder the
//! calls are no-ops.  With the `metrics` feature, [`install_prometheus`]
//! serves them on a `/metrics` endpoint.
//!
//! | Counter | Labels |
//! |---------|--------|
//! | `ssgw_auth_verdicts_total` | `verdict`, `reason` |
//! | `ssgw_config_reloads_total` | `result` |

use telemetry_metrics::counter;

use crate::config_reload::ReloadResult;
use crate::engine::AuthenticationVerdict;

/// Count one authentication verdict.
pub fn record_verdict(verdict: &AuthenticationVerdict) {
    let reason = match verdict {
        AuthenticationVerdict::Allowed(a) if a.warning().is_some() => "validity_not_enforced",
        AuthenticationVerdict::Allowed(_) => "ok",
        AuthenticationVerdict::Rejected(r) => r.reason().as_str(),
    };
    counter!("ssgw_auth_verdicts_total", "verdict" => verdict.label(), "reason" => reason)
        .increment(1);
}

/// Count one configuration reload attempt.
pub fn record_reload(result: ReloadResult) {
    counter!("ssgw_config_reloads_total", "result" => result.as_str()).increment(1);
}

/// Install the Prometheus recorder and serve `/metrics` on `listen`.
#[cfg(feature = "metrics")]
pub async fn install_prometheus(listen: std::net::SocketAddr) -> crate::Result<()> {
    use axum::{Router, routing::get};
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::Error::Internal(format!("Failed to install metrics recorder: {e}")))?;

    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "Metrics endpoint listening");

    let app = Router::new().route("/metrics", get(move || async move { handle.render() }));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    Ok(())
}
