use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::ProtocolConfig;
use crate::error::{EstimateError, InputError, LedgerError};
use crate::estimator::Estimator;
use crate::ledger::Ledger;
use crate::lookback::parse_lookback;
use crate::window::parse_timestamp;

pub struct QuotaApiState {
    pub estimator: Estimator<Arc<dyn Ledger>>,
    pub default_lookback: Duration,
}

#[derive(Debug, Deserialize)]
pub struct QuotaParams {
    pub domain: Option<String>,
    pub lookback: Option<String>,
    pub now: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn quota_router(state: Arc<QuotaApiState>) -> Router {
    Router::new()
        .route("/api/quota", get(handle_quota))
        .with_state(state)
}

/// Assemble the served routes. `/metrics` is mounted only when a handle is
/// supplied and the protocol is enabled.
pub fn build_router(
    protocols: &ProtocolConfig,
    state: Arc<QuotaApiState>,
    prometheus_handle: Option<PrometheusHandle>,
) -> Router {
    let mut app = Router::new();

    if protocols.health {
        app = app.route("/health", get(health));
    }

    if protocols.metrics {
        if let Some(handle) = prometheus_handle {
            app = app.route("/metrics", get(move || async move { handle.render() }));
        }
    }

    if protocols.api {
        app = app.merge(quota_router(state));
        info!("quota API enabled");
    }

    app.layer(CorsLayer::permissive())
}

async fn health() -> &'static str {
    "OK"
}

fn respond(start: Instant, status: StatusCode, body: impl IntoResponse) -> Response {
    metrics::counter!("certquota_http_requests", "status" => status.as_u16().to_string())
        .increment(1);
    metrics::histogram!("certquota_http_duration_seconds").record(start.elapsed().as_secs_f64());
    (status, body).into_response()
}

fn error_status(err: &EstimateError) -> StatusCode {
    match err {
        EstimateError::Input(_) => StatusCode::BAD_REQUEST,
        EstimateError::DataSource(LedgerError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        EstimateError::DataSource(LedgerError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        EstimateError::DataSource(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(err: &EstimateError) -> Json<ErrorResponse> {
    let error = match err {
        EstimateError::Input(e) => e.to_string(),
        EstimateError::DataSource(LedgerError::Unavailable(_)) => {
            "Ledger unavailable, retry later".to_string()
        }
        EstimateError::DataSource(LedgerError::Timeout(_)) => "Ledger query timed out".to_string(),
        EstimateError::DataSource(_) => "Internal ledger error".to_string(),
    };
    Json(ErrorResponse { error })
}

async fn handle_quota(
    State(state): State<Arc<QuotaApiState>>,
    Query(params): Query<QuotaParams>,
) -> Response {
    let start = Instant::now();

    let inputs = resolve_params(&params, state.default_lookback);
    let (domain, lookback, now) = match inputs {
        Ok(v) => v,
        Err(e) => {
            let err = EstimateError::from(e);
            return respond(start, error_status(&err), error_body(&err));
        }
    };

    let result = match now {
        Some(now) => state.estimator.estimate(domain, lookback, now).await,
        None => state.estimator.estimate_now(domain, lookback).await,
    };
    match result {
        Ok(report) => respond(start, StatusCode::OK, Json(report)),
        Err(err) => {
            if let EstimateError::DataSource(ref e) = err {
                warn!(domain, error = %e, "Quota estimate failed");
            }
            respond(start, error_status(&err), error_body(&err))
        }
    }
}

fn resolve_params(
    params: &QuotaParams,
    default_lookback: Duration,
) -> Result<(&str, Duration, Option<DateTime<Utc>>), InputError> {
    let domain = params.domain.as_deref().ok_or(InputError::EmptyDomain)?;
    let lookback = match params.lookback.as_deref() {
        Some(s) => parse_lookback(s)?,
        None => default_lookback,
    };
    let now = params.now.as_deref().map(parse_timestamp).transpose()?;
    Ok((domain, lookback, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CandidateQuery, InMemoryLedger};
    use crate::models::LedgerEntry;
    use crate::test_support::{entry, precert_der, CertSpec, NOW_TS};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    struct StubLedger(fn() -> LedgerError);

    #[async_trait]
    impl Ledger for StubLedger {
        async fn fetch_candidates(
            &self,
            _query: &CandidateQuery,
        ) -> Result<Vec<LedgerEntry>, LedgerError> {
            Err((self.0)())
        }
    }

    fn state_with(ledger: Arc<dyn Ledger>) -> Arc<QuotaApiState> {
        Arc::new(QuotaApiState {
            estimator: Estimator::new(ledger),
            default_lookback: Duration::days(7),
        })
    }

    fn sample_state() -> Arc<QuotaApiState> {
        let names = ["example.com"];
        let spec = |nb: i64| CertSpec::new(names[0], &[]).not_before(nb);
        let ledger: InMemoryLedger = vec![
            entry(1, 1, precert_der(&spec(NOW_TS - 2 * 86_400))),
            entry(2, 1, precert_der(&spec(NOW_TS - 86_400))),
        ]
        .into_iter()
        .collect();
        state_with(Arc::new(ledger))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_quota_report() {
        let (status, body) = get(
            quota_router(sample_state()),
            "/api/quota?domain=example.com&lookback=P7D&now=2026-10-15T10:30:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], "example.com");
        assert_eq!(body["total_certs"], 2);
        assert_eq!(body["new_issued"], 1);
        assert_eq!(body["renewals"], 1);
        assert_eq!(body["lookback_secs"], 604_800);
        assert_eq!(body["window_end"], "2026-10-15T11:00:00Z");
    }

    #[tokio::test]
    async fn test_default_lookback_applies() {
        let (status, body) = get(
            quota_router(sample_state()),
            "/api/quota?domain=example.com&now=2026-10-15T10:30:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lookback_secs"], 604_800);
    }

    #[tokio::test]
    async fn test_invalid_input_returns_400() {
        for uri in [
            "/api/quota",
            "/api/quota?domain=",
            "/api/quota?domain=bad_domain!.com",
            "/api/quota?domain=example.com&lookback=forever",
            "/api/quota?domain=example.com&lookback=-7d",
            "/api/quota?domain=example.com&now=tomorrow",
        ] {
            let (status, body) = get(quota_router(sample_state()), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "uri: {}", uri);
            assert!(body["error"].is_string(), "uri: {}", uri);
        }
    }

    #[tokio::test]
    async fn test_ledger_failures_map_to_status() {
        let cases: [(fn() -> LedgerError, StatusCode); 3] = [
            (
                || LedgerError::Unavailable("no table".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                || LedgerError::Timeout(std::time::Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                || LedgerError::Query("plan failed".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (make, expected) in cases {
            let state = state_with(Arc::new(StubLedger(make)));
            let (status, _) = get(quota_router(state), "/api/quota?domain=example.com").await;
            assert_eq!(status, expected);
        }
    }

    #[tokio::test]
    async fn test_router_respects_protocol_toggles() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = build_router(&ProtocolConfig::default(), sample_state(), Some(handle));
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let protocols = ProtocolConfig {
            api: false,
            health: true,
            metrics: false,
        };
        let app = build_router(&protocols, sample_state(), None);
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/quota?domain=example.com").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
