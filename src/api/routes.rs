//! HTTP route handlers and router assembly.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    middleware as axum_mw,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{ws, AppState};
use crate::auth::auth_middleware;
use crate::middleware::{logging, rate_limit};

/// Health check endpoint
async fn health_check() -> &'static str {
    "ChainPulse operational"
}

/// Current price snapshot from the rolling window.
async fn get_price(State(state): State<AppState>) -> Json<serde_json::Value> {
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    let snapshot = state.analyzer.lock().snapshot_price(now);
    let baseline = state.current_baseline.load_full();

    Json(serde_json::json!({
        "price": snapshot.price_usd,
        "confidence": snapshot.confidence,
        "active_tx_count": snapshot.active_tx_count,
        "estimated": snapshot.estimated,
        "deviation": snapshot.deviation,
        "baseline": baseline.map(|b| b.summary()),
    }))
}

/// Pipeline counters plus fan-out statistics.
async fn get_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    let active = state.analyzer.lock().active_tx_count();
    let stats = state.counters.snapshot(active, now);
    let baseline = state.current_baseline.load_full();

    Json(serde_json::json!({
        "pipeline": stats,
        "subscribers": state.manager.stats(),
        "baseline_height": baseline.and_then(|b| b.block_height),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Recent persisted price snapshots, newest first.
async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).min(1000);
    match state.storage.recent(limit) {
        Ok(snapshots) => Json(serde_json::json!({ "snapshots": snapshots })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    subject: String,
}

/// Dev-only token issuance; real credential policy lives with a
/// collaborator service.
async fn post_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> impl IntoResponse {
    if !state.config.dev_tokens {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "token issuance disabled" })),
        )
            .into_response();
    }

    match state.jwt.issue(&request.subject) {
        Ok(issued) => {
            info!(subject = %request.subject, "Issued dev token");
            Json(serde_json::json!(issued)).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Refresh a token inside its refresh window.
async fn post_refresh(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let token = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "missing bearer token" })),
        )
            .into_response();
    };

    match state.jwt.refresh(token) {
        Ok(issued) => Json(serde_json::json!(issued)).into_response(),
        Err(e) => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Assemble the full router: public endpoints, token-protected API, rate
/// limiting, CORS, and request logging.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::websocket_handler))
        .route("/api/auth/token", post(post_token))
        .route("/api/auth/refresh", post(post_refresh))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/price", get(get_price))
        .route("/api/stats", get(get_stats))
        .route("/api/history", get(get_history))
        .route_layer(axum_mw::from_fn_with_state(
            state.jwt.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(axum_mw::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(logging::request_logging))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use arc_swap::ArcSwapOption;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    use crate::api::ConnectionManager;
    use crate::auth::JwtHandler;
    use crate::engine::analyzer::RollingAnalyzer;
    use crate::engine::orchestrator::PipelineCounters;
    use crate::engine::storage::PriceHistoryStore;
    use crate::middleware::{RateLimitConfig, RateLimiter};
    use crate::models::Config;

    fn test_config(dev_tokens: bool) -> Config {
        Config {
            port: 0,
            rpc_url: "http://127.0.0.1:8332".to_string(),
            rpc_user: None,
            rpc_password: None,
            zmq_tx_endpoint: "tcp://127.0.0.1:28332".to_string(),
            zmq_block_endpoint: "tcp://127.0.0.1:28333".to_string(),
            window_hours: 3.0,
            baseline_blocks: 144,
            min_broadcast_interval_secs: 0.5,
            database_path: ":memory:".to_string(),
            jwt_secret: "test-secret-key-12345".to_string(),
            max_subscribers: 10,
            dev_tokens,
        }
    }

    fn test_state(dir: &tempfile::TempDir, dev_tokens: bool) -> AppState {
        let db_path = dir.path().join("history.db");
        AppState {
            analyzer: Arc::new(Mutex::new(RollingAnalyzer::new(10_800.0))),
            current_baseline: Arc::new(ArcSwapOption::empty()),
            manager: Arc::new(ConnectionManager::new(10)),
            jwt: Arc::new(JwtHandler::new("test-secret-key-12345".to_string())),
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            storage: Arc::new(
                PriceHistoryStore::new(db_path.to_str().expect("utf8 path")).expect("store"),
            ),
            counters: Arc::new(PipelineCounters::new(0.0)),
            config: Arc::new(test_config(dev_tokens)),
        }
    }

    /// Router plus a fixed peer address, since the rate limiter extracts one.
    fn test_router(state: AppState) -> Router {
        build_router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4096))))
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_router(test_state(&dir, false));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(&dir, false);
        let app = test_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/price")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // The same route answers once a valid bearer token is attached.
        let token = state.jwt.issue("alice").expect("token").token;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/price")
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dev_token_issuance_is_gated() {
        let issue_request = || {
            Request::builder()
                .method("POST")
                .uri("/api/auth/token")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"subject":"alice"}"#))
                .expect("request")
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_router(test_state(&dir, false));
        let response = app.oneshot(issue_request()).await.expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let dir = tempfile::tempdir().expect("tempdir");
        let app = test_router(test_state(&dir, true));
        let response = app.oneshot(issue_request()).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
