use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::context::AgentContext;
use crate::models::{HealthResponse, StateResponse};

// ── Router ──────────────────────────────────────────────────────

pub fn build_router(ctx: Arc<AgentContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(state))
        .route("/snapshot", get(snapshot))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

// ── Handlers ────────────────────────────────────────────────────

async fn health(State(ctx): State<Arc<AgentContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        hostname: ctx.identity.hostname.clone(),
        uptime_secs: ctx.start_time.elapsed().as_secs(),
    })
}

async fn state(State(ctx): State<Arc<AgentContext>>) -> impl IntoResponse {
    let current_alert = ctx.warn.current_key().await;

    Json(StateResponse {
        current_alert,
        alerting: ctx.warn.is_alerting().await,
        active_events: ctx.ledger.len(),
        camera_connected: ctx.camera.is_connected(),
        frame_age_ms: ctx.camera.frame_age().map(|d| d.as_millis()),
        recorder_connected: ctx.killer.recorder_connected().await,
    })
}

#[derive(Deserialize)]
struct SnapshotQuery {
    quality: Option<u8>,
}

async fn snapshot(
    State(ctx): State<Arc<AgentContext>>,
    Query(q): Query<SnapshotQuery>,
) -> Response {
    let quality = q.quality.unwrap_or(ctx.config.camera.quality).min(100);
    let camera = ctx.camera.clone();

    // JPEG encoding is CPU-bound
    match tokio::task::spawn_blocking(move || camera.snapshot(quality)).await {
        Ok(Some(jpeg)) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "success": false,
                "error": "No frame available",
            })),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::effects::fake::FakeLauncher;
    use crate::killer::SysinfoTerminator;
    use crate::link::Identity;

    fn ctx() -> Arc<AgentContext> {
        let config = AppConfig::parse(
            r#"
            [server]
            url = "ws://127.0.0.1:9"
            client_name = "api-test"

            [camera]
            url = "file:///nonexistent.jpg"
            "#,
        )
        .unwrap();
        let identity = Identity {
            hostname: "desk-9".into(),
            ip: "127.0.0.1".into(),
            client_name: "api-test".into(),
        };
        AgentContext::with_parts(
            config,
            identity,
            Arc::new(FakeLauncher::default()),
            Arc::new(SysinfoTerminator),
            None,
        )
    }

    #[tokio::test]
    async fn state_reports_current_alert() {
        let ctx = ctx();
        ctx.warn.start("motion", "MOVEMENT DETECTED", None, true, false).await;

        let resp = build_router(ctx)
            .oneshot(Request::get("/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["current_alert"], "motion");
        assert_eq!(v["alerting"], true);
        assert_eq!(v["camera_connected"], false);
        assert_eq!(v["recorder_connected"], false);
    }

    #[tokio::test]
    async fn snapshot_without_camera_is_unavailable() {
        let resp = build_router(ctx())
            .oneshot(Request::get("/snapshot?quality=50").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_names_host() {
        let resp = build_router(ctx())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["hostname"], "desk-9");
        assert_eq!(v["status"], "ok");
    }
}
