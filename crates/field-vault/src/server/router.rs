//! Axum router construction.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
///
/// Requests running longer than `state.request_timeout` get a 408.
pub fn build(state: AppState) -> Router {
    let timeout = state.request_timeout;
    Router::new()
        .route("/fields/encrypt", post(handlers::encrypt_field))
        .route("/fields/decrypt", post(handlers::decrypt_field))
        .route("/fields/encrypt-batch", post(handlers::encrypt_batch))
        .route("/fields/decrypt-batch", post(handlers::decrypt_batch))
        .route("/records/encrypt", post(handlers::encrypt_record))
        .route("/records/decrypt", post(handlers::decrypt_record))
        .route("/sessions/:tenant_id", get(handlers::session_info))
        .route(
            "/sessions/:tenant_id/invalidate",
            post(handlers::invalidate_session),
        )
        .route("/keys/rotate", post(handlers::rotate))
        .route("/contexts/:context_id", delete(handlers::release_context))
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .layer(CompressionLayer::new())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::secret::{MockSecretSource, RootSecret};
    use crate::server::test_support;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = build(test_support::state(10));
        let req = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn health_route_exists() {
        let app = build(test_support::state(10));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let app = build(test_support::state(10));
        let req = Request::builder()
            .uri("/fields/encrypt")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 405);
    }

    #[tokio::test]
    async fn slow_requests_time_out() {
        let mut source = MockSecretSource::new();
        source.expect_fetch().returning(|| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(RootSecret::new(vec![0x24; 32]))
        });
        let state = test_support::state_with(Arc::new(source), 10)
            .with_request_timeout(Duration::from_millis(50));
        let app = build(state);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 408);
    }
}
