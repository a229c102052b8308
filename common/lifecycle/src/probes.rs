//! K8s readiness and liveness probes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;

use crate::context::Context;
use crate::signals::HandlerState;

/// Returns 200 while the group runs and 503 once shutdown begins. With a signal state
/// attached, that is as soon as the first signal arrives, so a load balancer sees the
/// instance go unready during the delay before the root context is canceled.
#[derive(Clone, Debug)]
pub struct ReadinessHandler {
    ctx: Context,
    signal_state: Option<watch::Receiver<HandlerState>>,
}

impl ReadinessHandler {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            signal_state: None,
        }
    }

    pub fn with_signal_state(mut self, state: watch::Receiver<HandlerState>) -> Self {
        self.signal_state = Some(state);
        self
    }

    pub async fn check(&self) -> StatusCode {
        let signaled = self
            .signal_state
            .as_ref()
            .is_some_and(|state| *state.borrow() != HandlerState::Armed);
        if signaled || self.ctx.is_done() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }
}

/// Liveness means "the process is reachable", so it is always healthy.
pub struct LivenessStatus;

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        (StatusCode::OK, "ok").into_response()
    }
}

/// `/_readiness`, `/_liveness` and `/healthz`. Use [`Group::readiness`](crate::Group::readiness)
/// for a handler that follows the group's signal handler.
pub fn router(readiness: ReadinessHandler) -> Router {
    Router::new()
        .route(
            "/_readiness",
            get(move || {
                let readiness = readiness.clone();
                async move { readiness.check().await }
            }),
        )
        .route("/_liveness", get(|| async { LivenessStatus }))
        .route("/healthz", get(|| async { LivenessStatus }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    use super::*;

    async fn status(router: &Router, path: &str) -> StatusCode {
        router
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn readiness_flips_on_shutdown() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let app = router(ReadinessHandler::new(ctx));

        assert_eq!(status(&app, "/_readiness").await, StatusCode::OK);
        cancel.cancel();
        assert_eq!(
            status(&app, "/_readiness").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn readiness_flips_on_first_signal() {
        let (ctx, _cancel) = Context::with_cancel(&Context::background());
        let (state, state_rx) = watch::channel(HandlerState::Armed);
        let app = router(ReadinessHandler::new(ctx.clone()).with_signal_state(state_rx));

        assert_eq!(status(&app, "/_readiness").await, StatusCode::OK);
        state.send_replace(HandlerState::Delaying);
        assert!(!ctx.is_done());
        assert_eq!(
            status(&app, "/_readiness").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(&app, "/_liveness").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let app = router(ReadinessHandler::new(ctx));
        cancel.cancel();

        assert_eq!(status(&app, "/_liveness").await, StatusCode::OK);
        assert_eq!(status(&app, "/healthz").await, StatusCode::OK);
        assert_eq!(status(&app, "/missing").await, StatusCode::NOT_FOUND);
    }
}
