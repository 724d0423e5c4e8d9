//! HTTP push API.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use huddle_common::{AppError, AppResult};
use huddle_queue::{DelayedQueue, InstantQueue, PushArg, Store};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    queues: Arc<HashMap<String, DelayedQueue>>,
    instant: InstantQueue,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        queues: HashMap<String, DelayedQueue>,
        instant: InstantQueue,
    ) -> Self {
        Self {
            store,
            queues: Arc::new(queues),
            instant,
        }
    }
}

/// Number of entries accepted by a push.
#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

/// Push to a delayed queue.
async fn push_delayed(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(arg): Json<PushArg>,
) -> AppResult<Json<CountResponse>> {
    let queue = state
        .queues
        .get(&name)
        .ok_or_else(|| AppError::NotFound(format!("queue {name}")))?;
    let count = queue.push_arg(&arg).await?;
    Ok(Json(CountResponse { count }))
}

/// Forward a push right away.
async fn push_instant(
    State(state): State<AppState>,
    Json(arg): Json<PushArg>,
) -> AppResult<Json<CountResponse>> {
    let count = state.instant.push(arg)?;
    Ok(Json(CountResponse { count }))
}

async fn health(State(state): State<AppState>) -> AppResult<Json<Value>> {
    if let Err(e) = state.store.ping().await {
        warn!(error = %e, "Health check failed");
        return Err(e.into());
    }
    Ok(Json(json!({ "status": "ok" })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/queues/{name}/push", post(push_delayed))
        .route("/instant/push", post(push_instant))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
        response::Response,
    };
    use huddle_queue::{MemoryStore, Services};
    use tower::ServiceExt;

    use super::*;

    fn create_test_state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let mut queues = HashMap::new();
        queues.insert(
            "head10".to_string(),
            DelayedQueue::head("head10", 10, store.clone()),
        );
        let state = AppState::new(
            store.clone(),
            queues,
            InstantQueue::new(Arc::new(Services::new())),
        );
        (store, state)
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> Response {
        app.oneshot(
            Request::builder()
                .uri(uri)
                .method("POST")
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_push_to_delayed_queue() {
        let (_store, state) = create_test_state();
        let app = router(state.clone());

        let response = post_json(
            app,
            "/queues/head10/push",
            r#"{"service":"Conversation","method":"Update","merge_key":"cross1",
                "tos":[{"provider":"email","external_id":"a@b.c"},
                       {"provider":"email","external_id":"d@e.f"}],
                "data":{"post":"hi"}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"count": 2}));
        let queue = state.queues.get("head10").unwrap();
        assert_eq!(queue.repository().schedule().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_push_to_unknown_queue_is_not_found() {
        let (_store, state) = create_test_state();

        let response = post_json(
            router(state),
            "/queues/head99/push",
            r#"{"service":"Conversation","method":"Update"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_push_with_empty_method_is_rejected() {
        let (_store, state) = create_test_state();

        let response = post_json(
            router(state),
            "/queues/head10/push",
            r#"{"service":"Conversation","method":""}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_instant_push_unknown_service() {
        let (_store, state) = create_test_state();

        let response = post_json(
            router(state),
            "/instant/push",
            r#"{"service":"Conversation","method":"Update"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let (store, state) = create_test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok"}));

        store.set_unavailable(true);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
