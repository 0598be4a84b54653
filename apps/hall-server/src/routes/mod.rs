//! REST routes and router assembly.
//!
//! ```text
//! /api/tables/...     tables.rs    table registry, table actions, layouts
//! /api/sessions/...   sessions.rs  session reads, charges, discounts
//! /api/tariffs/...    tariffs.rs   tariff definitions
//! /api/pin/...        pin.rs       manager PIN flow
//! /health             health.rs    liveness
//! /ws                 cue-sync     event channel
//! ```

use std::sync::Arc;

use axum::extract::{FromRequest, Request};
use axum::http::HeaderMap;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::AppState;

pub mod health;
pub mod pin;
pub mod sessions;
pub mod tables;
pub mod tariffs;

/// Header carrying the terminal's id for one action, for log correlation.
pub const ACTION_ID_HEADER: &str = "x-action-id";

/// Build a router with all API routes registered (no middleware, no state)
pub fn build_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(tables::router())
        .merge(sessions::router())
        .merge(tariffs::router())
        .merge(pin::router())
        .merge(health::router())
}

/// The full application: API routes with middleware, plus the hub's `/ws`.
pub fn build_app(state: Arc<AppState>) -> Router {
    let hub = state.hub.router();
    build_router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(hub)
}

/// JSON body whose parse failures come back as a `validation` rejection.
pub struct Body<T>(pub T);

impl<S, T> FromRequest<S> for Body<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Ok(Body(value))
    }
}

pub(crate) fn action_id(headers: &HeaderMap) -> &str {
    headers
        .get(ACTION_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as HttpBody;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use cue_core::{Role, TableStatus};

    use crate::testing::{self, MANAGER_PIN};

    struct Client {
        app: Router,
        staff: String,
        manager: String,
    }

    impl Client {
        fn new(state: &Arc<AppState>) -> Self {
            Client {
                app: build_app(state.clone()),
                staff: state.jwt.issue("staff-1", Role::Staff, 3600).unwrap(),
                manager: state.jwt.issue("manager-1", Role::Manager, 3600).unwrap(),
            }
        }

        async fn call(&self, token: Option<&str>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let mut request = Request::builder()
                .method(method)
                .uri(uri)
                .header("x-terminal-id", "bar-1");
            if let Some(token) = token {
                request = request.header("authorization", format!("Bearer {token}"));
            }
            let request = match body {
                Some(body) => request
                    .header("content-type", "application/json")
                    .body(HttpBody::from(body.to_string()))
                    .unwrap(),
                None => request.body(HttpBody::empty()).unwrap(),
            };

            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }

        async fn staff(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            self.call(Some(self.staff.as_str()), method, uri, body).await
        }

        async fn manager(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            self.call(Some(self.manager.as_str()), method, uri, body).await
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = testing::app().await;
        let client = Client::new(&app);

        let (status, body) = client.call(None, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let app = testing::app().await;
        let client = Client::new(&app);

        let (status, body) = client.call(None, Method::GET, "/api/tables", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_second_start_is_conflict() {
        let (app, table, tariff) = testing::seeded().await;
        let client = Client::new(&app);
        let start = json!({ "tariffId": tariff.id, "playerCount": 2 });
        let uri = format!("/api/tables/{}/start", table.id);

        let (status, first) = client.staff(Method::POST, &uri, Some(start.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["table"]["status"], "occupied");

        let (status, body) = client.staff(Method::POST, &uri, Some(start)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (_, table_now) = client
            .staff(Method::GET, &format!("/api/tables/{}", table.id), None)
            .await;
        assert_eq!(table_now, first["table"]);
    }

    #[tokio::test]
    async fn test_staff_end_goes_through_pin() {
        let (app, table, tariff) = testing::seeded().await;
        let client = Client::new(&app);
        let base = format!("/api/tables/{}", table.id);

        client
            .staff(
                Method::POST,
                &format!("{base}/start"),
                Some(json!({ "tariffId": tariff.id, "playerCount": 2 })),
            )
            .await;

        let (status, body) = client.staff(Method::POST, &format!("{base}/end"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "unauthorized");
        let pending_id = body["pendingId"].as_str().unwrap().to_string();

        let (status, body) = client
            .staff(
                Method::POST,
                "/api/pin/verify",
                Some(json!({ "pendingId": pending_id, "pin": "1357" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);

        let (status, body) = client
            .staff(
                Method::POST,
                "/api/pin/verify",
                Some(json!({ "pendingId": pending_id, "pin": MANAGER_PIN })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["session"]["status"], "ended");
        assert_eq!(body["result"]["table"]["status"], "cleaning");

        let (_, session) = client.staff(Method::GET, &format!("{base}/session"), None).await;
        assert_eq!(session["status"], "ended");
    }

    #[tokio::test]
    async fn test_pin_attempts_are_rate_limited() {
        let (app, table, tariff) = testing::seeded().await;
        let client = Client::new(&app);
        let base = format!("/api/tables/{}", table.id);

        client
            .staff(
                Method::POST,
                &format!("{base}/start"),
                Some(json!({ "tariffId": tariff.id, "playerCount": 2 })),
            )
            .await;
        let (_, body) = client.staff(Method::POST, &format!("{base}/finalize"), None).await;
        let pending_id = body["pendingId"].as_str().unwrap().to_string();

        for _ in 0..app.config.access.max_attempts {
            let (_, body) = client
                .staff(
                    Method::POST,
                    "/api/pin/verify",
                    Some(json!({ "pendingId": pending_id, "pin": "0000" })),
                )
                .await;
            assert_eq!(body["success"], false);
        }

        let (status, body) = client
            .staff(
                Method::POST,
                "/api/pin/verify",
                Some(json!({ "pendingId": pending_id, "pin": MANAGER_PIN })),
            )
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], "too_many_attempts");
        assert_eq!(
            app.tables.get(&table.id).await.unwrap().status,
            TableStatus::Occupied
        );
    }

    #[tokio::test]
    async fn test_cancelled_pin_flow_changes_nothing() {
        let (app, table, tariff) = testing::seeded().await;
        let client = Client::new(&app);
        let base = format!("/api/tables/{}", table.id);

        client
            .staff(
                Method::POST,
                &format!("{base}/start"),
                Some(json!({ "tariffId": tariff.id, "playerCount": 2 })),
            )
            .await;
        let before = app.tables.get(&table.id).await.unwrap();

        let (_, body) = client.staff(Method::POST, &format!("{base}/end"), None).await;
        let pending_id = body["pendingId"].as_str().unwrap().to_string();

        let (status, body) = client
            .staff(Method::POST, "/api/pin/cancel", Some(json!({ "pendingId": pending_id })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);

        let (status, _) = client
            .staff(
                Method::POST,
                "/api/pin/verify",
                Some(json!({ "pendingId": pending_id, "pin": MANAGER_PIN })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(app.tables.get(&table.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_table_admin_needs_manager() {
        let app = testing::app().await;
        let client = Client::new(&app);
        let create = json!({ "name": "Snooker 1", "capacity": 2, "room": "vip" });

        let (status, _) = client.staff(Method::POST, "/api/tables", Some(create.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, table) = client.manager(Method::POST, "/api/tables", Some(create)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(table["room"], "vip");

        let id = table["id"].as_str().unwrap();
        let (status, table) = client
            .manager(
                Method::POST,
                &format!("/api/tables/{id}/maintenance"),
                Some(json!({ "on": true })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(table["status"], "maintenance");

        let (status, body) = client
            .manager(
                Method::POST,
                &format!("/api/tables/{id}/maintenance"),
                Some(json!({ "on": true })),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "invalid_transition");
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation() {
        let (app, table, _) = testing::seeded().await;
        let client = Client::new(&app);

        let (status, body) = client
            .staff(
                Method::POST,
                &format!("/api/tables/{}/start", table.id),
                Some(json!({ "playerCount": "two" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
    }

    #[tokio::test]
    async fn test_layout_activation_is_broadcast() {
        let app = testing::app().await;
        let client = Client::new(&app);
        let mut events = app.hub.subscribe();

        let (status, _) = client
            .manager(Method::POST, "/api/layouts/evening/activate", None)
            .await;
        assert_eq!(status, StatusCode::OK);

        match events.recv().await.unwrap() {
            cue_sync::SyncMessage::LayoutActivated { layout_id } => assert_eq!(layout_id, "evening"),
            other => panic!("Expected layout_activated, got {other:?}"),
        }
    }
}
