//! # Hall Gateway
//!
//! The request/response side of a terminal: table actions and the manager
//! PIN flow go to the hall server as REST calls, while updates come back over
//! the event channel.
//!
//! ## Calls
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  submit(start)     ──► POST   /api/tables/{id}/start {tariffId, ...}    │
//! │  submit(pause)     ──► POST   /api/tables/{id}/pause {reason}           │
//! │  submit(end, ...)  ──► POST   /api/tables/{id}/{verb}                   │
//! │  submit(delete)    ──► DELETE /api/tables/{id}                          │
//! │  verify_pin        ──► POST   /api/pin/verify {pendingId, pin}          │
//! │  cancel_pending    ──► POST   /api/pin/cancel {pendingId}               │
//! │                                                                         │
//! │  2xx      ──► Ok                                                        │
//! │  4xx/5xx  ──► RejectionBody { code, message, pendingId? } ──► CoreError │
//! │  no reply ──► NetworkFailure (never retried)                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use futures_util::future::{BoxFuture, FutureExt};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

use cue_core::{CoreError, CoreResult, RejectReason, TableAction};

use crate::config::TerminalConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Gateway Trait
// =============================================================================

/// Calls a terminal makes against the hall server.
///
/// Every call resolves to the server's verdict. `Unauthorized` from
/// [`submit`](HallGateway::submit) carries the `pending_id` the action was
/// parked under.
pub trait HallGateway: Send + Sync + 'static {
    /// Submits one mutating table action. `action_id` identifies it in logs.
    fn submit<'a>(&'a self, action_id: &'a str, action: &'a TableAction) -> BoxFuture<'a, CoreResult<()>>;

    /// Presents a manager PIN for a parked action. On success the server runs
    /// the action and broadcasts the result.
    fn verify_pin<'a>(&'a self, pending_id: &'a str, pin: &'a str) -> BoxFuture<'a, CoreResult<()>>;

    /// Withdraws a parked action.
    fn cancel_pending<'a>(&'a self, pending_id: &'a str) -> BoxFuture<'a, CoreResult<()>>;
}

// =============================================================================
// Rejection Body
// =============================================================================

/// JSON body of every non-2xx answer from the hall server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub code: RejectReason,
    pub message: String,

    /// Verb that needs elevation (`Unauthorized` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Id the action was parked under, for the PIN flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&CoreError> for RejectionBody {
    fn from(error: &CoreError) -> Self {
        let (action, pending_id, retry_after_secs) = match error {
            CoreError::Unauthorized { action, pending_id } => (Some(action.clone()), pending_id.clone(), None),
            CoreError::TooManyAttempts { retry_after_secs } => (None, None, Some(*retry_after_secs)),
            _ => (None, None, None),
        };

        RejectionBody {
            code: error.reason(),
            message: error.to_string(),
            action,
            pending_id,
            retry_after_secs,
        }
    }
}

impl RejectionBody {
    /// Rebuilds the error on the terminal side.
    pub fn into_error(self) -> CoreError {
        match self.code {
            RejectReason::Unauthorized => CoreError::Unauthorized {
                action: self.action.unwrap_or_else(|| "action".into()),
                pending_id: self.pending_id,
            },
            RejectReason::TooManyAttempts => CoreError::TooManyAttempts {
                retry_after_secs: self.retry_after_secs.unwrap_or(0),
            },
            RejectReason::NetworkFailure => CoreError::NetworkFailure(self.message),
            reason => CoreError::Rejected {
                reason,
                message: self.message,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct PinVerdict {
    success: bool,
}

// =============================================================================
// REST Gateway
// =============================================================================

/// [`HallGateway`] over the hall server's REST API.
#[derive(Debug, Clone)]
pub struct RestGateway {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl RestGateway {
    /// Builds a client bounded by the configured action timeout.
    pub fn new(config: &TerminalConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.action_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(RestGateway {
            client,
            base: config.api_base_url()?,
            token: config.hub.token.clone(),
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        action_id: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> CoreResult<reqwest::Response> {
        let url = self
            .base
            .join(path)
            .map_err(|e| CoreError::NetworkFailure(format!("Bad API path {path}: {e}")))?;

        let mut request = self.client.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(action_id) = action_id {
            request = request.header("x-action-id", action_id);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::NetworkFailure(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        debug!(%status, path, "Hall server rejected call");
        match response.json::<RejectionBody>().await {
            Ok(body) => Err(body.into_error()),
            Err(_) => Err(CoreError::NetworkFailure(format!("Hall server answered {status}"))),
        }
    }

    async fn submit_action(&self, action_id: &str, action: &TableAction) -> CoreResult<()> {
        let table = action.table_id();
        let (method, path, body) = match action {
            TableAction::Start {
                tariff_id,
                player_count,
                ..
            } => (
                Method::POST,
                format!("api/tables/{table}/start"),
                Some(json!({ "tariffId": tariff_id, "playerCount": player_count })),
            ),
            TableAction::Pause { reason, .. } => (
                Method::POST,
                format!("api/tables/{table}/pause"),
                Some(json!({ "reason": reason })),
            ),
            TableAction::Delete { .. } => (Method::DELETE, format!("api/tables/{table}"), None),
            other => (
                Method::POST,
                format!("api/tables/{table}/{}", other.kind().as_str()),
                None,
            ),
        };

        self.call(method, &path, Some(action_id), body).await.map(|_| ())
    }

    async fn verify(&self, pending_id: &str, pin: &str) -> CoreResult<()> {
        let response = self
            .call(
                Method::POST,
                "api/pin/verify",
                None,
                Some(json!({ "pendingId": pending_id, "pin": pin })),
            )
            .await?;

        let verdict: PinVerdict = response
            .json()
            .await
            .map_err(|e| CoreError::NetworkFailure(e.to_string()))?;

        if verdict.success {
            Ok(())
        } else {
            Err(CoreError::Unauthorized {
                action: "pin".into(),
                pending_id: Some(pending_id.to_string()),
            })
        }
    }
}

impl HallGateway for RestGateway {
    fn submit<'a>(&'a self, action_id: &'a str, action: &'a TableAction) -> BoxFuture<'a, CoreResult<()>> {
        self.submit_action(action_id, action).boxed()
    }

    fn verify_pin<'a>(&'a self, pending_id: &'a str, pin: &'a str) -> BoxFuture<'a, CoreResult<()>> {
        self.verify(pending_id, pin).boxed()
    }

    fn cancel_pending<'a>(&'a self, pending_id: &'a str) -> BoxFuture<'a, CoreResult<()>> {
        async move {
            self.call(
                Method::POST,
                "api/pin/cancel",
                None,
                Some(json!({ "pendingId": pending_id })),
            )
            .await
            .map(|_| ())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn serve(router: Router) -> RestGateway {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut config = TerminalConfig::default();
        config.hub.url = Some(format!("ws://{addr}/ws"));
        config.hub.token = Some("staff-token".into());
        RestGateway::new(&config).unwrap()
    }

    fn hall() -> Router {
        Router::new()
            .route(
                "/api/tables/{id}/end",
                post(|Path(_id): Path<String>| async {
                    let body = RejectionBody::from(&CoreError::Unauthorized {
                        action: "end".into(),
                        pending_id: Some("p-9".into()),
                    });
                    (StatusCode::FORBIDDEN, Json(body))
                }),
            )
            .route(
                "/api/tables/{id}/resume",
                post(|Path(id): Path<String>| async move {
                    let err = CoreError::invalid_transition("session", id, "active", "resume");
                    (StatusCode::UNPROCESSABLE_ENTITY, Json(RejectionBody::from(&err)))
                }),
            )
            .route(
                "/api/tables/{id}/pause",
                post(|Path(_id): Path<String>| async { Json(json!({})) }),
            )
            .route(
                "/api/pin/verify",
                post(|Json(body): Json<serde_json::Value>| async move {
                    Json(json!({ "success": body["pin"] == "4321" }))
                }),
            )
    }

    #[test]
    fn test_rejection_body_keeps_pending_id() {
        let err = CoreError::Unauthorized {
            action: "finalize".into(),
            pending_id: Some("p-1".into()),
        };
        let json = serde_json::to_string(&RejectionBody::from(&err)).unwrap();
        assert!(json.contains("\"code\":\"unauthorized\""));
        assert!(json.contains("\"pendingId\":\"p-1\""));

        let back: RejectionBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_error(), err);
    }

    #[test]
    fn test_rejection_body_relays_reason_and_message() {
        let err = CoreError::conflict("table", "T3", "table is occupied");
        let relayed = RejectionBody::from(&err).into_error();
        assert_eq!(relayed.reason(), RejectReason::Conflict);
        assert_eq!(relayed.to_string(), err.to_string());
    }

    #[tokio::test]
    async fn test_submit_maps_server_verdicts() {
        let gateway = serve(hall()).await;

        let pause = TableAction::Pause {
            table_id: "t1".into(),
            reason: Some("break".into()),
        };
        gateway.submit("a1", &pause).await.unwrap();

        let end = TableAction::End { table_id: "t1".into() };
        match gateway.submit("a2", &end).await {
            Err(CoreError::Unauthorized { pending_id, .. }) => assert_eq!(pending_id.as_deref(), Some("p-9")),
            other => panic!("Expected unauthorized, got {other:?}"),
        }

        let resume = TableAction::Resume { table_id: "t1".into() };
        let err = gateway.submit("a3", &resume).await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::InvalidTransition);
    }

    #[tokio::test]
    async fn test_verify_pin_success_flag() {
        let gateway = serve(hall()).await;
        gateway.verify_pin("p-9", "4321").await.unwrap();

        let err = gateway.verify_pin("p-9", "0000").await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::Unauthorized);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_failure() {
        let mut config = TerminalConfig::default();
        config.hub.url = Some("ws://127.0.0.1:1/ws".into());
        let gateway = RestGateway::new(&config).unwrap();

        let err = gateway
            .submit("a1", &TableAction::Clean { table_id: "t1".into() })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
