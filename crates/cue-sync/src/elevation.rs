//! # Elevation Queue
//!
//! Actions the server parked behind a manager PIN, held on the terminal
//! until a manager approves, the operator cancels, or they expire.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  dispatch(end T3) ──► Unauthorized { pendingId } ──► Enqueue            │
//! │                                                      │                  │
//! │                        ┌─────────────────────────────┤                  │
//! │                        ▼                             ▼                  │
//! │            submit_pin(pendingId, "4321")        TTL passes             │
//! │                        │                             │                  │
//! │        format check ───┤                     cancel_pending(server)    │
//! │                        ▼                     ActionRejected(timeout)   │
//! │      gateway.verify_pin (one attempt, bounded by action timeout)       │
//! │                        │                                                │
//! │          ok ──► entry removed, server runs the action and broadcasts   │
//! │          wrong PIN / too many attempts ──► entry kept, error returned  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! PIN verification is never retried automatically: every attempt counts
//! against the server's rate limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cue_core::{validation, CoreError, CoreResult, Elevation, RejectReason, TableAction};

use crate::cache::TerminalEvent;
use crate::error::{SyncError, SyncResult};
use crate::gateway::HallGateway;

/// Longest pause between expiry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Pending Elevation
// =============================================================================

/// One action waiting for a manager PIN.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingElevation {
    /// Id the server parked the action under.
    pub pending_id: String,
    pub action: TableAction,
    pub required: Elevation,
    pub created_at: DateTime<Utc>,
}

impl PendingElevation {
    pub fn new(pending_id: impl Into<String>, action: TableAction) -> Self {
        let required = action.kind().required_elevation();
        PendingElevation {
            pending_id: pending_id.into(),
            action,
            required,
            created_at: Utc::now(),
        }
    }
}

struct Entry {
    pending: PendingElevation,
    expires_at: Instant,
}

enum Command {
    Enqueue(PendingElevation),
    SubmitPin {
        pending_id: String,
        pin: String,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Cancel {
        pending_id: String,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<PendingElevation>>,
    },
    Shutdown,
}

// =============================================================================
// Handle
// =============================================================================

/// Handle for the elevation actor.
#[derive(Clone)]
pub struct ElevationHandle {
    commands_tx: mpsc::Sender<Command>,
}

impl ElevationHandle {
    /// Parks an action the server refused with a `pending_id`.
    pub async fn enqueue(&self, pending: PendingElevation) -> SyncResult<()> {
        self.send(Command::Enqueue(pending)).await
    }

    /// Presents a manager PIN for one parked action.
    pub async fn submit_pin(&self, pending_id: &str, pin: &str) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubmitPin {
            pending_id: pending_id.to_string(),
            pin: pin.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| CoreError::NetworkFailure("Elevation queue stopped".into()))?
    }

    /// Withdraws a parked action here and on the server.
    pub async fn cancel(&self, pending_id: &str) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            pending_id: pending_id.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| CoreError::NetworkFailure("Elevation queue stopped".into()))?
    }

    /// Parked actions, oldest first.
    pub async fn list(&self) -> Vec<PendingElevation> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands_tx
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelError("Elevation queue stopped".into()))
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Owns the parked actions. Runs until shut down.
pub struct ElevationQueue {
    gateway: Arc<dyn HallGateway>,
    entries: HashMap<String, Entry>,
    ttl: Duration,
    verify_timeout: Duration,
    commands_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<TerminalEvent>,
}

impl ElevationQueue {
    /// Creates the actor and spawns it. Expiry notices go to `events_tx`.
    pub fn spawn(
        gateway: Arc<dyn HallGateway>,
        ttl: Duration,
        verify_timeout: Duration,
        events_tx: mpsc::Sender<TerminalEvent>,
    ) -> ElevationHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let queue = ElevationQueue {
            gateway,
            entries: HashMap::new(),
            ttl,
            verify_timeout,
            commands_rx,
            events_tx,
        };
        tokio::spawn(queue.run());
        ElevationHandle { commands_tx }
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL.min(self.ttl));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(Command::Enqueue(pending)) => self.enqueue(pending),
                    Some(Command::SubmitPin { pending_id, pin, reply }) => {
                        let result = self.submit_pin(&pending_id, &pin).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Cancel { pending_id, reply }) => {
                        let result = self.cancel(&pending_id).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::List { reply }) => {
                        let _ = reply.send(self.list());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = sweep.tick() => self.expire(Instant::now()).await,
            }
        }

        debug!("Elevation queue stopped");
    }

    fn enqueue(&mut self, pending: PendingElevation) {
        info!(
            pending_id = %pending.pending_id,
            action = %pending.action.kind().as_str(),
            table_id = %pending.action.table_id(),
            "Action waiting for manager PIN"
        );
        self.entries.insert(
            pending.pending_id.clone(),
            Entry {
                pending,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn submit_pin(&mut self, pending_id: &str, pin: &str) -> CoreResult<()> {
        validation::validate_pin_format(pin)?;
        if !self.entries.contains_key(pending_id) {
            return Err(CoreError::not_found("pending action", pending_id));
        }

        let verdict = tokio::time::timeout(self.verify_timeout, self.gateway.verify_pin(pending_id, pin))
            .await
            .map_err(|_| CoreError::NetworkFailure("PIN verification timed out".into()))?;

        match verdict {
            Ok(()) => {
                self.entries.remove(pending_id);
                info!(pending_id = %pending_id, "Manager PIN accepted");
                Ok(())
            }
            Err(e @ CoreError::NotFound { .. }) => {
                // The server already dropped it.
                self.entries.remove(pending_id);
                Err(e)
            }
            Err(e) => {
                warn!(pending_id = %pending_id, reason = %e.reason(), "Manager PIN refused");
                Err(e)
            }
        }
    }

    async fn cancel(&mut self, pending_id: &str) -> CoreResult<()> {
        if self.entries.remove(pending_id).is_none() {
            return Err(CoreError::not_found("pending action", pending_id));
        }
        match tokio::time::timeout(self.verify_timeout, self.gateway.cancel_pending(pending_id)).await {
            Ok(Ok(())) | Ok(Err(CoreError::NotFound { .. })) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::NetworkFailure("Cancel timed out".into())),
        }
    }

    fn list(&self) -> Vec<PendingElevation> {
        let mut pending: Vec<PendingElevation> =
            self.entries.values().map(|e| e.pending.clone()).collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    async fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for pending_id in expired {
            let Some(entry) = self.entries.remove(&pending_id) else {
                continue;
            };
            info!(pending_id = %pending_id, "Manager approval expired");

            if let Ok(Err(e)) =
                tokio::time::timeout(self.verify_timeout, self.gateway.cancel_pending(&pending_id)).await
            {
                debug!(pending_id = %pending_id, error = %e, "Server did not cancel expired action");
            }

            let action = entry.pending.action;
            let event = TerminalEvent::ActionRejected {
                table_id: action.table_id().to_string(),
                action_id: Some(pending_id),
                reason: RejectReason::Timeout,
                message: format!("Approval to {} expired", action.kind().as_str()),
            };
            if self.events_tx.send(event).await.is_err() {
                debug!("Terminal events closed; dropping expiry notice");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::{BoxFuture, FutureExt};
    use std::sync::Mutex;

    /// Accepts PIN "4321" and records cancellations.
    #[derive(Default)]
    struct PinServer {
        cancelled: Mutex<Vec<String>>,
        verify_calls: Mutex<u32>,
        stall: bool,
    }

    impl HallGateway for PinServer {
        fn submit<'a>(&'a self, _: &'a str, _: &'a TableAction) -> BoxFuture<'a, CoreResult<()>> {
            async { Ok(()) }.boxed()
        }

        fn verify_pin<'a>(&'a self, pending_id: &'a str, pin: &'a str) -> BoxFuture<'a, CoreResult<()>> {
            async move {
                *self.verify_calls.lock().unwrap() += 1;
                if self.stall {
                    std::future::pending::<()>().await;
                }
                if pin == "4321" {
                    Ok(())
                } else {
                    Err(CoreError::Unauthorized {
                        action: "end".into(),
                        pending_id: Some(pending_id.to_string()),
                    })
                }
            }
            .boxed()
        }

        fn cancel_pending<'a>(&'a self, pending_id: &'a str) -> BoxFuture<'a, CoreResult<()>> {
            async move {
                self.cancelled.lock().unwrap().push(pending_id.to_string());
                Ok(())
            }
            .boxed()
        }
    }

    fn end_t3() -> TableAction {
        TableAction::End { table_id: "t3".into() }
    }

    fn spawn(server: Arc<PinServer>) -> (ElevationHandle, mpsc::Receiver<TerminalEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);
        let handle = ElevationQueue::spawn(server, Duration::from_secs(60), Duration::from_secs(5), events_tx);
        (handle, events_rx)
    }

    #[tokio::test]
    async fn test_wrong_pin_keeps_entry_then_correct_pin_clears_it() {
        let server = Arc::new(PinServer::default());
        let (queue, _events) = spawn(server.clone());

        queue.enqueue(PendingElevation::new("p1", end_t3())).await.unwrap();
        assert_eq!(queue.list().await[0].required, Elevation::Manager);

        let err = queue.submit_pin("p1", "0000").await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::Unauthorized);
        assert_eq!(queue.list().await.len(), 1);

        queue.submit_pin("p1", "4321").await.unwrap();
        assert!(queue.list().await.is_empty());
        assert_eq!(*server.verify_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_pin_never_reaches_server() {
        let server = Arc::new(PinServer::default());
        let (queue, _events) = spawn(server.clone());
        queue.enqueue(PendingElevation::new("p1", end_t3())).await.unwrap();

        let err = queue.submit_pin("p1", "12").await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::Validation);
        assert_eq!(*server.verify_calls.lock().unwrap(), 0);

        let err = queue.submit_pin("unknown", "4321").await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_verification_times_out_once() {
        let server = Arc::new(PinServer {
            stall: true,
            ..Default::default()
        });
        let (queue, _events) = spawn(server.clone());
        queue.enqueue(PendingElevation::new("p1", end_t3())).await.unwrap();

        let err = queue.submit_pin("p1", "4321").await.unwrap_err();
        assert_eq!(err.reason(), RejectReason::NetworkFailure);
        assert_eq!(*server.verify_calls.lock().unwrap(), 1);
        assert_eq!(queue.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_notifies_server() {
        let server = Arc::new(PinServer::default());
        let (queue, _events) = spawn(server.clone());
        queue.enqueue(PendingElevation::new("p1", end_t3())).await.unwrap();

        queue.cancel("p1").await.unwrap();
        assert!(queue.list().await.is_empty());
        assert_eq!(*server.cancelled.lock().unwrap(), vec!["p1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_cancels_and_reports_timeout() {
        let server = Arc::new(PinServer::default());
        let (queue, mut events) = spawn(server.clone());
        queue.enqueue(PendingElevation::new("p1", end_t3())).await.unwrap();

        tokio::time::sleep(Duration::from_secs(62)).await;

        match events.recv().await.unwrap() {
            TerminalEvent::ActionRejected { table_id, reason, .. } => {
                assert_eq!(table_id, "t3");
                assert_eq!(reason, RejectReason::Timeout);
            }
            other => panic!("Expected rejection, got {other:?}"),
        }
        assert!(queue.list().await.is_empty());
        assert_eq!(*server.cancelled.lock().unwrap(), vec!["p1".to_string()]);
    }
}
