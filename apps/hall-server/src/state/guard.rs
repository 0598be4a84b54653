//! # Access Guard
//!
//! Holds back end, finalize and delete from callers below manager until a
//! manager PIN is presented.
//!
//! ## Elevation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  staff: POST /end ──► requires_elevation? ──no──► execute               │
//! │                              │ yes                                      │
//! │                              ▼                                          │
//! │                       park(action) ──► 403 {code: unauthorized,         │
//! │                              │              pendingId}                  │
//! │                              ▼                                          │
//! │  POST /pin/verify ──► rate limit ──► argon2 check                       │
//! │                                          │                              │
//! │                 wrong ◄──────────────────┴──────────────► right         │
//! │        {success: false}                          take(pendingId)        │
//! │        failure counted                           execute exactly once   │
//! │                                                                         │
//! │  cancel / pin_timeout ──► discarded, no state change                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cue_core::access;
use cue_core::validation::validate_pin_format;
use cue_core::{ActionKind, CoreError, CoreResult, Elevation, Role, TableAction};

use crate::config::HallConfig;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Rate Limiter
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    failures: u32,
}

/// Fixed-window counter of failed PIN attempts per key.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        RateLimiter {
            max_attempts,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// `TooManyAttempts` while `key` has used up its window.
    pub fn check(&self, key: &str) -> CoreResult<()> {
        self.check_all(&[key])
    }

    /// `TooManyAttempts` if any of `keys` has used up its window.
    pub fn check_all(&self, keys: &[&str]) -> CoreResult<()> {
        let now = Instant::now();
        let windows = lock(&self.windows);
        self.blocked(&windows, keys, now)
    }

    /// Checks every key and, if none is blocked, counts one attempt against
    /// each in the same critical section.
    ///
    /// Concurrent attempts can never overshoot `max_attempts`. A successful
    /// attempt is handed back with [`RateLimiter::reset`].
    pub fn reserve(&self, keys: &[&str]) -> CoreResult<u32> {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        self.blocked(&windows, keys, now)?;

        let mut most = 0;
        for key in keys {
            let failures = Self::count(&mut windows, key, now, self.window);
            most = most.max(failures);
        }
        Ok(most)
    }

    pub fn reset(&self, key: &str) {
        lock(&self.windows).remove(key);
    }

    /// Drops windows that have run out. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.opened_at) < self.window);
        before - windows.len()
    }

    pub fn tracked(&self) -> usize {
        lock(&self.windows).len()
    }

    fn blocked(&self, windows: &HashMap<String, Window>, keys: &[&str], now: Instant) -> CoreResult<()> {
        let retry_after = keys
            .iter()
            .filter_map(|key| windows.get(*key))
            .filter_map(|window| {
                let elapsed = now.saturating_duration_since(window.opened_at);
                (elapsed < self.window && window.failures >= self.max_attempts)
                    .then(|| self.window - elapsed)
            })
            .max();

        match retry_after {
            Some(retry_after) => Err(CoreError::TooManyAttempts {
                retry_after_secs: retry_after.as_secs().max(1),
            }),
            None => Ok(()),
        }
    }

    fn count(windows: &mut HashMap<String, Window>, key: &str, now: Instant, span: Duration) -> u32 {
        let window = windows.entry(key.to_string()).or_insert(Window {
            opened_at: now,
            failures: 0,
        });
        if now.saturating_duration_since(window.opened_at) >= span {
            *window = Window {
                opened_at: now,
                failures: 0,
            };
        }
        window.failures += 1;
        window.failures
    }
}

// =============================================================================
// PIN Verifier
// =============================================================================

/// Checks PINs against the configured argon2 hashes.
#[derive(Debug, Clone)]
pub struct PinVerifier {
    hashes: Arc<Vec<String>>,
}

impl PinVerifier {
    /// Unparseable hashes are skipped with a warning.
    pub fn new(hashes: &[String]) -> Self {
        let hashes = hashes
            .iter()
            .filter(|h| match PasswordHash::new(h) {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed PIN hash");
                    false
                }
            })
            .cloned()
            .collect::<Vec<_>>();

        if hashes.is_empty() {
            warn!("No manager PINs configured; elevation requires a manager login");
        }
        PinVerifier {
            hashes: Arc::new(hashes),
        }
    }

    /// Argon2 is CPU-bound, so the check runs on the blocking pool.
    pub async fn verify(&self, pin: &str) -> CoreResult<bool> {
        let hashes = self.hashes.clone();
        let pin = pin.to_string();

        tokio::task::spawn_blocking(move || matches_any(&hashes, &pin))
            .await
            .map_err(|e| {
                error!(error = %e, "PIN check task failed");
                CoreError::NetworkFailure("PIN check did not complete".into())
            })
    }
}

fn matches_any(hashes: &[String], pin: &str) -> bool {
    let argon2 = Argon2::default();
    hashes.iter().any(|hash| {
        PasswordHash::new(hash)
            .map(|parsed| argon2.verify_password(pin.as_bytes(), &parsed).is_ok())
            .unwrap_or(false)
    })
}

/// Hashes a PIN for the `access.pin_hashes` setting.
pub fn hash_pin(pin: &str) -> Result<String, argon2::password_hash::Error> {
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::SaltString;
    use argon2::PasswordHasher;

    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default().hash_password(pin.as_bytes(), &salt)?.to_string())
}

// =============================================================================
// Pending Actions
// =============================================================================

/// An action parked until a manager PIN arrives.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    pub action: TableAction,
    pub required: Elevation,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    parked_at: Instant,
}

/// Parked actions with a time-to-live.
#[derive(Debug)]
pub struct PendingStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingAction>>,
}

impl PendingStore {
    pub fn new(ttl: Duration) -> Self {
        PendingStore {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn park(&self, action: TableAction, requested_by: &str) -> PendingAction {
        let pending = PendingAction {
            id: Uuid::new_v4().to_string(),
            required: action.kind().required_elevation(),
            action,
            requested_by: requested_by.to_string(),
            created_at: Utc::now(),
            parked_at: Instant::now(),
        };
        lock(&self.entries).insert(pending.id.clone(), pending.clone());
        pending
    }

    fn is_live(&self, pending: &PendingAction) -> bool {
        pending.parked_at.elapsed() < self.ttl
    }

    /// True if `id` is parked and not expired.
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).get(id).is_some_and(|p| self.is_live(p))
    }

    /// Removes and returns a live entry. Each entry is handed out once.
    pub fn take(&self, id: &str) -> Option<PendingAction> {
        lock(&self.entries)
            .remove(id)
            .filter(|p| self.is_live(p))
    }

    pub fn cancel(&self, id: &str) -> bool {
        lock(&self.entries).remove(id).is_some()
    }

    /// Drops expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, p| p.parked_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Access Guard
// =============================================================================

/// Outcome of a PIN check.
#[derive(Debug)]
pub enum Verification {
    /// The PIN matched; the parked action is released to run once.
    Granted(PendingAction),
    /// Wrong PIN. The action stays parked.
    Denied,
}

pub struct AccessGuard {
    limiter: RateLimiter,
    verifier: PinVerifier,
    pending: PendingStore,
}

impl AccessGuard {
    pub fn new(config: &HallConfig) -> Self {
        AccessGuard {
            limiter: RateLimiter::new(config.access.max_attempts, config.attempt_window()),
            verifier: PinVerifier::new(&config.access.pin_hashes),
            pending: PendingStore::new(config.pin_timeout()),
        }
    }

    pub fn requires_elevation(&self, kind: ActionKind, role: Role) -> bool {
        access::requires_elevation(kind, role)
    }

    /// Lets `action` through, or parks it and returns `Unauthorized` with the
    /// pending id.
    pub fn admit(&self, action: &TableAction, role: Role, requested_by: &str) -> CoreResult<()> {
        let kind = action.kind();
        if !self.requires_elevation(kind, role) {
            return Ok(());
        }

        let pending = self.pending.park(action.clone(), requested_by);
        info!(
            pending_id = %pending.id,
            action = %kind,
            table_id = %action.table_id(),
            requested_by,
            "Action parked for manager PIN"
        );
        Err(CoreError::Unauthorized {
            action: kind.as_str().to_string(),
            pending_id: Some(pending.id),
        })
    }

    /// Checks `pin` for the action parked under `pending_id`.
    ///
    /// Attempts are counted against both the verified `subject` and the
    /// parked action, so neither a new terminal id nor a new caller reopens
    /// the window.
    ///
    /// ## Errors
    /// - `TooManyAttempts` once the subject or the action used up its window
    /// - `NotFound` if the action expired, was cancelled or already ran
    /// - `Validation` for a PIN that is not 4-8 digits (not counted)
    pub async fn verify(&self, subject: &str, pending_id: &str, pin: &str) -> CoreResult<Verification> {
        let subject_key = format!("subject:{subject}");
        let pending_key = format!("pending:{pending_id}");
        let keys = [subject_key.as_str(), pending_key.as_str()];

        self.limiter.check_all(&keys)?;
        validate_pin_format(pin)?;

        if !self.pending.contains(pending_id) {
            return Err(CoreError::not_found("pending action", pending_id));
        }

        let attempts = self.limiter.reserve(&keys)?;
        if !self.verifier.verify(pin).await? {
            warn!(subject, pending_id, attempts, "Wrong manager PIN");
            return Ok(Verification::Denied);
        }

        for key in keys {
            self.limiter.reset(key);
        }
        match self.pending.take(pending_id) {
            Some(pending) => {
                info!(pending_id, action = %pending.action.kind(), "Manager PIN accepted");
                Ok(Verification::Granted(pending))
            }
            None => Err(CoreError::not_found("pending action", pending_id)),
        }
    }

    pub fn cancel(&self, pending_id: &str) -> bool {
        let removed = self.pending.cancel(pending_id);
        if removed {
            debug!(pending_id, "Pending action cancelled");
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Subjects and actions with an open attempt window.
    pub fn tracked_windows(&self) -> usize {
        self.limiter.tracked()
    }

    /// Discards expired parked actions and attempt windows every `every`
    /// until the guard is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let guard = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(guard) = guard.upgrade() else {
                    break;
                };
                let expired = guard.pending.sweep();
                if expired > 0 {
                    info!(expired, "Discarded expired pending actions");
                }
                let windows = guard.limiter.sweep();
                if windows > 0 {
                    debug!(windows, "Dropped expired attempt windows");
                }
            }
        })
    }
}
