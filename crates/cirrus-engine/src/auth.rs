//! Authorization state machine.
//!
//! A handle is unauthorized until a token round-trip succeeds: refresh when
//! a refresh token is held, otherwise interactive consent (the user visits
//! the authorize URL, the embedded server receives the redirect and the
//! code is delivered out-of-band through [`AuthManager::deliver_code`]).
//!
//! The whole sequence runs under a barrier: at most one round-trip is in
//! flight per handle, and requests that need authorization while one is in
//! progress attach as waiters and share its outcome. This is what keeps a
//! burst of 401s from turning into a thundering herd of refreshes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cirrus_core::{CloudError, CloudResult, ProviderKind, Token};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What the embedding application wants the engine to do when a handle has
/// no usable credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentStatus {
    /// Park the request and wait for an authorization code to arrive
    /// through the embedded server.
    WaitForAuthorizationCode,
    /// Give up; the operation fails as unauthorized.
    None,
}

/// User-supplied authorization callback. Must be reentrancy-safe: the
/// engine may call it from any worker thread, concurrently.
pub trait AuthCallback: Send + Sync {
    /// Consulted when interactive consent would be needed.
    fn user_consent_required(&self, kind: ProviderKind) -> ConsentStatus;

    /// Invoked when an authorization attempt finishes.
    fn done(&self, kind: ProviderKind, result: &CloudResult<()>) {
        let _ = (kind, result);
    }
}

/// Outcome snapshot of the last finished barrier pass.
#[derive(Debug, Clone)]
enum LastOutcome {
    Success,
    Failure(CloudError),
}

/// Per-handle credential state plus the refresh barrier.
pub struct AuthManager {
    token: Mutex<Option<Token>>,
    /// Bumped after every finished barrier pass; waiters that observed an
    /// older generation adopt the stored outcome instead of issuing their
    /// own round-trip.
    generation: AtomicU64,
    outcome: Mutex<Option<LastOutcome>>,
    barrier: tokio::sync::Mutex<()>,
    /// Parked consent waiter, if any.
    code_slot: Mutex<Option<oneshot::Sender<String>>>,
}

impl AuthManager {
    pub fn new(initial: Option<Token>) -> Self {
        Self {
            token: Mutex::new(initial),
            generation: AtomicU64::new(0),
            outcome: Mutex::new(None),
            barrier: tokio::sync::Mutex::new(()),
            code_slot: Mutex::new(None),
        }
    }

    pub fn token(&self) -> Option<Token> {
        self.token.lock().unwrap().clone()
    }

    pub fn set_token(&self, token: Token) {
        *self.token.lock().unwrap() = Some(token);
    }

    pub fn clear_token(&self) {
        *self.token.lock().unwrap() = None;
    }

    pub fn is_authorized(&self) -> bool {
        self.token
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| !t.access_token.is_empty())
            .unwrap_or(false)
    }

    /// Hands an authorization code to a parked consent waiter. Returns
    /// `false` when nobody is waiting.
    pub fn deliver_code(&self, code: impl Into<String>) -> bool {
        match self.code_slot.lock().unwrap().take() {
            Some(sender) => sender.send(code.into()).is_ok(),
            None => false,
        }
    }

    /// Registers this caller as the consent waiter and returns the channel
    /// the next [`AuthManager::deliver_code`] will complete. Meant to be
    /// called from within a barrier pass, where at most one round-trip is
    /// running.
    pub fn wait_for_code(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        *self.code_slot.lock().unwrap() = Some(tx);
        rx
    }

    /// Runs one authorization pass under the barrier.
    ///
    /// `round_trip` performs the actual token exchange (refresh or consent
    /// plus code exchange) and is executed by at most one caller per
    /// barrier; everyone else waits and shares the outcome.
    pub async fn authorize<F, Fut>(&self, kind: ProviderKind, round_trip: F) -> CloudResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CloudResult<Token>>,
    {
        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.barrier.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            // A pass finished while we queued; adopt its outcome.
            let outcome = self.outcome.lock().unwrap().clone();
            return match outcome {
                Some(LastOutcome::Success) => Ok(()),
                Some(LastOutcome::Failure(err)) => Err(err),
                None => Err(CloudError::unauthorized("authorization pending")),
            };
        }

        debug!(%kind, "authorization pass starting");
        let result = round_trip().await;
        let outcome = match &result {
            Ok(token) => {
                info!(%kind, "authorization succeeded");
                *self.token.lock().unwrap() = Some(token.clone());
                LastOutcome::Success
            }
            Err(err) => {
                warn!(%kind, code = err.code, "authorization failed");
                *self.token.lock().unwrap() = None;
                LastOutcome::Failure(err.clone())
            }
        };
        *self.outcome.lock().unwrap() = Some(outcome);
        self.generation.fetch_add(1, Ordering::AcqRel);
        result.map(|_| ())
    }
}
