//! Cooperative cancellation, keyed per `(user, session)`.
//!
//! Each running turn registers a `CancelToken`; the flag is polled
//! before every phase and every LM call. Sub-executors share the parent
//! turn's token, so cancelling a turn stops its whole recursion tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use tess_domain::error::{Error, Result};
use tess_sessions::SessionKey;

/// A cancellation token checked by the runtime loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Raise at a suspension point when cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Active cancellation tokens per session key.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a session's turn.
    pub fn register(&self, key: &SessionKey) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(key.flat(), token.clone());
        token
    }

    /// Cancel the running turn for a session. Returns true if a token
    /// was found.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        match self.tokens.lock().get(&key.flat()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token when a turn reaches a terminal state.
    pub fn remove(&self, key: &SessionKey) {
        self.tokens.lock().remove(&key.flat());
    }

    /// Is a turn currently running for this session?
    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.tokens.lock().contains_key(&key.flat())
    }
}
