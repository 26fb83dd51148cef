//! Connection state machine for a live session.
//!
//! ```text
//!   INIT ──► CONNECTING ──► OPEN ──► CLOSED
//!     │           │                    ▲
//!     └───────────┴────────────────────┘
//! ```
//!
//! Every change goes through [`StateCell::transition`]; anything not in the table is an
//! `IllegalTransition`. `CLOSED` is terminal: a session that closed must be rebuilt from `INIT`.

use crate::error::{LiveError, LiveResult};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Init,
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Connecting, Open)
                | (Init, Closed)
                | (Connecting, Closed)
                | (Open, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-protected current state.
#[derive(Debug)]
pub struct StateCell {
    inner: Mutex<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ConnectionState::Init),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        *self.lock()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: ConnectionState) -> LiveResult<ConnectionState> {
        let mut state = self.lock();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(LiveError::IllegalTransition { from, to: next });
        }
        *state = next;
        Ok(from)
    }

    /// Close from whatever state we are in. `None` if already closed.
    pub fn close(&self) -> Option<ConnectionState> {
        let mut state = self.lock();
        if *state == ConnectionState::Closed {
            return None;
        }
        let from = *state;
        *state = ConnectionState::Closed;
        Some(from)
    }

    pub fn require_open(&self) -> LiveResult<()> {
        match self.get() {
            ConnectionState::Open => Ok(()),
            other => Err(LiveError::Protocol(format!("session is {}", other))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        // a poisoned lock still holds a valid state value
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
