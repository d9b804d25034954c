//! Absolute deadlines and the bounded polling loop shared by every wait
//! in a session (header, handshake, row capture).
//!
//! Deadlines are measured on `tokio::time::Instant`, so tests running on
//! a paused runtime see exact, reproducible timeouts.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Result;

// ── Deadline ─────────────────────────────────────────────────────

/// A point in time computed once, when a wait begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// The instant at which the wait gives up.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// The total budget this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` once the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Drive `fut` until it completes or the deadline passes.
    ///
    /// Returns `None` on expiry; the future is dropped, so only
    /// cancel-safe futures should be passed here.
    pub async fn within<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::time::timeout_at(self.at, fut).await.ok()
    }
}

// ── poll_until ───────────────────────────────────────────────────

/// Repeatedly run `step` until it breaks with a value or `deadline`
/// expires.
///
/// `step` is expected to bound its own awaits by the same deadline
/// (e.g. `link.read_line(deadline)`), so the loop never spins while
/// waiting for input. Errors from `step` abort the wait immediately.
///
/// Returns `Ok(None)` on expiry.
pub async fn poll_until<T>(
    deadline: Deadline,
    mut step: impl AsyncFnMut() -> Result<ControlFlow<T>>,
) -> Result<Option<T>> {
    loop {
        if let ControlFlow::Break(value) = step().await? {
            return Ok(Some(value));
        }
        if deadline.expired() {
            return Ok(None);
        }
    }
}
