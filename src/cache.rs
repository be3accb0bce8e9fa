//! # Cache validity
//!
//! Every cached entity is guarded by the same two-tier rule:
//!
//! 1. **Time**: while the trust window is open the cached value is used
//!    without talking to the server.
//! 2. **Token**: once the window has lapsed, only the entity's lightweight
//!    info is fetched. An unchanged version token re-opens the window and
//!    keeps the cached value (same `Arc`); a changed token rebuilds it.
//!
//! Mutations issued through this client call [`TrustWindow::end_trust`] on
//! the affected entity so the next read revalidates.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::Result;

/// Default trust duration for every entity.
pub const DEFAULT_TRUST_SECS: u64 = 60;

// ============================================================================
// TrustWindow
// ============================================================================

/// Interval during which a cached value is assumed current.
#[derive(Debug, Clone)]
pub struct TrustWindow {
    duration: Duration,
    until: Option<Instant>,
}

impl TrustWindow {
    /// A closed window with the given duration.
    pub fn new(duration: Duration) -> Self {
        Self { duration, until: None }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn in_trust(&self) -> bool {
        self.until.is_some_and(|until| Instant::now() < until)
    }

    /// Closes the window; the next read revalidates.
    pub fn end_trust(&mut self) {
        self.until = None;
    }

    /// Opens the window for another full duration, starting now.
    pub fn renew(&mut self) {
        self.until = Some(Instant::now() + self.duration);
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Changes the duration; an open window is re-based on the new duration.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
        if self.until.is_some() {
            self.renew();
        }
    }
}

impl Default for TrustWindow {
    fn default() -> Self {
        Self::from_secs(DEFAULT_TRUST_SECS)
    }
}

// ============================================================================
// Cached<T, K>
// ============================================================================

/// What a validity check ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidation {
    /// Window open, no request sent.
    Trusted,
    /// Token unchanged, window re-opened.
    Unchanged,
    /// Cache (re)built.
    Rebuilt,
}

/// A value mirrored from the server, keyed by a version token `K`.
///
/// The owner wraps this in a mutex; [`validate`](Cached::validate) is the
/// check-then-rebuild critical section. The returned `Arc<T>` is an
/// immutable generation that readers use without further locking.
#[derive(Debug)]
pub(crate) struct Cached<T, K> {
    kind: &'static str,
    value: Option<Arc<T>>,
    token: Option<K>,
    window: TrustWindow,
}

impl<T, K> Cached<T, K>
where
    K: PartialEq + Debug,
{
    pub fn new(kind: &'static str, window: TrustWindow) -> Self {
        Self { kind, value: None, token: None, window }
    }

    /// The current generation, whether or not it is trusted.
    pub fn current(&self) -> Option<Arc<T>> {
        self.value.clone()
    }

    pub fn end_trust(&mut self) {
        self.window.end_trust();
    }

    pub fn window_mut(&mut self) -> &mut TrustWindow {
        &mut self.window
    }

    /// Drops the cached value and token.
    pub fn reset(&mut self) {
        self.value = None;
        self.token = None;
        self.window.end_trust();
    }

    /// Returns a valid generation, revalidating or rebuilding as needed.
    ///
    /// `check` fetches the entity's token plus whatever lightweight info the
    /// rebuild needs; `build` receives that info and the previous generation.
    /// A failing check or build propagates and leaves the old generation in
    /// place but untrusted, so a stale value is never handed out silently.
    pub fn validate<P>(
        &mut self,
        check: impl FnOnce() -> Result<(K, P)>,
        build: impl FnOnce(P, Option<&Arc<T>>) -> Result<T>,
    ) -> Result<(Arc<T>, Revalidation)> {
        if let Some(value) = &self.value {
            if self.window.in_trust() {
                return Ok((Arc::clone(value), Revalidation::Trusted));
            }
        }

        let (token, info) = check()?;

        if let Some(value) = &self.value {
            if self.token.as_ref() == Some(&token) {
                tracing::trace!(kind = self.kind, ?token, "token unchanged, trust renewed");
                self.window.renew();
                return Ok((Arc::clone(value), Revalidation::Unchanged));
            }
        }

        tracing::debug!(kind = self.kind, old = ?self.token, new = ?token, "rebuilding cache");
        let built = Arc::new(build(info, self.value.as_ref())?);
        self.value = Some(Arc::clone(&built));
        self.token = Some(token);
        self.window.renew();
        Ok((built, Revalidation::Rebuilt))
    }
}
