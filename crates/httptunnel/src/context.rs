use std::time::{Duration, Instant};

use httptunnel_rpc::CancellationToken;

/// Execution context travelling with a request as an `http::Extensions` entry.
///
/// Handlers observe cancellation through it; the origin derives the RPC call's deadline and
/// cancellation from it.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::never(),
            deadline: None,
        }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        let mut cancel = self.cancel.clone();
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => cancel.cancelled().await,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

/// The request target exactly as it appeared on the request line (path and query, escapes
/// untouched). Stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTarget(pub String);

impl RawTarget {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
