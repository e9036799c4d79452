//! Cancellation plumbing with caller-visible reasons.
//!
//! A thin pair over `tokio_util`'s `CancellationToken`: the controller side
//! cancels, the signal side is cloned into calls. The first abort wins the
//! reason slot; later aborts are no-ops.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Read side of a cancellation. Cheap to clone; all clones observe the
/// same abort and the same reason.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason given at abort time. "aborted" until an abort lands.
    pub fn reason(&self) -> String {
        self.reason.get().cloned().unwrap_or_else(|| "aborted".to_string())
    }

    /// Resolves once the controller aborts. Never resolves otherwise.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Write side. Owns the token; hands out [`AbortSignal`] clones.
#[derive(Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                token: CancellationToken::new(),
                reason: Arc::new(OnceLock::new()),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }

    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.signal.reason.set(reason.into());
        self.signal.token.cancel();
    }
}
