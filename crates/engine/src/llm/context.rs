use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::LlmError;

/// Per-call cancellation handle with an optional deadline.
///
/// Every suspension point (HTTP round trip, backoff sleep) races against
/// [`CallContext::done`]. Cloning shares the underlying token.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a caller-owned token so the caller can cancel from elsewhere.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Same token, with a deadline `timeout` from now. An earlier existing
    /// deadline is kept; a timeout past the clock's range adds none.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(existing), Some(deadline)) => Some(existing.min(deadline)),
            (existing, None) => existing,
            (None, deadline) => deadline,
        };

        Self {
            token: self.token.clone(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The context error if the call must stop now, without waiting.
    pub fn error(&self) -> Option<LlmError> {
        if self.token.is_cancelled() {
            return Some(LlmError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LlmError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or past its deadline.
    pub async fn done(&self) -> LlmError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => LlmError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => LlmError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                LlmError::Cancelled
            }
        }
    }
}
