use std::time::Duration;

use tcpshaper_common::ShaperError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation scope for admission waits: a token that can be fired by
/// whoever holds a clone, plus an optional deadline.
#[derive(Clone, Debug, Default)]
pub struct WaitContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only ever moves the deadline closer
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A context that is cancelled along with this one but can also be
    /// cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The error a wait started now would end with, if any
    pub fn error(&self) -> Option<ShaperError> {
        if self.token.is_cancelled() {
            return Some(ShaperError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ShaperError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the token fires or the deadline passes
    pub async fn done(&self) -> ShaperError {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.token.cancelled() => ShaperError::Cancelled,
            _ = deadline => ShaperError::DeadlineExceeded,
        }
    }
}

impl From<CancellationToken> for WaitContext {
    fn from(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }
}
