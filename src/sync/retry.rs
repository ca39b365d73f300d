use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::source::{EventSource, SessionInfo, SourceError, TransportKind};
use crate::sync::{sleep_or_cancel, SyncProgress};

/// Delay between handshake attempts when the server is unreachable.
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Whether a failed handshake is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Fatal,
}

/// Classify a handshake failure.
///
/// Network trouble (refused, DNS, timeout, truncated stream, unreachable),
/// 5xx responses and 429 are retryable. Every other HTTP error and anything
/// that is not a network failure is fatal.
pub fn classify(err: &SourceError) -> Retryability {
    match err {
        SourceError::Transport { kind, .. } => match kind {
            TransportKind::Other => Retryability::Fatal,
            _ => Retryability::Retryable,
        },
        SourceError::Http { status, .. } if *status == 429 || *status >= 500 => {
            Retryability::Retryable
        }
        _ => Retryability::Fatal,
    }
}

/// Decides how long to wait before the next handshake attempt.
pub trait RetryPolicy: Send + Sync {
    /// Delay before retrying after `failures` consecutive failures, or `None`
    /// to give up.
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

/// Constant delay between attempts, optionally capped at `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
    /// Total attempts allowed; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self {
            delay: DEFAULT_CONNECT_RETRY_DELAY,
            max_attempts: None,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if failures >= max => None,
            _ => Some(self.delay),
        }
    }
}

/// Verify the remote session, retrying transient failures per `policy`.
pub async fn verify_session(
    source: &dyn EventSource,
    policy: &dyn RetryPolicy,
    cancel: &CancellationToken,
    progress: &dyn SyncProgress,
) -> Result<SessionInfo> {
    let mut failures: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let err = match source.verify_session().await {
            Ok(session) => return Ok(session),
            Err(e) => e,
        };
        failures += 1;
        log::error!("Failed to verify credentials (attempt {failures}): {err}");

        if classify(&err) == Retryability::Fatal {
            log::error!("Non-retryable error while verifying credentials, giving up");
            return Err(Error::ConnectFatal(err));
        }

        let Some(delay) = policy.next_delay(failures) else {
            log::error!("Reached max attempts ({failures}) verifying credentials, giving up");
            return Err(Error::ConnectExhausted {
                attempts: failures,
                source: err,
            });
        };

        log::info!("Server unavailable or network issue, retrying in {delay:?}");
        progress.on_connect_retry(failures, delay, &err);
        sleep_or_cancel(delay, cancel).await?;
    }
}
