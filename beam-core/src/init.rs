//! Transport initialization: error taxonomy, retry policies, own link status.

use std::io;
use std::time::Duration;

/// Fixed delay before re-registering with the transport provider.
pub const DEFAULT_REGISTER_RETRY_DELAY: Duration = Duration::from_secs(3);
/// Registration attempts before the failure is reported as final.
pub const DEFAULT_REGISTER_ATTEMPTS: u32 = 10;
/// Base delay for signaling reconnects.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);
/// Cap on a single signaling reconnect delay.
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(10);
/// Signaling reconnect attempts before giving up.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// The client's own transport status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Initializing,
    Connected,
    Disconnected,
    Error(String),
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Initializing => f.write_str("initializing"),
            LinkStatus::Connected => f.write_str("connected"),
            LinkStatus::Disconnected => f.write_str("disconnected"),
            LinkStatus::Error(cause) => write!(f, "error: {cause}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The environment cannot support the transport. Fatal, reported once.
    #[error("transport unsupported: {0}")]
    Capability(String),
    /// Network trouble. Retried per policy.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Concerns one remote peer only.
    #[error("peer unavailable: {0}")]
    Peer(String),
}

impl InitError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, InitError::Capability(_))
    }
}

/// Classify an I/O error raised while binding or registering the local transport.
pub fn classify_io(err: &io::Error) -> InitError {
    match err.kind() {
        io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied => InitError::Capability(err.to_string()),
        _ => InitError::Transient(err.to_string()),
    }
}

/// Classify an I/O error raised while dialing one peer.
pub fn classify_dial(err: &io::Error) -> InitError {
    InitError::Peer(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay every attempt.
    Fixed { delay: Duration, max_attempts: u32 },
    /// `min(base * 2^attempt, cap)`.
    Exponential { base: Duration, cap: Duration, max_attempts: u32 },
}

impl RetryPolicy {
    pub fn registration() -> Self {
        Self::registration_with(DEFAULT_REGISTER_ATTEMPTS)
    }

    pub fn registration_with(max_attempts: u32) -> Self {
        RetryPolicy::Fixed {
            delay: DEFAULT_REGISTER_RETRY_DELAY,
            max_attempts,
        }
    }

    pub fn signaling() -> Self {
        RetryPolicy::Exponential {
            base: DEFAULT_RECONNECT_BASE,
            cap: DEFAULT_RECONNECT_CAP,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }

    /// Delay before retry number `attempt` (0-based), or None once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Fixed { delay, max_attempts } => (attempt < max_attempts).then_some(delay),
            RetryPolicy::Exponential {
                base,
                cap,
                max_attempts,
            } => {
                if attempt >= max_attempts {
                    return None;
                }
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                Some(base.saturating_mul(factor).min(cap))
            }
        }
    }
}

/// Attempt counter over a policy. Reset after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Next delay to wait after a failure, or None when the caller must give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt)?;
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Decide what to do after an initialization failure: retry after a delay, or stop.
pub fn on_init_failure(err: &InitError, backoff: &mut Backoff) -> Option<Duration> {
    if err.is_fatal() {
        tracing::error!(error = %err, "transport initialization failed permanently");
        return None;
    }
    let delay = backoff.next_delay();
    match delay {
        Some(d) => tracing::warn!(error = %err, attempt = backoff.attempts(), delay_ms = d.as_millis() as u64, "retrying transport initialization"),
        None => tracing::warn!(error = %err, "retry attempts exhausted"),
    }
    delay
}
