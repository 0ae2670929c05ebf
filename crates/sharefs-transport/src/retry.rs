//! Bounded send retry with exponential backoff.
//!
//! A send to a congested peer is retried a fixed number of times, doubling the
//! delay after each attempt starting from one tick. Peers already known to be
//! blocked get a smaller budget so a dead socket cannot stall every sender.

use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;

/// Attempts for a healthy peer.
pub const MAX_SEND_TRIES: u32 = 6;

/// Attempts for a peer already flagged as blocked.
pub const MIN_SEND_TRIES: u32 = 3;

/// Configuration for send retry behavior.
#[derive(Debug, Clone)]
pub struct SendRetryConfig {
    /// Attempts for a healthy peer (default: 6).
    pub max_send_tries: u32,
    /// Attempts for a blocked peer (default: 3).
    pub min_send_tries: u32,
    /// Delay after the first failed attempt (default: 10ms).
    pub tick: Duration,
}

impl Default for SendRetryConfig {
    fn default() -> Self {
        Self {
            max_send_tries: MAX_SEND_TRIES,
            min_send_tries: MIN_SEND_TRIES,
            tick: Duration::from_millis(10),
        }
    }
}

/// Outcome of a retried send.
#[derive(Debug)]
pub enum SendOutcome {
    /// Delivered after `attempts` tries.
    Delivered {
        /// Attempts used.
        attempts: u32,
    },
    /// Every attempt hit a transient error.
    Exhausted {
        /// Attempts used.
        attempts: u32,
    },
    /// A non-transient error ended the sequence.
    Failed {
        /// The error.
        error: TransportError,
        /// Attempts used.
        attempts: u32,
    },
}

/// Executes sends under the retry budget.
#[derive(Debug, Clone)]
pub struct SendRetry {
    config: SendRetryConfig,
}

impl SendRetry {
    /// Creates an executor.
    pub fn new(config: SendRetryConfig) -> Self {
        Self { config }
    }

    /// Attempt budget for a peer.
    pub fn attempts(&self, peer_blocked: bool) -> u32 {
        if peer_blocked {
            self.config.min_send_tries
        } else {
            self.config.max_send_tries
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.config.tick.saturating_mul(1u32 << shift)
    }

    /// Runs `send` until it succeeds, fails fatally or the budget runs out.
    ///
    /// No delay follows the final attempt.
    pub async fn run<F, Fut>(&self, peer_blocked: bool, mut send: F) -> SendOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let budget = self.attempts(peer_blocked).max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match send().await {
                Ok(()) => return SendOutcome::Delivered { attempts: attempt },
                Err(e) if is_retryable(&e) => {
                    if attempt >= budget {
                        return SendOutcome::Exhausted { attempts: attempt };
                    }
                    tracing::debug!(attempt, budget, "send congested, backing off");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(error) => {
                    return SendOutcome::Failed {
                        error,
                        attempts: attempt,
                    }
                }
            }
        }
    }
}

impl Default for SendRetry {
    fn default() -> Self {
        Self::new(SendRetryConfig::default())
    }
}

/// Check if a send error is transient.
///
/// Only congestion is retried; resets, protocol errors and other I/O failures
/// end the sequence so the session can be cleared.
pub fn is_retryable(error: &TransportError) -> bool {
    match error {
        TransportError::Congested => true,
        TransportError::IoError(e) => matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
        ),
        TransportError::ConnectionRefused { .. }
        | TransportError::ConnectionTimeout { .. }
        | TransportError::ConnectionReset
        | TransportError::NotConnected
        | TransportError::Protocol(_) => false,
    }
}
