//! Retry policy for session loss.

use tracing::debug;

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

impl RetryPolicy {
    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// What to do about a lost session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Session loss handling is switched off.
    Ignore,
    /// Rebuild and resume. `attempt` starts at 1.
    Retry { attempt: u32 },
    /// Surface the loss to the user.
    GiveUp,
}

/// Counts session losses against a [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct SessionLossRetry {
    policy: RetryPolicy,
    attempts: u32,
}

impl SessionLossRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Decide on a new loss. Giving up resets the counter.
    pub fn on_session_lost(&mut self, ignore: bool) -> RetryDecision {
        if ignore {
            return RetryDecision::Ignore;
        }
        if self.policy.should_retry(self.attempts) {
            self.attempts += 1;
            debug!(attempt = self.attempts, "Retrying after session loss");
            RetryDecision::Retry {
                attempt: self.attempts,
            }
        } else {
            self.attempts = 0;
            RetryDecision::GiveUp
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
