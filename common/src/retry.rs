// Retry policy and the attempt state machine for refresh jobs

use crate::config::WorkerSettings;
use std::time::Duration;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before the attempt following `attempt` (1-based), or None when
    /// `attempt` was the last one allowed
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    fn max_retries(&self) -> u32;

    fn should_retry(&self, attempt: u32) -> bool {
        self.next_delay(attempt).is_some()
    }
}

/// Same delay between every attempt, capped at `max_retries` attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Time limits and retry behaviour applied to every refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Past this the adapter is asked to wind down
    pub soft_limit: Duration,
    /// Past this the attempt is abandoned
    pub hard_limit: Duration,
    pub retry: FixedDelay,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            soft_limit: Duration::from_secs(300),
            hard_limit: Duration::from_secs(600),
            retry: FixedDelay::new(Duration::from_secs(60), 3),
        }
    }
}

impl LifecyclePolicy {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            soft_limit: Duration::from_secs(settings.soft_limit_seconds),
            hard_limit: Duration::from_secs(settings.hard_limit_seconds),
            retry: FixedDelay::new(
                Duration::from_secs(settings.retry_delay_seconds),
                settings.max_retries,
            ),
        }
    }
}

/// Where a single job stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptState {
    Dispatched,
    Running,
    Succeeded,
    RetryableFailure,
    TerminalFailure,
}

/// What happened to the attempt being supervised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Started,
    Completed,
    Failed { retryable: bool },
    HardLimitExceeded,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::TerminalFailure)
    }

    /// Apply `event` to attempt number `attempt` (1-based)
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn on(self, event: AttemptEvent, attempt: u32, retry: &dyn RetryStrategy) -> AttemptState {
        match (self, event) {
            (AttemptState::Dispatched, AttemptEvent::Started) => AttemptState::Running,
            (AttemptState::Running, AttemptEvent::Completed) => AttemptState::Succeeded,
            (AttemptState::Running, AttemptEvent::Failed { retryable: false }) => {
                AttemptState::TerminalFailure
            }
            (AttemptState::Running, AttemptEvent::Failed { retryable: true })
            | (AttemptState::Running, AttemptEvent::HardLimitExceeded) => {
                if retry.should_retry(attempt) {
                    AttemptState::RetryableFailure
                } else {
                    AttemptState::TerminalFailure
                }
            }
            (state, _) => state,
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptState::Dispatched => write!(f, "dispatched"),
            AttemptState::Running => write!(f, "running"),
            AttemptState::Succeeded => write!(f, "succeeded"),
            AttemptState::RetryableFailure => write!(f, "retryable_failure"),
            AttemptState::TerminalFailure => write!(f, "terminal_failure"),
        }
    }
}
