use crate::core::FailureKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the runner does after a failed apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the same command after the delay.
    RetryAfter(Duration),
    /// Go DEGRADED, wait, then retry the same command. Never gives up.
    PauseAfter(Duration),
    /// Record ERROR and move to the next command.
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first transient failure; 0 means fail on the first one.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub infrastructure_initial_backoff_ms: u64,
    pub infrastructure_max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            infrastructure_initial_backoff_ms: 500,
            infrastructure_max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// `attempt` counts failures of this kind for the current command, starting at 1.
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        match kind {
            FailureKind::Fatal => RetryDecision::Terminal,
            FailureKind::Transient if attempt > self.max_retries => RetryDecision::Terminal,
            FailureKind::Transient => RetryDecision::RetryAfter(Duration::from_millis(
                backoff_ms(self.initial_backoff_ms, self.max_backoff_ms, attempt),
            )),
            FailureKind::Infrastructure => RetryDecision::PauseAfter(Duration::from_millis(
                backoff_ms(
                    self.infrastructure_initial_backoff_ms,
                    self.infrastructure_max_backoff_ms,
                    attempt,
                ),
            )),
        }
    }

    /// Time spent backing off before a transient command is given up on.
    pub fn total_backoff(&self) -> Duration {
        let total = (1..=self.max_retries)
            .map(|attempt| backoff_ms(self.initial_backoff_ms, self.max_backoff_ms, attempt))
            .fold(0u64, u64::saturating_add);
        Duration::from_millis(total)
    }
}

fn backoff_ms(initial_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let base = initial_ms.max(1);
    let max = max_ms.max(base);
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            infrastructure_initial_backoff_ms: 100,
            infrastructure_max_backoff_ms: 400,
        }
    }

    #[test]
    fn transient_backoff_doubles_up_to_cap_then_gives_up() {
        let policy = policy(4);
        let delays: Vec<RetryDecision> = (1..=5)
            .map(|attempt| policy.decide(FailureKind::Transient, attempt))
            .collect();
        assert_eq!(
            delays,
            vec![
                RetryDecision::RetryAfter(Duration::from_millis(10)),
                RetryDecision::RetryAfter(Duration::from_millis(20)),
                RetryDecision::RetryAfter(Duration::from_millis(40)),
                RetryDecision::RetryAfter(Duration::from_millis(50)),
                RetryDecision::Terminal,
            ]
        );
        assert_eq!(policy.total_backoff(), Duration::from_millis(120));
    }

    #[test]
    fn fatal_is_never_retried() {
        assert_eq!(policy(10).decide(FailureKind::Fatal, 1), RetryDecision::Terminal);
        assert_eq!(policy(0).decide(FailureKind::Transient, 1), RetryDecision::Terminal);
    }

    #[test]
    fn infrastructure_pauses_forever() {
        let policy = policy(0);
        assert_eq!(
            policy.decide(FailureKind::Infrastructure, 1),
            RetryDecision::PauseAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(FailureKind::Infrastructure, 1_000),
            RetryDecision::PauseAfter(Duration::from_millis(400))
        );
    }
}
