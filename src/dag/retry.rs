//! Retry with escalating resources.
//!
//! Each retryable node owns a small state machine:
//!
//! ```text
//! Pending -> Running -> Succeeded
//!               |
//!               +-> AwaitingRetry(attempt, backoff) -> Running (more memory)
//!               |
//!               +-> Failed
//! ```
//!
//! Only out-of-memory failures (and, when configured, wall-time overruns) move
//! a node to `AwaitingRetry`. Every other failure is terminal.

use crate::config::{ResourceProfile, RetrySection};
use crate::errors::{ExitSignal, TaskError};
use serde::Serialize;
use std::time::Duration;

/// Retry settings shared by every retryable node of a run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub memory_factor: u32,
    pub backoff: Duration,
    pub oom_exit_codes: Vec<i32>,
    pub oom_signals: Vec<i32>,
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(section: &RetrySection) -> Self {
        Self {
            memory_factor: section.memory_factor.max(1),
            backoff: Duration::from_millis(section.backoff_ms),
            oom_exit_codes: section.oom_exit_codes.clone(),
            oom_signals: section.oom_signals.clone(),
            retry_on_timeout: section.retry_on_timeout,
        }
    }

    /// Whether an exit status belongs to the out-of-memory class.
    pub fn is_oom(&self, exit: &ExitSignal) -> bool {
        exit.code.is_some_and(|c| self.oom_exit_codes.contains(&c))
            || exit.signal.is_some_and(|s| self.oom_signals.contains(&s))
    }

    /// Resources for the given attempt (1-based): memory grows by
    /// `memory_factor` per retry. Timeout retries also stretch the wall time.
    pub fn escalate(&self, base: ResourceProfile, attempt: u32, stretch_time: bool) -> ResourceProfile {
        let factor = u64::from(self.memory_factor).saturating_pow(attempt.saturating_sub(1));
        ResourceProfile {
            cpus: base.cpus,
            memory_mb: base.memory_mb.saturating_mul(factor),
            time_secs: if stretch_time {
                base.time_secs.saturating_mul(factor)
            } else {
                base.time_secs
            },
        }
    }

    /// Delay before the given retry attempt (2-based): doubles each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(2).min(16);
        self.backoff.saturating_mul(1 << doublings)
    }
}

/// Lifecycle of one node's attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Running {
        attempt: u32,
    },
    AwaitingRetry {
        attempt: u32,
        #[serde(with = "super::state::duration_serde")]
        backoff: Duration,
    },
    Failed {
        attempts: u32,
    },
    Succeeded {
        attempts: u32,
    },
}

/// What the executor should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Sleep for `backoff`, then run `attempt` with `resources`
    Retry {
        attempt: u32,
        backoff: Duration,
        resources: ResourceProfile,
    },
    /// The failure is terminal
    GiveUp,
}

/// Per-node retry state machine.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: AttemptState,
    base: ResourceProfile,
    current: ResourceProfile,
    max_attempts: u32,
    retryable: bool,
    stretch_time: bool,
}

impl RetryMachine {
    pub fn new(base: ResourceProfile, max_attempts: u32, retryable: bool) -> Self {
        Self {
            state: AttemptState::Pending,
            base,
            current: base,
            max_attempts: max_attempts.max(1),
            retryable,
            stretch_time: false,
        }
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    /// Resources for the next (or current) attempt.
    pub fn resources(&self) -> ResourceProfile {
        self.current
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        match self.state {
            AttemptState::Pending => 0,
            AttemptState::Running { attempt } => attempt,
            AttemptState::AwaitingRetry { attempt, .. } => attempt - 1,
            AttemptState::Failed { attempts } | AttemptState::Succeeded { attempts } => attempts,
        }
    }

    /// Start the next attempt and return its number.
    pub fn begin(&mut self) -> u32 {
        let attempt = match self.state {
            AttemptState::Pending => 1,
            AttemptState::AwaitingRetry { attempt, .. } => attempt,
            AttemptState::Running { attempt } => attempt,
            AttemptState::Failed { attempts } | AttemptState::Succeeded { attempts } => attempts,
        };
        self.state = AttemptState::Running { attempt };
        attempt
    }

    pub fn succeed(&mut self) {
        self.state = AttemptState::Succeeded {
            attempts: self.attempts(),
        };
    }

    /// Classify a failed attempt.
    pub fn fail(&mut self, error: &TaskError, policy: &RetryPolicy) -> Transition {
        let attempt = self.attempts();
        let eligible = self.retryable && error.is_retryable(policy);

        if !eligible || attempt >= self.max_attempts {
            self.state = AttemptState::Failed { attempts: attempt };
            return Transition::GiveUp;
        }

        if error.is_timeout() {
            self.stretch_time = true;
        }
        let next = attempt + 1;
        let backoff = policy.backoff_for(next);
        self.current = policy.escalate(self.base, next, self.stretch_time);
        self.state = AttemptState::AwaitingRetry {
            attempt: next,
            backoff,
        };

        Transition::Retry {
            attempt: next,
            backoff,
            resources: self.current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Stage;

    fn oom() -> TaskError {
        TaskError::ResourceExhaustion {
            stage: Stage::SearchContainment,
            exit: ExitSignal {
                code: Some(137),
                signal: None,
            },
            memory_mb: 0,
            stderr: String::new(),
        }
    }

    fn tool_error() -> TaskError {
        TaskError::ToolInvocation {
            stage: Stage::SearchContainment,
            exit: ExitSignal {
                code: Some(1),
                signal: None,
            },
            stderr: "bad input".to_string(),
        }
    }

    fn timeout() -> TaskError {
        TaskError::Timeout {
            stage: Stage::SearchContainment,
            limit: Duration::from_secs(10),
        }
    }

    fn base() -> ResourceProfile {
        ResourceProfile::new(2, 4096, 600)
    }

    #[test]
    fn test_oom_classification() {
        let policy = RetryPolicy::default();
        for code in 137..=140 {
            assert!(policy.is_oom(&ExitSignal {
                code: Some(code),
                signal: None
            }));
        }
        assert!(policy.is_oom(&ExitSignal {
            code: None,
            signal: Some(9)
        }));
        assert!(!policy.is_oom(&ExitSignal {
            code: Some(1),
            signal: None
        }));
        assert!(!policy.is_oom(&ExitSignal {
            code: None,
            signal: Some(15)
        }));
    }

    #[test]
    fn test_memory_doubles_each_attempt_until_budget_is_spent() {
        let policy = RetryPolicy::default();
        let mut machine = RetryMachine::new(base(), 4, true);
        let mut memory = Vec::new();

        loop {
            machine.begin();
            memory.push(machine.resources().memory_mb);
            match machine.fail(&oom(), &policy) {
                Transition::Retry { .. } => continue,
                Transition::GiveUp => break,
            }
        }

        assert_eq!(memory, vec![4096, 8192, 16384, 32768]);
        assert_eq!(machine.state(), &AttemptState::Failed { attempts: 4 });
    }

    #[test]
    fn test_non_oom_failure_is_never_retried() {
        let policy = RetryPolicy::default();
        let mut machine = RetryMachine::new(base(), 4, true);
        machine.begin();
        assert_eq!(machine.fail(&tool_error(), &policy), Transition::GiveUp);
        assert_eq!(machine.attempts(), 1);
    }

    #[test]
    fn test_non_retryable_node_gives_up_on_oom() {
        let policy = RetryPolicy::default();
        let mut machine = RetryMachine::new(base(), 4, false);
        machine.begin();
        assert_eq!(machine.fail(&oom(), &policy), Transition::GiveUp);
    }

    #[test]
    fn test_retry_transition_carries_backoff_and_resources() {
        let policy = RetryPolicy::default();
        let mut machine = RetryMachine::new(base(), 4, true);

        machine.begin();
        let first = machine.fail(&oom(), &policy);
        assert_eq!(
            first,
            Transition::Retry {
                attempt: 2,
                backoff: Duration::from_millis(1000),
                resources: ResourceProfile::new(2, 8192, 600),
            }
        );
        assert_eq!(machine.begin(), 2);

        let second = machine.fail(&oom(), &policy);
        assert!(matches!(
            second,
            Transition::Retry { attempt: 3, backoff, .. } if backoff == Duration::from_millis(2000)
        ));
    }

    #[test]
    fn test_success_records_attempts() {
        let policy = RetryPolicy::default();
        let mut machine = RetryMachine::new(base(), 4, true);
        machine.begin();
        machine.fail(&oom(), &policy);
        machine.begin();
        machine.succeed();
        assert_eq!(machine.state(), &AttemptState::Succeeded { attempts: 2 });
    }

    #[test]
    fn test_timeout_is_terminal_unless_configured() {
        let mut machine = RetryMachine::new(base(), 4, true);
        machine.begin();
        assert_eq!(machine.fail(&timeout(), &RetryPolicy::default()), Transition::GiveUp);

        let policy = RetryPolicy {
            retry_on_timeout: true,
            ..RetryPolicy::default()
        };
        let mut machine = RetryMachine::new(base(), 4, true);
        machine.begin();
        match machine.fail(&timeout(), &policy) {
            Transition::Retry { resources, .. } => {
                assert_eq!(resources.time_secs, 1200);
                assert_eq!(resources.memory_mb, 8192);
            }
            Transition::GiveUp => panic!("timeout should be retried when configured"),
        }
    }
}
