//! Retry policy: which failures are worth another execution.

use std::collections::HashSet;

use regex::Regex;

use super::model::{FailureInfo, Outcome};
use crate::chain::StepOutcome;
use crate::config::GovernorConfig;
use crate::error::{ErrorClass, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    retryable: HashSet<ErrorClass>,
    fatal_patterns: Vec<Regex>,
}

impl RetryPolicy {
    pub fn from_config(config: &GovernorConfig) -> Result<Self> {
        let fatal_patterns = config
            .fatal_message_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            max_attempts: config.max_attempts,
            retryable: config.retryable_classes.iter().copied().collect(),
            fatal_patterns,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Chain protocol failures are producer bugs and never retried, whatever
    /// the configured classes say.
    pub fn is_retryable(&self, failure: &FailureInfo) -> bool {
        if failure.class == ErrorClass::ChainProtocol {
            return false;
        }
        if self.fatal_patterns.iter().any(|re| re.is_match(&failure.message)) {
            return false;
        }
        self.retryable.contains(&failure.class)
    }

    /// Whether an execution at `attempt` may be followed by another.
    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn classify(&self, failure: FailureInfo) -> Outcome {
        if self.is_retryable(&failure) {
            Outcome::RetryableFailure { failure }
        } else {
            Outcome::FatalFailure { failure }
        }
    }

    pub fn outcome_for(&self, step: &StepOutcome) -> Outcome {
        match &step.failure {
            None if step.is_success() => Outcome::Success {
                output: step.output.clone(),
            },
            Some(failure) => self.classify(failure.clone()),
            None => self.classify(FailureInfo::new(
                ErrorClass::Internal,
                "step failed without a reason",
            )),
        }
    }
}
