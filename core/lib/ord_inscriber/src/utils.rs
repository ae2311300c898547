use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::{
    metrics::{OperationLabel, METRICS},
    types::{InscriberError, Result},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u8,
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, retry: u8) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(u32::from(retry))),
        }
    }
}

/// Runs `f` until it succeeds, fails with a non retryable error, or the
/// policy runs out of attempts.
pub async fn with_retry<F, Fut, T>(mut f: F, policy: &RetryPolicy, operation_name: &str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                let delay = policy.delay_for(retries);
                tracing::warn!(
                    error = %e,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    "{} failed, retrying",
                    operation_name
                );
                METRICS.retries[&operation_label(operation_name)].inc();
                retries += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    METRICS.max_retries_exceeded[&operation_label(operation_name)].inc();
                }
                return Err(e);
            }
        }
    }
}

fn operation_label(operation_name: &str) -> OperationLabel {
    OperationLabel {
        operation: operation_name.to_string(),
    }
}

pub(crate) fn log_failure(error: &InscriberError, operation_name: &str) {
    METRICS.record_failure(error);
    tracing::error!(
        code = error.kind().code(),
        category = ?error.category(),
        "{} failed: {}",
        operation_name,
        error
    );
}
