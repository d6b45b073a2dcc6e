// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry budget for peer calls made from task bodies.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::CoreError;
use crate::task::TaskError;

/// Uniform back-off budget. Only transient transport errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            attempts: 30,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryBudget {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    /// Wakes early with `Cancelled` when `cancel` trips during a back-off.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut op: F,
    ) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(what, attempt, attempts, error = %e, "Transient peer error, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(TaskError::Failed(format!(
                        "{} failed after {} attempts: {}",
                        what, attempts, e
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
