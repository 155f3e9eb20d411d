//! Implementation of the `try` task.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use thand_model::CatchClause;
use thand_model::RetryBackoff;
use thand_model::RetryPolicy;
use thand_model::TaskList;
use thand_model::TryTask;
use tracing::debug;

use super::ListOutcome;
use super::TaskEvaluator;
use super::TaskOutcome;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::error::runtime;
use crate::error::validation;
use crate::expr;

/// The default context key a caught error is bound to.
const DEFAULT_ERROR_KEY: &str = "error";

impl TaskEvaluator<'_> {
    /// Executes a `try` task: runs the `try` block, matching failures
    /// against the `catch` clause, retrying per its policy, and finally
    /// running `catch.do`.
    pub(crate) async fn execute_try(
        &mut self,
        task: &TryTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let try_path = reference.push("try");
        let started = self.context.backend().now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = self
                .attempt(&task.try_, &try_path, input.clone(), task.catch.as_ref())
                .await;

            let error = match result {
                Ok(ListOutcome::Next(value)) => return Ok(TaskOutcome::Output(value)),
                Ok(ListOutcome::End(value)) => return Ok(TaskOutcome::End(value)),
                Err(e) if e.is_control_flow() => return Err(e),
                Err(e) => e,
            };

            let Some(catch) = &task.catch else {
                return Err(error);
            };

            let descriptor = error.descriptor();

            if let Some(filter) = &catch.errors {
                if !descriptor.matches(&filter.with) {
                    return Err(error);
                }
            }

            let error_value = serde_json::to_value(&descriptor)
                .map_err(|e| runtime(format!("failed to serialize error: {e}"), reference))?;
            let bindings = self.bindings();

            if let Some(when) = &catch.when {
                if !expr::evaluate_bool(when, &error_value, &bindings, reference)? {
                    return Err(error);
                }
            }

            if let Some(except_when) = &catch.except_when {
                if expr::evaluate_bool(except_when, &error_value, &bindings, reference)? {
                    return Err(error);
                }
            }

            // The caught error is readable from expressions as
            // `$context.<as>`.
            let key = catch.as_.as_deref().unwrap_or(DEFAULT_ERROR_KEY);
            self.context.set_context_key(key, error_value);

            if let Some(retry) = &catch.retry {
                if retry_allows(retry, attempt, started, self.context.backend().now())? {
                    let delay = retry_delay(retry, attempt)?;
                    debug!(
                        "retrying `{reference}` (attempt {next}) after {delay:?}",
                        next = attempt + 1
                    );
                    if !delay.is_zero() {
                        self.context.backend().sleep(delay).await?;
                    }
                    continue;
                }
            }

            return match &catch.do_ {
                Some(do_) => {
                    let catch_path = reference.push("catch").push("do");
                    match self.evaluate_list(do_, &catch_path, 0, input.clone()).await? {
                        ListOutcome::Next(value) => Ok(TaskOutcome::Output(value)),
                        ListOutcome::End(value) => Ok(TaskOutcome::End(value)),
                    }
                }
                // Caught with no handler block: the error is recorded in the
                // context and the pipeline continues with the task input.
                None => Ok(TaskOutcome::Output(input)),
            };
        }
    }

    /// Runs one attempt of the `try` block, bounded by the per-attempt
    /// duration limit when one is set.
    async fn attempt(
        &mut self,
        list: &TaskList,
        path: &TaskPath,
        input: Value,
        catch: Option<&CatchClause>,
    ) -> WorkflowResult<ListOutcome> {
        let limit = catch
            .and_then(|c| c.retry.as_ref())
            .and_then(|r| r.limit.as_ref())
            .and_then(|l| l.attempt.as_ref())
            .and_then(|a| a.duration.as_ref());

        match limit {
            Some(spec) => {
                let duration = spec
                    .to_duration()
                    .map_err(|e| validation(e.to_string(), path))?;
                match tokio::time::timeout(duration, self.evaluate_list(list, path, 0, input))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(runtime(
                        format!("try attempt exceeded its duration limit of {duration:?}"),
                        path,
                    )),
                }
            }
            None => self.evaluate_list(list, path, 0, input).await,
        }
    }
}

/// Returns `true` if the retry policy allows another attempt.
fn retry_allows(
    policy: &RetryPolicy,
    attempts: u32,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> WorkflowResult<bool> {
    if let Some(limit) = &policy.limit {
        if let Some(count) = limit.attempt.as_ref().and_then(|a| a.count) {
            if attempts >= count {
                return Ok(false);
            }
        }

        if let Some(spec) = &limit.duration {
            let total = spec
                .to_duration()
                .map_err(|e| validation(e.to_string(), &TaskPath::root()))?;
            let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
            if elapsed >= total {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

/// Computes the delay before the next attempt.
fn retry_delay(policy: &RetryPolicy, attempt: u32) -> WorkflowResult<Duration> {
    let base = match &policy.delay {
        Some(spec) => spec
            .to_duration()
            .map_err(|e| validation(e.to_string(), &TaskPath::root()))?,
        None => return Ok(Duration::ZERO),
    };

    let delay = match policy.backoff.unwrap_or(RetryBackoff::Constant) {
        RetryBackoff::Constant => base,
        RetryBackoff::Linear => base.saturating_mul(attempt),
        RetryBackoff::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(31)),
    };

    Ok(delay)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use thand_model::DurationSpec;
    use thand_model::RetryLimit;

    use super::*;

    /// Builds a policy with the given delay, backoff, and attempt count.
    fn policy(delay: &str, backoff: RetryBackoff, count: u32) -> RetryPolicy {
        RetryPolicy {
            delay: Some(DurationSpec::Iso(delay.to_string())),
            backoff: Some(backoff),
            limit: Some(RetryLimit {
                attempt: Some(thand_model::AttemptLimit {
                    count: Some(count),
                    duration: None,
                }),
                duration: None,
            }),
        }
    }

    #[test]
    fn backoff_schedules() {
        let constant = policy("PT2S", RetryBackoff::Constant, 5);
        let linear = policy("PT2S", RetryBackoff::Linear, 5);
        let exponential = policy("PT2S", RetryBackoff::Exponential, 5);

        for attempt in 1..=3 {
            assert_eq!(
                retry_delay(&constant, attempt).expect("should compute"),
                Duration::from_secs(2)
            );
        }

        assert_eq!(
            retry_delay(&linear, 3).expect("should compute"),
            Duration::from_secs(6)
        );
        assert_eq!(
            retry_delay(&exponential, 3).expect("should compute"),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn attempt_count_limits_retries() {
        let policy = policy("PT0S", RetryBackoff::Constant, 3);
        let now = Utc::now();

        assert!(retry_allows(&policy, 1, now, now).expect("should compute"));
        assert!(retry_allows(&policy, 2, now, now).expect("should compute"));
        assert!(!retry_allows(&policy, 3, now, now).expect("should compute"));
    }

    #[test]
    fn total_duration_limits_retries() {
        let policy = RetryPolicy {
            delay: None,
            backoff: None,
            limit: Some(RetryLimit {
                attempt: None,
                duration: Some(DurationSpec::Iso("PT10S".to_string())),
            }),
        };

        let started = Utc::now();
        let within = started + chrono::Duration::seconds(5);
        let beyond = started + chrono::Duration::seconds(15);

        assert!(retry_allows(&policy, 1, started, within).expect("should compute"));
        assert!(!retry_allows(&policy, 1, started, beyond).expect("should compute"));
    }
}
