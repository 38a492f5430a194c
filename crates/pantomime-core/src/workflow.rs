//! Multi-step workflows over app actions.
//!
//! A workflow is a linear sequence of action invocations, each retried
//! on retryable faults with exponential backoff. Steps get a derived
//! idempotency key by default, so re-running an interrupted workflow
//! does not re-apply the steps that already committed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use pantomime_tools::{ErrorPayload, InvocationOutcome, InvokeError};

use crate::registry::Registry;
use crate::types::{InstanceId, WorkflowId};

const STEP_BACKOFF_BASE: Duration = Duration::from_millis(50);
const STEP_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// What to do when a step exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the workflow and surface the step's error.
    #[default]
    Abort,
    /// Record the failure and move on to the next step.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub app: String,
    pub account: String,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    /// Extra attempts granted for retryable faults.
    #[serde(default = "default_step_retries")]
    pub retry_limit: u32,
    /// Overrides the derived `{workflow_id}:{step_index}` key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_step_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: WorkflowId,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Completed { outcome: InvocationOutcome },
    Failed { error: ErrorPayload },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub attempts: u32,
    #[serde(flatten)]
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: WorkflowId,
    /// True when every step completed.
    pub completed: bool,
    pub steps: Vec<StepOutcome>,
}

/// Run a workflow against the registry's instances.
///
/// The report always comes back, whatever the failure policy: under
/// [`FailurePolicy::Abort`] the remaining steps are skipped but the
/// outcomes of the steps that already ran (committed ones included) are
/// still reported.
#[instrument(skip(registry, spec), fields(workflow = %spec.id))]
pub async fn run(registry: &Registry, spec: &WorkflowSpec) -> WorkflowReport {
    let mut steps = Vec::with_capacity(spec.steps.len());
    let mut completed = true;

    for (index, step) in spec.steps.iter().enumerate() {
        let key = step
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("{}:{index}", spec.id));
        match run_step(registry, step, &key).await {
            Ok((outcome, attempts)) => {
                steps.push(StepOutcome {
                    index,
                    attempts,
                    status: StepStatus::Completed { outcome },
                });
            }
            Err((err, attempts)) => {
                warn!(step = index, error = %err, "workflow step failed");
                steps.push(StepOutcome {
                    index,
                    attempts,
                    status: StepStatus::Failed {
                        error: ErrorPayload::from(&err),
                    },
                });
                completed = false;
                if spec.on_failure == FailurePolicy::Abort {
                    break;
                }
            }
        }
    }

    WorkflowReport {
        workflow_id: spec.id.clone(),
        completed,
        steps,
    }
}

async fn run_step(
    registry: &Registry,
    step: &WorkflowStep,
    idempotency_key: &str,
) -> Result<(InvocationOutcome, u32), (InvokeError, u32)> {
    let instance = InstanceId::new(step.app.as_str(), step.account.as_str());
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match registry
            .invoke(
                &instance,
                &step.action,
                step.input.clone(),
                Some(idempotency_key),
            )
            .await
        {
            Ok(outcome) => return Ok((outcome, attempts)),
            Err(err) if err.is_retryable() && attempts <= step.retry_limit => {
                let delay = backoff_for(&err, attempts);
                debug!(
                    action = step.action,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying workflow step"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err((err, attempts)),
        }
    }
}

/// Honors the limiter's retry hint when one is present, otherwise
/// exponential from the base, both capped.
fn backoff_for(err: &InvokeError, attempt: u32) -> Duration {
    let delay = match err.retry_after_ms() {
        Some(ms) => Duration::from_millis(ms),
        None => STEP_BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1)),
    };
    delay.min(STEP_BACKOFF_CAP)
}
