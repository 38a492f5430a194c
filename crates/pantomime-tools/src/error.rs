use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure an invocation (or the machinery around it) can produce.
///
/// The same taxonomy is used on the wire and inside the runtime so no
/// pipeline stage needs a private error vocabulary.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvokeError {
    #[error("invalid input for {action}: {message}")]
    Validation { action: String, message: String },

    #[error("{message}")]
    Auth { message: String },

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimitExceeded { retry_after_ms: u64 },

    #[error("transient backend fault: {message}")]
    ChaosTransient { message: String },

    #[error("permanent backend fault: {message}")]
    ChaosPermanent { message: String },

    #[error("state conflict after {attempts} attempts")]
    StateConflict { attempts: u32 },

    #[error("workflow step {step} failed: {cause}")]
    WorkflowStepFailure { step: usize, cause: Box<InvokeError> },

    #[error("trigger delivery failed: {message}")]
    TriggerDeliveryFailure { message: String },

    #[error("unknown app: {app}")]
    UnknownApp { app: String },

    #[error("unknown action {action} in app {app}")]
    UnknownAction { app: String, action: String },

    #[error("unknown subscription: {id}")]
    UnknownSubscription { id: String },
}

impl InvokeError {
    pub fn validation<A: Into<String>, M: Into<String>>(action: A, message: M) -> Self {
        InvokeError::Validation {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn auth<M: Into<String>>(message: M) -> Self {
        InvokeError::Auth {
            message: message.into(),
        }
    }

    pub fn transient<M: Into<String>>(message: M) -> Self {
        InvokeError::ChaosTransient {
            message: message.into(),
        }
    }

    pub fn permanent<M: Into<String>>(message: M) -> Self {
        InvokeError::ChaosPermanent {
            message: message.into(),
        }
    }

    pub fn workflow_step(step: usize, cause: InvokeError) -> Self {
        InvokeError::WorkflowStepFailure {
            step,
            cause: Box::new(cause),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            InvokeError::Validation { .. } => ErrorKind::Validation,
            InvokeError::Auth { .. } => ErrorKind::Auth,
            InvokeError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            InvokeError::ChaosTransient { .. } => ErrorKind::ChaosTransient,
            InvokeError::ChaosPermanent { .. } => ErrorKind::ChaosPermanent,
            InvokeError::StateConflict { .. } => ErrorKind::StateConflict,
            InvokeError::WorkflowStepFailure { .. } => ErrorKind::WorkflowStepFailure,
            InvokeError::TriggerDeliveryFailure { .. } => ErrorKind::TriggerDeliveryFailure,
            InvokeError::UnknownApp { .. } => ErrorKind::UnknownApp,
            InvokeError::UnknownAction { .. } => ErrorKind::UnknownAction,
            InvokeError::UnknownSubscription { .. } => ErrorKind::UnknownSubscription,
        }
    }

    /// Whether a caller may retry the same invocation and hope for a
    /// different outcome without changing anything first.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::RateLimitExceeded { .. }
            | InvokeError::ChaosTransient { .. }
            | InvokeError::StateConflict { .. }
            | InvokeError::TriggerDeliveryFailure { .. } => true,
            InvokeError::WorkflowStepFailure { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Advisory wait before retrying, when one exists.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            InvokeError::RateLimitExceeded { retry_after_ms } => Some(*retry_after_ms),
            InvokeError::WorkflowStepFailure { cause, .. } => cause.retry_after_ms(),
            _ => None,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimitExceeded,
    ChaosTransient,
    ChaosPermanent,
    StateConflict,
    WorkflowStepFailure,
    TriggerDeliveryFailure,
    UnknownApp,
    UnknownAction,
    UnknownSubscription,
}

/// Uniform wire shape for every failure, regardless of which pipeline
/// stage produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&InvokeError> for ErrorPayload {
    fn from(err: &InvokeError) -> Self {
        ErrorPayload {
            kind: err.kind(),
            message: err.to_string(),
            retry_after_ms: err.retry_after_ms(),
        }
    }
}

impl From<InvokeError> for ErrorPayload {
    fn from(err: InvokeError) -> Self {
        ErrorPayload::from(&err)
    }
}
