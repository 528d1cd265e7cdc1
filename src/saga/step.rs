// Copyright 2025 Machina Contributors.

//! Saga step contract and execution records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result of one step execution attempt
#[derive(Debug, Clone)]
pub enum StepResult {
    /// The step did its work; the payload feeds its compensation later
    Success(Value),
    /// A domain-level rejection; never retried, compensation starts
    BusinessFailure(String),
    /// An infrastructure fault; retried while the budget lasts
    TechnicalFailure {
        /// What went wrong
        reason: String,
        /// Underlying cause, if known
        cause: Option<String>,
    },
}

impl StepResult {
    /// Technical failure with no separate cause
    pub fn technical(reason: impl Into<String>) -> Self {
        Self::TechnicalFailure {
            reason: reason.into(),
            cause: None,
        }
    }
}

/// Result of one compensation attempt
#[derive(Debug, Clone)]
pub enum CompensationResult {
    /// The inverse operation completed
    Success,
    /// The inverse operation failed; later compensations still run
    Failure {
        /// What went wrong
        reason: String,
        /// Underlying cause, if known
        cause: Option<String>,
    },
}

/// Outcome label recorded in history and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The attempt succeeded
    Success,
    /// The attempt failed on a business rule
    BusinessFailure,
    /// The attempt failed technically (including timeout)
    TechnicalFailure,
}

impl StepOutcome {
    /// Stable label used in persisted events
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::BusinessFailure => "BusinessFailure",
            Self::TechnicalFailure => "TechnicalFailure",
        }
    }
}

/// Record of one compensation attempt attached to a step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// Whether the compensation succeeded
    pub succeeded: bool,
    /// Failure description when it did not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the compensation finished
    pub compensated_at: DateTime<Utc>,
}

/// Record of one step execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Name of the step
    pub step_name: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt ended
    pub ended_at: DateTime<Utc>,
    /// How the attempt ended
    pub outcome: StepOutcome,
    /// Success payload, kept for compensation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Compensation attempt, filled in if the saga compensates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationRecord>,
}

/// Context handed to step executions and compensations
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Saga the step belongs to
    pub saga_id: Uuid,
    /// Business transaction identifier assigned at saga start
    pub business_tx_id: String,
    /// Correlation identifier the saga runs under
    pub correlation_id: Option<String>,
    /// 1-based attempt number of the current execution
    pub attempt: u32,
    /// Bag shared between steps of this saga, in execution order
    pub shared: HashMap<String, Value>,
}

/// One typed step in a linear saga
///
/// `execute` runs under the step's timeout; expiry is treated as a
/// technical failure and consumes one retry. `compensate` receives the
/// payload the successful execution returned.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name, unique within the saga
    fn name(&self) -> &str;

    /// Deadline for one execution attempt
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Whether technical failures may be retried
    fn can_retry(&self) -> bool {
        false
    }

    /// Retry budget after the first attempt
    fn max_retries(&self) -> u32 {
        0
    }

    /// Free-form step metadata
    fn metadata(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Do the step's work
    async fn execute(&self, data: &Value, ctx: &mut StepContext) -> StepResult;

    /// Undo the step's work; `last_result` is the payload `execute` returned
    async fn compensate(
        &self,
        _data: &Value,
        _last_result: Option<&Value>,
        _ctx: &mut StepContext,
    ) -> CompensationResult {
        CompensationResult::Success
    }
}

/// Hook computing the business transaction id from the saga's input
pub type BusinessTxIdFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Orchestrator tuning knobs
#[derive(Clone)]
pub struct SagaConfig {
    /// First retry delay; doubles per attempt
    pub base_backoff: Duration,
    /// Ceiling on the retry delay
    pub max_backoff: Duration,
    /// Override for business transaction id generation
    pub business_tx_id: Option<BusinessTxIdFn>,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            business_tx_id: None,
        }
    }
}

impl SagaConfig {
    /// Exponential backoff before retrying `attempt` (1-based), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl std::fmt::Debug for SagaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaConfig")
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("has_business_tx_id_hook", &self.business_tx_id.is_some())
            .finish()
    }
}
