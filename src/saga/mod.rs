// Copyright 2025 Machina Contributors.

//! Linear saga orchestration with per-step timeout, retry, and reverse
//! compensation
//!
//! A saga executes an ordered list of typed steps against other entities.
//! On failure, the compensations of every previously successful step run
//! in reverse order. The saga's own status is a state machine, and every
//! step boundary, compensation attempt, and status change is appended to
//! the saga's event stream with the correlation id attached.

mod state;
mod step;

pub use state::{status_machine, SagaSignal, SagaStatus};
pub use step::{
    BusinessTxIdFn, CompensationRecord, CompensationResult, SagaConfig, SagaStep, StepContext,
    StepExecution, StepOutcome, StepResult,
};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{MachinaError, MachinaResult};
use crate::eventlog::{EventLog, EventRecord, SagaEventKind, SagaEventRecord};
use crate::machine::{State, StateMachine};

/// Terminal summary returned by [`SagaOrchestrator::execute`]
#[derive(Debug, Clone)]
pub struct SagaResult {
    /// Saga identifier
    pub saga_id: Uuid,
    /// Terminal status
    pub status: SagaStatus,
    /// Business transaction identifier assigned at start
    pub business_tx_id: String,
    /// Number of steps that completed successfully
    pub completed_steps: usize,
    /// Failure description for non-success terminals
    pub error: Option<String>,
}

impl SagaResult {
    /// Whether every step succeeded
    pub fn is_success(&self) -> bool {
        self.status == SagaStatus::Succeeded
    }
}

/// Orchestrator owning one saga execution
pub struct SagaOrchestrator {
    saga_id: Uuid,
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
    status: StateMachine<SagaStatus, SagaSignal>,
    history: Vec<StepExecution>,
    current_index: usize,
    business_tx_id: Option<String>,
    correlation_id: Option<String>,
    log: Arc<dyn EventLog>,
    config: SagaConfig,
}

impl SagaOrchestrator {
    /// Create a saga over `steps`, logging into `log`
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Arc<dyn SagaStep>>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self::with_config(name, steps, log, SagaConfig::default())
    }

    /// Create a saga with explicit tuning
    pub fn with_config(
        name: impl Into<String>,
        steps: Vec<Arc<dyn SagaStep>>,
        log: Arc<dyn EventLog>,
        config: SagaConfig,
    ) -> Self {
        Self {
            saga_id: Uuid::new_v4(),
            name: name.into(),
            steps,
            status: status_machine(),
            history: Vec::new(),
            current_index: 0,
            business_tx_id: None,
            correlation_id: None,
            log,
            config,
        }
    }

    /// This saga's identifier (also its event stream id)
    pub fn saga_id(&self) -> Uuid {
        self.saga_id
    }

    /// The saga's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle status
    pub fn status(&self) -> SagaStatus {
        *self.status.state()
    }

    /// Ordered execution history, one record per attempt
    pub fn history(&self) -> &[StepExecution] {
        &self.history
    }

    /// Business transaction id, present once execution has started
    pub fn business_tx_id(&self) -> Option<&str> {
        self.business_tx_id.as_deref()
    }

    fn generate_business_tx_id(&self, data: &Value) -> String {
        match &self.config.business_tx_id {
            Some(hook) => hook(data),
            None => format!("SAGA-{}-{}", self.saga_id, Utc::now().timestamp_millis()),
        }
    }

    /// Run the saga to a terminal status
    ///
    /// The returned result carries the terminal status; step failures are
    /// resolved through compensation rather than surfaced as errors.
    /// Calling `execute` more than once is rejected.
    pub async fn execute(
        &mut self,
        data: Value,
        correlation_id: Option<String>,
    ) -> MachinaResult<SagaResult> {
        if self.status() != SagaStatus::NotStarted {
            return Err(MachinaError::InvalidOperation {
                reason: format!("saga {} already executed", self.saga_id),
            });
        }

        let business_tx_id = self.generate_business_tx_id(&data);
        self.business_tx_id = Some(business_tx_id.clone());
        self.correlation_id = correlation_id;

        self.transition(SagaSignal::Start).await?;
        info!(
            saga_id = %self.saga_id,
            name = %self.name,
            business_tx_id = %business_tx_id,
            steps = self.steps.len(),
            "saga started"
        );

        let mut ctx = StepContext {
            saga_id: self.saga_id,
            business_tx_id: business_tx_id.clone(),
            correlation_id: self.correlation_id.clone(),
            attempt: 0,
            shared: HashMap::new(),
        };

        let mut failure: Option<String> = None;
        'steps: for index in 0..self.steps.len() {
            let step = self.steps[index].clone();
            let mut attempt: u32 = 1;
            loop {
                ctx.attempt = attempt;
                self.emit_step(SagaEventKind::StepStart, step.name(), Some(attempt), None)
                    .await;
                let started_at = Utc::now();

                let outcome = match timeout(
                    step.timeout(),
                    AssertUnwindSafe(step.execute(&data, &mut ctx)).catch_unwind(),
                )
                .await
                {
                    Err(_) => StepResult::technical("timeout"),
                    Ok(Err(_)) => StepResult::technical("step panicked"),
                    Ok(Ok(result)) => result,
                };

                match outcome {
                    StepResult::Success(payload) => {
                        self.history.push(StepExecution {
                            step_name: step.name().to_string(),
                            attempt,
                            started_at,
                            ended_at: Utc::now(),
                            outcome: StepOutcome::Success,
                            result: Some(payload),
                            error: None,
                            compensation: None,
                        });
                        self.emit_step(
                            SagaEventKind::StepEnd,
                            step.name(),
                            Some(attempt),
                            Some(StepOutcome::Success.label()),
                        )
                        .await;
                        self.current_index = index + 1;
                        continue 'steps;
                    }
                    StepResult::BusinessFailure(reason) => {
                        self.history.push(StepExecution {
                            step_name: step.name().to_string(),
                            attempt,
                            started_at,
                            ended_at: Utc::now(),
                            outcome: StepOutcome::BusinessFailure,
                            result: None,
                            error: Some(reason.clone()),
                            compensation: None,
                        });
                        self.emit_step(
                            SagaEventKind::StepEnd,
                            step.name(),
                            Some(attempt),
                            Some(StepOutcome::BusinessFailure.label()),
                        )
                        .await;
                        failure = Some(format!("step {} rejected: {reason}", step.name()));
                        break 'steps;
                    }
                    StepResult::TechnicalFailure { reason, cause } => {
                        let error = match &cause {
                            Some(cause) => format!("{reason}: {cause}"),
                            None => reason.clone(),
                        };
                        self.history.push(StepExecution {
                            step_name: step.name().to_string(),
                            attempt,
                            started_at,
                            ended_at: Utc::now(),
                            outcome: StepOutcome::TechnicalFailure,
                            result: None,
                            error: Some(error.clone()),
                            compensation: None,
                        });
                        self.emit_step(
                            SagaEventKind::StepEnd,
                            step.name(),
                            Some(attempt),
                            Some(StepOutcome::TechnicalFailure.label()),
                        )
                        .await;

                        if step.can_retry() && attempt <= step.max_retries() {
                            let delay = self.config.backoff(attempt);
                            warn!(
                                saga_id = %self.saga_id,
                                step = step.name(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "step failed; retrying after backoff"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }

                        failure = Some(format!("step {} exhausted: {error}", step.name()));
                        break 'steps;
                    }
                }
            }
        }

        let result = match failure {
            None => {
                self.transition(SagaSignal::Complete).await?;
                info!(saga_id = %self.saga_id, "saga succeeded");
                SagaResult {
                    saga_id: self.saga_id,
                    status: SagaStatus::Succeeded,
                    business_tx_id,
                    completed_steps: self.current_index,
                    error: None,
                }
            }
            Some(reason) => {
                let status = self.compensate(&data, &mut ctx).await?;
                SagaResult {
                    saga_id: self.saga_id,
                    status,
                    business_tx_id,
                    completed_steps: self.current_index,
                    error: Some(reason),
                }
            }
        };

        Ok(result)
    }

    /// Compensate every successful step in reverse order
    async fn compensate(&mut self, data: &Value, ctx: &mut StepContext) -> MachinaResult<SagaStatus> {
        self.transition(SagaSignal::StepFailed).await?;
        warn!(
            saga_id = %self.saga_id,
            completed = self.current_index,
            "compensating in reverse order"
        );

        let mut all_succeeded = true;
        for index in (0..self.current_index).rev() {
            let step = self.steps[index].clone();
            let last_result = self
                .history
                .iter()
                .rev()
                .find(|e| e.step_name == step.name() && e.outcome == StepOutcome::Success)
                .and_then(|e| e.result.clone());

            self.emit_step(SagaEventKind::CompStart, step.name(), None, None).await;

            let outcome = match timeout(
                step.timeout(),
                AssertUnwindSafe(step.compensate(data, last_result.as_ref(), ctx)).catch_unwind(),
            )
            .await
            {
                Err(_) => CompensationResult::Failure {
                    reason: "timeout".to_string(),
                    cause: None,
                },
                Ok(Err(_)) => CompensationResult::Failure {
                    reason: "compensation panicked".to_string(),
                    cause: None,
                },
                Ok(Ok(result)) => result,
            };

            let record = match outcome {
                CompensationResult::Success => CompensationRecord {
                    succeeded: true,
                    error: None,
                    compensated_at: Utc::now(),
                },
                CompensationResult::Failure { reason, cause } => {
                    all_succeeded = false;
                    let error = match cause {
                        Some(cause) => format!("{reason}: {cause}"),
                        None => reason,
                    };
                    warn!(
                        saga_id = %self.saga_id,
                        step = step.name(),
                        error = %error,
                        "compensation failed; continuing with earlier steps"
                    );
                    CompensationRecord {
                        succeeded: false,
                        error: Some(error),
                        compensated_at: Utc::now(),
                    }
                }
            };

            self.emit_step(
                SagaEventKind::CompEnd,
                step.name(),
                None,
                Some(if record.succeeded { "Success" } else { "Failure" }),
            )
            .await;

            if let Some(entry) = self
                .history
                .iter_mut()
                .rev()
                .find(|e| e.step_name == step.name() && e.outcome == StepOutcome::Success)
            {
                entry.compensation = Some(record);
            }
        }

        let signal = if all_succeeded {
            SagaSignal::CompensationSucceeded
        } else {
            SagaSignal::CompensationFailed
        };
        self.transition(signal).await?;
        Ok(self.status())
    }

    /// Fire a signal at the status machine and record the status change
    async fn transition(&mut self, signal: SagaSignal) -> MachinaResult<()> {
        self.status.fire(signal)?;
        let status = *self.status.state();
        self.emit(SagaEventRecord {
            saga_id: self.saga_id,
            seq: 0,
            kind: SagaEventKind::StatusChange,
            step_name: None,
            attempt: None,
            outcome: Some(status.name().to_string()),
            timestamp_utc: Utc::now(),
            correlation_id: self.correlation_id.clone(),
            business_tx_id: self.business_tx_id.clone(),
        })
        .await;
        Ok(())
    }

    async fn emit_step(
        &self,
        kind: SagaEventKind,
        step_name: &str,
        attempt: Option<u32>,
        outcome: Option<&str>,
    ) {
        self.emit(SagaEventRecord {
            saga_id: self.saga_id,
            seq: 0,
            kind,
            step_name: Some(step_name.to_string()),
            attempt,
            outcome: outcome.map(str::to_string),
            timestamp_utc: Utc::now(),
            correlation_id: self.correlation_id.clone(),
            business_tx_id: self.business_tx_id.clone(),
        })
        .await;
    }

    async fn emit(&self, record: SagaEventRecord) {
        let stream_id = self.saga_id.to_string();
        if let Err(err) = self
            .log
            .append(&stream_id, vec![EventRecord::Saga(record)], None)
            .await
        {
            warn!(saga_id = %self.saga_id, error = %err, "failed to append saga event");
        }
    }
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("saga_id", &self.saga_id)
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::InMemoryEventLog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_config() -> SagaConfig {
        SagaConfig {
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            business_tx_id: None,
        }
    }

    struct OkStep {
        name: &'static str,
    }

    #[async_trait]
    impl SagaStep for OkStep {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _data: &Value, _ctx: &mut StepContext) -> StepResult {
            StepResult::Success(serde_json::json!({"step": self.name}))
        }
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut saga = SagaOrchestrator::with_config(
            "checkout",
            vec![
                Arc::new(OkStep { name: "reserve" }),
                Arc::new(OkStep { name: "charge" }),
            ],
            log.clone(),
            test_config(),
        );

        let result = saga.execute(serde_json::json!({}), Some("corr-9".to_string())).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.completed_steps, 2);
        assert_eq!(saga.status(), SagaStatus::Succeeded);
        assert!(result.business_tx_id.starts_with("SAGA-"));

        // Every event carries the correlation id
        let events = log.read(&saga.saga_id().to_string(), 0, 100).await.unwrap();
        assert!(events
            .iter()
            .filter_map(EventRecord::as_saga)
            .all(|e| e.correlation_id.as_deref() == Some("corr-9")));
    }

    #[tokio::test]
    async fn test_execute_twice_rejected() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut saga = SagaOrchestrator::with_config(
            "once",
            vec![Arc::new(OkStep { name: "only" })],
            log,
            test_config(),
        );
        saga.execute(Value::Null, None).await.unwrap();
        assert!(saga.execute(Value::Null, None).await.is_err());
    }

    struct FlakyStep {
        attempts_before_success: u32,
        counter: AtomicU32,
    }

    #[async_trait]
    impl SagaStep for FlakyStep {
        fn name(&self) -> &str {
            "flaky"
        }

        fn can_retry(&self) -> bool {
            true
        }

        fn max_retries(&self) -> u32 {
            3
        }

        async fn execute(&self, _data: &Value, _ctx: &mut StepContext) -> StepResult {
            let attempt = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < self.attempts_before_success {
                StepResult::technical("transient")
            } else {
                StepResult::Success(Value::Null)
            }
        }
    }

    #[tokio::test]
    async fn test_technical_failure_retries_until_success() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut saga = SagaOrchestrator::with_config(
            "retrying",
            vec![Arc::new(FlakyStep {
                attempts_before_success: 3,
                counter: AtomicU32::new(0),
            })],
            log,
            test_config(),
        );

        let result = saga.execute(Value::Null, None).await.unwrap();
        assert!(result.is_success());
        // Two failed attempts plus the success
        assert_eq!(saga.history().len(), 3);
        assert_eq!(saga.history()[2].attempt, 3);
        assert_eq!(saga.history()[2].outcome, StepOutcome::Success);
    }

    struct TimeoutStep;

    #[async_trait]
    impl SagaStep for TimeoutStep {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn execute(&self, _data: &Value, _ctx: &mut StepContext) -> StepResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StepResult::Success(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_timeout_is_technical_failure() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut saga = SagaOrchestrator::with_config(
            "timeouts",
            vec![Arc::new(TimeoutStep)],
            log,
            test_config(),
        );

        let result = saga.execute(Value::Null, None).await.unwrap();
        assert_eq!(result.status, SagaStatus::Compensated);
        assert_eq!(saga.history()[0].outcome, StepOutcome::TechnicalFailure);
        assert_eq!(saga.history()[0].error.as_deref(), Some("timeout"));
    }

    struct PanickingStep;

    #[async_trait]
    impl SagaStep for PanickingStep {
        fn name(&self) -> &str {
            "bomb"
        }

        async fn execute(&self, _data: &Value, _ctx: &mut StepContext) -> StepResult {
            panic!("step exploded");
        }
    }

    #[tokio::test]
    async fn test_step_panic_contained_as_technical_failure() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut saga = SagaOrchestrator::with_config(
            "contained",
            vec![Arc::new(PanickingStep)],
            log,
            test_config(),
        );

        let result = saga.execute(Value::Null, None).await.unwrap();
        assert_eq!(result.status, SagaStatus::Compensated);
        assert!(saga.history()[0].error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_custom_business_tx_id_hook() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut config = test_config();
        config.business_tx_id = Some(Arc::new(|data: &Value| {
            format!("ORDER-{}", data.get("order").and_then(Value::as_str).unwrap_or("?"))
        }));
        let mut saga = SagaOrchestrator::with_config(
            "txid",
            vec![Arc::new(OkStep { name: "only" })],
            log,
            config,
        );

        let result = saga
            .execute(serde_json::json!({"order": "A17"}), None)
            .await
            .unwrap();
        assert_eq!(result.business_tx_id, "ORDER-A17");
    }

    #[tokio::test]
    async fn test_empty_saga_succeeds() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut saga = SagaOrchestrator::with_config("empty", vec![], log, test_config());
        let result = saga.execute(Value::Null, None).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.completed_steps, 0);
    }
}
