// Copyright 2025 Machina Contributors.

//! The saga's own status machine
//!
//! A saga's lifecycle is itself a state machine driven by the orchestrator:
//! `NotStarted -> Running -> {Succeeded | Compensating | Failed}` and
//! `Compensating -> {Compensated | Failed}`. Every status change is an
//! event in the saga's stream.

use serde::{Deserialize, Serialize};

use crate::machine::{State, StateMachine, Trigger};

/// Lifecycle status of a saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStatus {
    /// Created but not yet executed
    NotStarted,
    /// Steps are executing forward
    Running,
    /// A step failed; compensations are running in reverse
    Compensating,
    /// Every step succeeded
    Succeeded,
    /// Terminal failure (a compensation failed, or a fatal error)
    Failed,
    /// Every required compensation succeeded
    Compensated,
}

impl State for SagaStatus {
    fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Compensating => "Compensating",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Compensated => "Compensated",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Compensated)
    }
}

/// Signals the orchestrator fires at the status machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaSignal {
    /// Execution begins
    Start,
    /// The last step succeeded
    Complete,
    /// A step failed and compensation is required
    StepFailed,
    /// Every compensation succeeded
    CompensationSucceeded,
    /// At least one compensation failed
    CompensationFailed,
    /// Unrecoverable failure before any step succeeded
    Fatal,
}

impl Trigger for SagaSignal {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Complete => "Complete",
            Self::StepFailed => "StepFailed",
            Self::CompensationSucceeded => "CompensationSucceeded",
            Self::CompensationFailed => "CompensationFailed",
            Self::Fatal => "Fatal",
        }
    }
}

/// Build the status machine every saga runs on
pub fn status_machine() -> StateMachine<SagaStatus, SagaSignal> {
    let mut machine = StateMachine::new(SagaStatus::NotStarted);
    machine
        .configure(SagaStatus::NotStarted)
        .permit(SagaSignal::Start, SagaStatus::Running);
    machine
        .configure(SagaStatus::Running)
        .permit(SagaSignal::Complete, SagaStatus::Succeeded)
        .permit(SagaSignal::StepFailed, SagaStatus::Compensating)
        .permit(SagaSignal::Fatal, SagaStatus::Failed);
    machine
        .configure(SagaStatus::Compensating)
        .permit(SagaSignal::CompensationSucceeded, SagaStatus::Compensated)
        .permit(SagaSignal::CompensationFailed, SagaStatus::Failed);
    machine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut machine = status_machine();
        machine.fire(SagaSignal::Start).unwrap();
        assert_eq!(machine.state(), &SagaStatus::Running);
        machine.fire(SagaSignal::Complete).unwrap();
        assert_eq!(machine.state(), &SagaStatus::Succeeded);
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_compensation_path() {
        let mut machine = status_machine();
        machine.fire(SagaSignal::Start).unwrap();
        machine.fire(SagaSignal::StepFailed).unwrap();
        assert_eq!(machine.state(), &SagaStatus::Compensating);
        machine.fire(SagaSignal::CompensationSucceeded).unwrap();
        assert_eq!(machine.state(), &SagaStatus::Compensated);
    }

    #[test]
    fn test_compensation_failure_terminates_failed() {
        let mut machine = status_machine();
        machine.fire(SagaSignal::Start).unwrap();
        machine.fire(SagaSignal::StepFailed).unwrap();
        machine.fire(SagaSignal::CompensationFailed).unwrap();
        assert_eq!(machine.state(), &SagaStatus::Failed);
    }

    #[test]
    fn test_invalid_signals_rejected() {
        let mut machine = status_machine();
        // Cannot complete a saga that never started
        assert!(machine.fire(SagaSignal::Complete).is_err());
        machine.fire(SagaSignal::Start).unwrap();
        assert!(machine.fire(SagaSignal::Start).is_err());
        machine.fire(SagaSignal::Complete).unwrap();
        // Terminal states accept nothing
        assert!(machine.fire(SagaSignal::StepFailed).is_err());
    }
}
