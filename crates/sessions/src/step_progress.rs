//! Step progress tracking.
//!
//! One [`StepProgress`] record per (session, step). Records are created on first
//! completion and never deleted while the session exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tryout_campaigns::{Procedure, ProcedureStep, StepType};
use tryout_core::{DomainError, DomainResult, SessionId, StepId};

use crate::step_validator::validate_step_value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    pub session_id: SessionId,
    pub step_id: StepId,
    pub completed: bool,
    /// First completion time; later re-completions keep it.
    pub completed_at: Option<DateTime<Utc>>,
    pub payload: Option<Value>,
    /// Only set on the price-validation step.
    pub validated_price: Option<i64>,
}

/// Outcome of completing a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCompletion {
    /// The record to upsert.
    pub progress: StepProgress,
    /// Whether every required step of every required procedure is now complete.
    pub all_required_complete: bool,
}

/// Evaluates completions against a campaign's procedures and a session's progress.
#[derive(Debug, Clone, Copy)]
pub struct StepTracker<'a> {
    procedures: &'a [Procedure],
    progress: &'a [StepProgress],
}

impl<'a> StepTracker<'a> {
    pub fn new(procedures: &'a [Procedure], progress: &'a [StepProgress]) -> Self {
        Self {
            procedures,
            progress,
        }
    }

    fn record(&self, step_id: StepId) -> Option<&'a StepProgress> {
        self.progress.iter().find(|p| p.step_id == step_id)
    }

    pub fn is_complete(&self, step_id: StepId) -> bool {
        self.record(step_id).is_some_and(|p| p.completed)
    }

    /// Validate and record completion of `step_id` with `payload`.
    pub fn complete(
        &self,
        session_id: SessionId,
        step_id: StepId,
        payload: Value,
        at: DateTime<Utc>,
    ) -> DomainResult<StepCompletion> {
        let (procedure, step) = self
            .procedures
            .iter()
            .find_map(|p| p.step(step_id).map(|s| (p, s)))
            .ok_or_else(|| DomainError::not_found(format!("step {step_id}")))?;

        if step.step_type == StepType::PriceValidation {
            return Err(DomainError::precondition(format!(
                "step \"{}\" is a price validation step and must be submitted through price validation",
                step.title
            )));
        }

        if let Some(blocking) = procedure
            .steps
            .iter()
            .filter(|other| other.order < step.order && blocks_later_steps(other))
            .filter(|other| !self.is_complete(other.id))
            .min_by_key(|other| other.order)
        {
            return Err(DomainError::precondition(format!(
                "must complete step \"{}\" before \"{}\"",
                blocking.title, step.title
            )));
        }

        validate_step_value(&step.step_type, &payload)?;

        let completed_at = self
            .record(step_id)
            .and_then(|existing| existing.completed_at)
            .unwrap_or(at);
        let progress = StepProgress {
            session_id,
            step_id,
            completed: true,
            completed_at: Some(completed_at),
            payload: Some(payload),
            validated_price: None,
        };

        let all_required_complete = self.all_required_complete_with(Some(step_id));
        Ok(StepCompletion {
            progress,
            all_required_complete,
        })
    }

    /// True iff every required step of every required procedure is complete.
    ///
    /// Optional procedures are skipped entirely, as are optional steps and
    /// price-validation steps inside required procedures.
    pub fn all_required_complete(&self) -> bool {
        self.all_required_complete_with(None)
    }

    fn all_required_complete_with(&self, just_completed: Option<StepId>) -> bool {
        self.procedures
            .iter()
            .filter(|p| p.required)
            .flat_map(|p| p.steps.iter())
            .filter(|s| blocks_later_steps(s))
            .all(|s| Some(s.id) == just_completed || self.is_complete(s.id))
    }

    /// Progress record for the campaign's price-validation step, if it has one.
    pub fn price_validation_record(
        &self,
        session_id: SessionId,
        price: i64,
        at: DateTime<Utc>,
    ) -> Option<StepProgress> {
        let step = self
            .procedures
            .iter()
            .flat_map(|p| p.steps.iter())
            .find(|s| s.step_type == StepType::PriceValidation)?;

        Some(StepProgress {
            session_id,
            step_id: step.id,
            completed: true,
            completed_at: Some(at),
            payload: Some(Value::from(price)),
            validated_price: Some(price),
        })
    }
}

fn blocks_later_steps(step: &ProcedureStep) -> bool {
    step.required && step.step_type != StepType::PriceValidation
}
