//! Per-type validation of submitted step values.

use serde_json::Value;
use url::Url;

use tryout_campaigns::StepType;
use tryout_core::{DomainError, DomainResult};

/// Accept or reject `value` for a step declared as `step_type`.
///
/// Unknown step types accept anything so that newer step kinds are not blocked.
pub fn validate_step_value(step_type: &StepType, value: &Value) -> DomainResult<()> {
    let ok = match step_type {
        StepType::Text => value.as_str().is_some_and(|s| !s.trim().is_empty()),
        StepType::Photo | StepType::Video => value.as_str().is_some_and(is_well_formed_url),
        StepType::Checklist => value.as_array().is_some_and(|items| !items.is_empty()),
        StepType::Rating => value.as_i64().is_some_and(|n| (1..=5).contains(&n)),
        StepType::PriceValidation => value.as_i64().is_some_and(|n| n > 0),
        StepType::Other(_) => true,
    };

    if ok {
        Ok(())
    } else {
        Err(DomainError::validation(format!(
            "invalid value for {step_type} step: expected {}, got {value}",
            expectation(step_type)
        )))
    }
}

pub(crate) fn is_well_formed_url(raw: &str) -> bool {
    Url::parse(raw.trim()).is_ok_and(|u| u.has_host())
}

fn expectation(step_type: &StepType) -> &'static str {
    match step_type {
        StepType::Text => "a non-empty text",
        StepType::Photo | StepType::Video => "a well-formed URL",
        StepType::Checklist => "a non-empty list",
        StepType::Rating => "an integer between 1 and 5",
        StepType::PriceValidation => "a positive price in cents",
        StepType::Other(_) => "any value",
    }
}
