use serde::{Deserialize, Serialize};

use tryout_core::{ProcedureId, StepId};

/// Declared type of a procedure step; decides how a submitted value is validated.
///
/// Unknown type names are preserved as [`StepType::Other`] so that newer step
/// kinds pass through older engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    Text,
    Photo,
    Video,
    Checklist,
    Rating,
    PriceValidation,
    Other(String),
}

impl StepType {
    pub fn as_str(&self) -> &str {
        match self {
            StepType::Text => "text",
            StepType::Photo => "photo",
            StepType::Video => "video",
            StepType::Checklist => "checklist",
            StepType::Rating => "rating",
            StepType::PriceValidation => "price_validation",
            StepType::Other(name) => name,
        }
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "text" => StepType::Text,
            "photo" => StepType::Photo,
            "video" => StepType::Video,
            "checklist" => StepType::Checklist,
            "rating" => StepType::Rating,
            "price_validation" => StepType::PriceValidation,
            _ => StepType::Other(value),
        }
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        value.as_str().to_string()
    }
}

impl core::fmt::Display for StepType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single task inside a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureStep {
    pub id: StepId,
    pub title: String,
    /// Position within the procedure; lower runs first.
    pub order: u32,
    pub step_type: StepType,
    pub required: bool,
}

impl ProcedureStep {
    pub fn new(title: impl Into<String>, order: u32, step_type: StepType, required: bool) -> Self {
        Self {
            id: StepId::new(),
            title: title.into(),
            order,
            step_type,
            required,
        }
    }
}

/// An ordered group of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    pub id: ProcedureId,
    pub title: String,
    pub order: u32,
    pub required: bool,
    pub steps: Vec<ProcedureStep>,
}

impl Procedure {
    pub fn new(title: impl Into<String>, order: u32, required: bool, steps: Vec<ProcedureStep>) -> Self {
        Self {
            id: ProcedureId::new(),
            title: title.into(),
            order,
            required,
            steps,
        }
    }

    pub fn step(&self, step_id: StepId) -> Option<&ProcedureStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}
