//! Testing-session domain (pure, deterministic).
//!
//! - [`session`]: the session aggregate and its state machine
//! - [`step_validator`]: per-type validation of submitted step values
//! - [`step_progress`]: ordered step completion and the "all required done" check
//! - [`scheduler`]: purchase-date selection from distribution rules
//!
//! No IO happens here; the infrastructure layer persists state and talks to
//! external collaborators.

pub mod scheduler;
pub mod session;
pub mod status;
pub mod step_progress;
pub mod step_validator;

pub use scheduler::{ScheduledLoad, candidate_dates, next_purchase_date};
pub use session::{
    CampaignFacts, DisputeResolution, Rejection, Session, SessionAction, SessionCommand,
    SessionEvent, SessionTimestamps, SlotEffect, TesterRating, UgcKind, UgcRequest, UgcSubmission,
};
pub use status::SessionStatus;
pub use step_progress::{StepCompletion, StepProgress, StepTracker};
pub use step_validator::validate_step_value;
