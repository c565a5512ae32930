//! Campaign model consumed by the session engine.
//!
//! Campaigns are owned by the surrounding system; the session core reads them
//! and mutates exactly one field, `available_slots`, through the slot ledger.

pub mod campaign;
pub mod distribution;
pub mod offer;
pub mod procedure;

pub use campaign::{Campaign, CampaignStatus};
pub use distribution::{Distribution, DistributionRule};
pub use offer::Offer;
pub use procedure::{Procedure, ProcedureStep, StepType};
