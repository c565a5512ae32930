//! Infrastructure layer: persistence, the lifecycle engine, settlement and
//! the deadline sweep.
//!
//! - [`store`]: `SessionStore` boundary with in-memory and Postgres backends
//! - [`slot_ledger`]: atomic reserve/release of campaign slots
//! - [`engine`]: the session lifecycle engine
//! - [`settlement`]: reward payout with internal-ledger fallback
//! - [`sweeper`]: deadline sweep and its background worker

pub mod config;
pub mod eligibility;
pub mod engine;
pub mod settlement;
pub mod slot_ledger;
pub mod store;
pub mod sweeper;


pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineError, EngineResult, SessionEngine};
