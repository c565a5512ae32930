//! Session persistence boundary.
//!
//! The engine reads sessions, campaigns and step progress through
//! [`SessionStore`] and writes every transition through a single atomic
//! [`SessionStore::commit`].

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemorySessionStore;
pub use postgres::PostgresSessionStore;
pub use r#trait::{SessionChange, SessionStore, StoreError, UnsettledReward};
