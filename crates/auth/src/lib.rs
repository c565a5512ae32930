//! `tryout-auth` — pure authorization boundary for session operations.
//!
//! Identity/authentication is external: callers hand us an already
//! authenticated [`Actor`]. This crate only decides whether that actor may act
//! on a given session.

pub mod authorize;
pub mod principal;
pub mod roles;

pub use authorize::{AuthzError, ensure_admin, ensure_owner, ensure_owner_or_admin, ensure_party, ensure_tester};
pub use principal::Actor;
pub use roles::Role;
