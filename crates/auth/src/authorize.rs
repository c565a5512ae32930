use thiserror::Error;

use tryout_core::{DomainError, UserId};

use crate::{Actor, Role};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("only the session's tester may {0}")]
    NotTester(&'static str),

    #[error("only the campaign owner may {0}")]
    NotOwner(&'static str),

    #[error("only the campaign owner or an admin may {0}")]
    NotOwnerOrAdmin(&'static str),

    #[error("only an admin may {0}")]
    NotAdmin(&'static str),

    #[error("only the tester, the campaign owner or an admin may {0}")]
    NotParty(&'static str),
}

impl From<AuthzError> for DomainError {
    fn from(value: AuthzError) -> Self {
        DomainError::forbidden(value.to_string())
    }
}

// All checks are pure: no IO, no panics. `action` is a short verb phrase used
// in the error message ("cancel", "validate the purchase").

/// The actor must be the tester that owns the session.
pub fn ensure_tester(actor: &Actor, tester_id: UserId, action: &'static str) -> Result<(), AuthzError> {
    if actor.role == Role::Tester && actor.user_id == tester_id {
        Ok(())
    } else {
        Err(AuthzError::NotTester(action))
    }
}

/// The actor must be the seller that owns the campaign.
pub fn ensure_owner(actor: &Actor, owner_id: UserId, action: &'static str) -> Result<(), AuthzError> {
    if actor.role == Role::Seller && actor.user_id == owner_id {
        Ok(())
    } else {
        Err(AuthzError::NotOwner(action))
    }
}

/// The actor must be the campaign owner or any admin.
pub fn ensure_owner_or_admin(
    actor: &Actor,
    owner_id: UserId,
    action: &'static str,
) -> Result<(), AuthzError> {
    if actor.is_admin() || ensure_owner(actor, owner_id, action).is_ok() {
        Ok(())
    } else {
        Err(AuthzError::NotOwnerOrAdmin(action))
    }
}

/// The actor must be an admin.
pub fn ensure_admin(actor: &Actor, action: &'static str) -> Result<(), AuthzError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(AuthzError::NotAdmin(action))
    }
}

/// The actor must be one of the session's parties: its tester, the campaign owner, or an admin.
pub fn ensure_party(
    actor: &Actor,
    tester_id: UserId,
    owner_id: UserId,
    action: &'static str,
) -> Result<(), AuthzError> {
    if ensure_tester(actor, tester_id, action).is_ok()
        || ensure_owner_or_admin(actor, owner_id, action).is_ok()
    {
        Ok(())
    } else {
        Err(AuthzError::NotParty(action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tester_check_requires_matching_id_and_role() {
        let tester = UserId::new();
        assert!(ensure_tester(&Actor::tester(tester), tester, "cancel").is_ok());
        assert_eq!(
            ensure_tester(&Actor::tester(UserId::new()), tester, "cancel"),
            Err(AuthzError::NotTester("cancel"))
        );
        // Same id but acting as a seller is not the tester.
        assert!(ensure_tester(&Actor::seller(tester), tester, "cancel").is_err());
    }

    #[test]
    fn admins_pass_owner_or_admin_but_not_owner_only() {
        let owner = UserId::new();
        let admin = Actor::admin(UserId::new());
        assert!(ensure_owner_or_admin(&admin, owner, "accept").is_ok());
        assert!(ensure_owner(&admin, owner, "close").is_err());
    }

    #[test]
    fn strangers_are_not_parties() {
        let tester = UserId::new();
        let owner = UserId::new();
        let stranger = Actor::seller(UserId::new());
        let err = ensure_party(&stranger, tester, owner, "dispute").unwrap_err();
        let domain: DomainError = err.into();
        assert!(matches!(domain, DomainError::Forbidden(msg) if msg.contains("dispute")));
    }
}
