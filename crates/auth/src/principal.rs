use serde::{Deserialize, Serialize};

use tryout_core::UserId;

use crate::Role;

/// An authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn tester(user_id: UserId) -> Self {
        Self::new(user_id, Role::Tester)
    }

    pub fn seller(user_id: UserId) -> Self {
        Self::new(user_id, Role::Seller)
    }

    pub fn admin(user_id: UserId) -> Self {
        Self::new(user_id, Role::Admin)
    }

    /// The actor used by background processes.
    pub fn system() -> Self {
        Self::new(UserId::from_uuid(uuid::Uuid::nil()), Role::System)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
