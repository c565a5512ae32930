use serde::{Deserialize, Serialize};

/// Role an actor holds when invoking an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Applies to campaigns and runs the test.
    Tester,
    /// Owns campaigns (the campaign owner is a seller whose id matches `owner_id`).
    Seller,
    /// Platform operator.
    Admin,
    /// Internal processes such as the deadline sweep.
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tester => "tester",
            Role::Seller => "seller",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
