//! Session and role input from the surrounding application.
//!
//! Authentication mechanics live outside this crate; callers hand the
//! engine a `Session` describing who is operating the terminal. The
//! reconciler forwards the scope to the backend, which enforces row-level
//! security for non-privileged roles.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Manager,
    Staff,
}

impl Role {
    /// Privileged roles pull every record in the window; staff only pull
    /// their own.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Manager)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
}

impl Session {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}
