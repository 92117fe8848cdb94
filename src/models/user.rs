//! Principals and roles.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

/// Role set; ordered roughly by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access, including user management and catalog flush.
    Admin,
    /// Read access to all jobs and users.
    Support,
    /// Read access restricted to the manager's projects.
    Manager,
    /// May call the ingest endpoints (start/stop/import).
    Api,
    /// Read access to the principal's own jobs.
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Support => "support",
            Self::Manager => "manager",
            Self::Api => "api",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "support" => Some(Self::Support),
            "manager" => Some(Self::Manager),
            "api" => Some(Self::Api),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The authenticated principal as seen by the core; how it was authenticated
/// (token, JWT) is the auth layer's business.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub username: String,
    pub roles: HashSet<Role>,
    pub projects: Vec<String>,
}

impl AuthenticatedUser {
    pub fn new(username: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            username: username.into(),
            roles: roles.into_iter().collect(),
            projects: Vec::new(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Admin)
    }

    /// Admin and support see everything.
    pub fn sees_all_jobs(&self) -> bool {
        self.has_role(Role::Admin) || self.has_role(Role::Support)
    }

    pub fn require_role(&self, role: Role) -> AppResult<()> {
        if self.has_role(role) || self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "role '{}' required",
                role.as_str()
            )))
        }
    }

    /// Tag scopes this principal may see or attach.
    pub fn may_use_tag_scope(&self, scope: &str) -> bool {
        match scope {
            "global" => true,
            "admin" => self.is_admin(),
            other => other == self.username || self.is_admin(),
        }
    }
}

/// Catalog user row as exposed to the CLI and admin endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserRecord {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub roles: Vec<Role>,
    #[serde(default)]
    pub projects: Vec<String>,
}
