//! Identity and authorization facade.
//!
//! Every submission carries a principal. The executor consults the hook
//! before decomposition and again before any escalation or
//! approval-requiring transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::HaosError;

/// The identity on whose behalf a workflow runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_roles(subject: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            roles,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Authorization hook consumed by the orchestrator.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Called before decomposition of a new request.
    async fn authorize_submit(&self, principal: &Principal) -> Result<(), HaosError>;

    /// Called before an escalation or approval-requiring transition.
    async fn authorize_escalation(&self, principal: &Principal) -> Result<(), HaosError>;
}

/// Permits everything. The default for embedded and test use.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize_submit(&self, _principal: &Principal) -> Result<(), HaosError> {
        Ok(())
    }

    async fn authorize_escalation(&self, _principal: &Principal) -> Result<(), HaosError> {
        Ok(())
    }
}

/// Role-based authorizer: submission requires `submitter`, escalation
/// approval requires `approver`.
#[derive(Debug)]
pub struct RoleAuthorizer {
    pub submit_role: String,
    pub escalation_role: String,
}

impl Default for RoleAuthorizer {
    fn default() -> Self {
        Self {
            submit_role: "submitter".to_string(),
            escalation_role: "approver".to_string(),
        }
    }
}

#[async_trait]
impl Authorizer for RoleAuthorizer {
    async fn authorize_submit(&self, principal: &Principal) -> Result<(), HaosError> {
        if principal.has_role(&self.submit_role) {
            Ok(())
        } else {
            Err(HaosError::UnauthorizedPrincipal {
                principal: principal.subject.clone(),
                reason: format!("missing role `{}`", self.submit_role),
            })
        }
    }

    async fn authorize_escalation(&self, principal: &Principal) -> Result<(), HaosError> {
        if principal.has_role(&self.escalation_role) {
            Ok(())
        } else {
            Err(HaosError::UnauthorizedPrincipal {
                principal: principal.subject.clone(),
                reason: format!("missing role `{}`", self.escalation_role),
            })
        }
    }
}
