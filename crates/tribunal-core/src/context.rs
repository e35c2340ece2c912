use crate::errors::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Capability strings, enumerated centrally so authorization checks and
/// role grants cannot drift apart.
pub mod capability {
    pub const SUITE_READ: &str = "suite:read";
    pub const SUITE_WRITE: &str = "suite:write";
    pub const EXECUTION_READ: &str = "execution:read";
    pub const EXECUTION_START: &str = "execution:start";
    pub const EXECUTION_CANCEL: &str = "execution:cancel";

    pub const ALL: &[&str] = &[
        SUITE_READ,
        SUITE_WRITE,
        EXECUTION_READ,
        EXECUTION_START,
        EXECUTION_CANCEL,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

impl Role {
    pub fn allows(&self, cap: &str) -> bool {
        use capability::*;
        match self {
            Role::Admin => capability::ALL.contains(&cap),
            Role::Editor => matches!(
                cap,
                SUITE_READ | SUITE_WRITE | EXECUTION_READ | EXECUTION_START | EXECUTION_CANCEL
            ),
            Role::Viewer => matches!(cap, SUITE_READ | EXECUTION_READ),
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "editor" => Some(Role::Editor),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

/// Caller identity threaded through every store and orchestrator call.
/// Constructed at the HTTP edge from authorizer claims (never from request
/// bodies), or via `for_worker` on the queue-consumer path.
#[derive(Debug, Clone)]
pub struct Context {
    pub tenant_id: String,
    pub role: Role,
    pub user_id: String,
    pub idempotency_key: Option<String>,
}

impl Context {
    pub fn new(tenant_id: impl Into<String>, role: Role, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            role,
            user_id: user_id.into(),
            idempotency_key: None,
        }
    }

    /// Context for background workers acting on a dequeued job. The tenant
    /// comes from the job body; the worker itself is trusted.
    pub fn for_worker(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, Role::Admin, "worker")
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn require(&self, cap: &str) -> Result<()> {
        if self.role.allows(cap) {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "role lacks capability {}",
                cap
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_cannot_start_executions() {
        let ctx = Context::new("t1", Role::Viewer, "u1");
        assert!(ctx.require(capability::EXECUTION_READ).is_ok());
        let err = ctx.require(capability::EXECUTION_START).unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[test]
    fn admin_has_every_capability() {
        let ctx = Context::new("t1", Role::Admin, "u1");
        for cap in capability::ALL {
            assert!(ctx.require(cap).is_ok(), "admin denied {}", cap);
        }
    }
}
