use zlh_model::{InstanceClass, InstanceId};

use crate::agent::AgentCallError;
use crate::edge::EdgeError;
use crate::hypervisor::HypervisorError;

/// Every failure a provisioning or teardown caller can observe.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no free identifiers in {min}..={max} for class {class}")]
    RangeExhausted {
        class: InstanceClass,
        min: i32,
        max: i32,
    },

    #[error("not enough free {class} ports (requested {requested}, available {available})")]
    InsufficientPorts {
        class: String,
        requested: usize,
        available: usize,
    },

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("hypervisor task {task} failed: {exit_status}")]
    HypervisorTaskFailed { task: String, exit_status: String },

    #[error("timed out waiting for {what}")]
    HypervisorTimeout { what: String },

    #[error("hypervisor: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("container {id} failed to start after {attempts} attempts: {last}")]
    StartFailed {
        id: InstanceId,
        attempts: u32,
        last: String,
    },

    #[error("container {id} never reported an IPv4 address")]
    AddressUnavailable { id: InstanceId },

    #[error("agent rejected configuration ({status}): {body}")]
    AgentConfigRejected { status: u16, body: String },

    #[error("agent reported state={state}{}", message.as_deref().map(|m| format!(" ({m})")).unwrap_or_default())]
    AgentError {
        state: String,
        message: Option<String>,
    },

    #[error("agent did not reach running state: {last}")]
    AgentTimeout { last: String },

    #[error("agent: {0}")]
    Agent(#[from] AgentCallError),

    #[error("edge publication failed: {0}")]
    PublishFailed(String),

    #[error("container {id} is running; stop it before deletion")]
    StillRunning { id: InstanceId },

    #[error("instance {0} not found")]
    NotFound(InstanceId),

    #[error("store: {0}")]
    Store(#[from] sea_orm::DbErr),
}

impl From<EdgeError> for ProvisionError {
    fn from(value: EdgeError) -> Self {
        ProvisionError::PublishFailed(value.to_string())
    }
}

impl ProvisionError {
    /// Stable snake_case code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "invalid_param",
            ProvisionError::RangeExhausted { .. } => "range_exhausted",
            ProvisionError::InsufficientPorts { .. } => "insufficient_ports",
            ProvisionError::TemplateNotFound(_) => "template_not_found",
            ProvisionError::HypervisorTaskFailed { .. } => "hypervisor_task_failed",
            ProvisionError::HypervisorTimeout { .. } => "hypervisor_timeout",
            ProvisionError::Hypervisor(_) => "hypervisor_error",
            ProvisionError::StartFailed { .. } => "start_failed",
            ProvisionError::AddressUnavailable { .. } => "address_unavailable",
            ProvisionError::AgentConfigRejected { .. } => "agent_config_rejected",
            ProvisionError::AgentError { .. } => "agent_error",
            ProvisionError::AgentTimeout { .. } => "agent_timeout",
            ProvisionError::Agent(_) => "agent_unreachable",
            ProvisionError::PublishFailed(_) => "publish_failed",
            ProvisionError::StillRunning { .. } => "still_running",
            ProvisionError::NotFound(_) => "not_found",
            ProvisionError::Store(_) => "store_error",
        }
    }

    /// Failures raised before any external side effect was produced. A
    /// short port pool leaves no partial reservation; only the identifier
    /// needs releasing.
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            ProvisionError::Validation(_)
                | ProvisionError::RangeExhausted { .. }
                | ProvisionError::InsufficientPorts { .. }
                | ProvisionError::TemplateNotFound(_)
        )
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_message_includes_guest_text() {
        let err = ProvisionError::AgentError {
            state: "crashed".to_string(),
            message: Some("java exited 1".to_string()),
        };
        assert_eq!(err.to_string(), "agent reported state=crashed (java exited 1)");

        let bare = ProvisionError::AgentError {
            state: "error".to_string(),
            message: None,
        };
        assert_eq!(bare.to_string(), "agent reported state=error");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ProvisionError::Validation("x".into()).code(), "invalid_param");
        assert_eq!(
            ProvisionError::StartFailed {
                id: 5001,
                attempts: 3,
                last: "x".into()
            }
            .code(),
            "start_failed"
        );
    }

    #[test]
    fn exhausted_pools_fail_fast() {
        let ports = ProvisionError::InsufficientPorts {
            class: "game".to_string(),
            requested: 4,
            available: 1,
        };
        assert!(ports.is_fail_fast());
        assert!(!ProvisionError::AgentTimeout { last: "installing".to_string() }.is_fail_fast());
    }
}
