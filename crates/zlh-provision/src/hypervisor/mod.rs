//! Hypervisor seam. The driver only ever talks to [`Hypervisor`]; the
//! Proxmox implementation lives in [`proxmox`].

pub mod proxmox;

use zlh_model::InstanceId;

/// Opaque reference to an asynchronous hypervisor operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle(pub String);

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub status: String,
    pub exit_status: Option<String>,
}

impl TaskStatus {
    pub fn is_stopped(&self) -> bool {
        self.status.eq_ignore_ascii_case("stopped")
    }

    pub fn is_ok(&self) -> bool {
        self.exit_status
            .as_deref()
            .is_some_and(|s| s.trim().to_ascii_uppercase().starts_with("OK"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    /// Addresses as reported, possibly with a `/prefix` suffix.
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CloneSpec {
    pub template_id: i32,
    pub new_id: InstanceId,
    pub hostname: String,
    pub storage: String,
}

#[derive(Debug, Clone)]
pub struct ConfigureSpec {
    pub id: InstanceId,
    pub cpu: i32,
    pub memory_mib: i32,
    pub bridge: String,
    pub tags: Vec<String>,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("{op}: HTTP {status}: {body}")]
    Api {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("{op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("container {0} does not exist")]
    NotFound(InstanceId),

    #[error("{0}")]
    Other(String),
}

impl HypervisorError {
    /// The hypervisor accepted the call but handed back a task reference it
    /// cannot resolve itself.
    pub fn is_unusable_handle(&self) -> bool {
        let msg = self.to_string().to_ascii_lowercase();
        msg.contains("unable to parse worker upid") || (msg.contains("upid") && msg.contains("parse"))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            HypervisorError::NotFound(_) => true,
            HypervisorError::Api { status, body, .. } => {
                *status == 404 || (body.contains("does not exist") && body.contains(".conf"))
            }
            _ => false,
        }
    }
}

pub type HvResult<T> = std::result::Result<T, HypervisorError>;

/// Every call that can start asynchronous work returns the task handle when
/// the hypervisor provides one.
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    async fn clone_container(&self, spec: &CloneSpec) -> HvResult<Option<TaskHandle>>;
    async fn configure(&self, spec: &ConfigureSpec) -> HvResult<Option<TaskHandle>>;
    async fn resize(&self, id: InstanceId, disk_gib: i32) -> HvResult<Option<TaskHandle>>;
    async fn start(&self, id: InstanceId) -> HvResult<Option<TaskHandle>>;
    async fn shutdown(&self, id: InstanceId) -> HvResult<Option<TaskHandle>>;
    async fn stop(&self, id: InstanceId) -> HvResult<Option<TaskHandle>>;
    async fn delete(&self, id: InstanceId) -> HvResult<Option<TaskHandle>>;
    async fn task_status(&self, task: &TaskHandle) -> HvResult<TaskStatus>;
    /// Coarse lowercase status (`running`, `stopped`, ...).
    async fn container_status(&self, id: InstanceId) -> HvResult<String>;
    async fn interfaces(&self, id: InstanceId) -> HvResult<Vec<NetworkInterface>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_success_requires_ok_exit_status() {
        let ok = TaskStatus {
            status: "stopped".into(),
            exit_status: Some("OK".into()),
        };
        assert!(ok.is_stopped() && ok.is_ok());

        let warn = TaskStatus {
            status: "stopped".into(),
            exit_status: Some("command 'lxc-start' failed: exit code 1".into()),
        };
        assert!(!warn.is_ok());

        let running = TaskStatus {
            status: "running".into(),
            exit_status: None,
        };
        assert!(!running.is_stopped());
    }

    #[test]
    fn classifies_unusable_handles_by_message() {
        let err = HypervisorError::Api {
            op: "tasks/status",
            status: 400,
            body: r#"{"errors":{"upid":"unable to parse worker upid 'x'"}}"#.into(),
        };
        assert!(err.is_unusable_handle());
        assert!(!HypervisorError::Other("timeout".into()).is_unusable_handle());
    }

    #[test]
    fn missing_config_is_not_found() {
        let err = HypervisorError::Api {
            op: "lxc/delete",
            status: 500,
            body: "Configuration file 'nodes/pve/lxc/5001.conf' does not exist".into(),
        };
        assert!(err.is_not_found());
        assert!(HypervisorError::NotFound(5001).is_not_found());
    }
}
