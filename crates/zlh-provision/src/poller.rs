use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use zlh_model::InstanceId;

use crate::config::HypervisorTiming;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::{HvResult, Hypervisor, TaskHandle};

/// Coarse container state a status poll waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desired {
    Running,
    Stopped,
    /// The container no longer exists.
    Absent,
}

impl Desired {
    fn as_str(self) -> &'static str {
        match self {
            Desired::Running => "running",
            Desired::Stopped => "stopped",
            Desired::Absent => "absent",
        }
    }
}

/// Turns asynchronous hypervisor operations into awaitable steps.
#[derive(Clone)]
pub struct TaskPoller {
    hv: Arc<dyn Hypervisor>,
    timing: HypervisorTiming,
}

impl TaskPoller {
    pub fn new(hv: Arc<dyn Hypervisor>, timing: HypervisorTiming) -> Self {
        Self { hv, timing }
    }

    /// Polls `task` with exponential backoff until it stops. Only an `OK`
    /// exit status counts as success.
    pub async fn await_task(&self, task: &TaskHandle, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.hv.task_status(task).await {
                Ok(st) if st.is_stopped() => {
                    if st.is_ok() {
                        return Ok(());
                    }
                    return Err(ProvisionError::HypervisorTaskFailed {
                        task: task.to_string(),
                        exit_status: st.exit_status.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                Ok(_) => {}
                Err(e) if e.is_unusable_handle() => return Err(e.into()),
                Err(e) => tracing::debug!(%task, error = %e, "task status poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProvisionError::HypervisorTimeout {
                    what: format!("task {task}"),
                });
            }
            let delay = self.timing.task_backoff.delay(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Polls the container's own status on a fixed interval.
    pub async fn await_status(&self, id: InstanceId, desired: Desired, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.hv.container_status(id).await {
                Ok(status) if status == desired.as_str() => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_not_found() && desired == Desired::Absent => return Ok(()),
                Err(e) => tracing::debug!(instance_id = id, error = %e, "status poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProvisionError::HypervisorTimeout {
                    what: format!("container {id} to reach {}", desired.as_str()),
                });
            }
            tokio::time::sleep(self.timing.status_interval.min(deadline - now)).await;
        }
    }

    /// Drives one issued hypervisor call to completion: through its task when
    /// one came back, else by status polling when a target state is known.
    pub async fn drive(
        &self,
        op: &str,
        id: InstanceId,
        issued: HvResult<Option<TaskHandle>>,
        desired: Option<Desired>,
    ) -> Result<()> {
        let task = match issued {
            Ok(task) => task,
            Err(e) if e.is_unusable_handle() && desired.is_some() => None,
            Err(e) => return Err(e.into()),
        };

        let Some(task) = task else {
            return match desired {
                Some(d) => {
                    tracing::debug!(op, instance_id = id, "no task handle; polling status");
                    self.await_status(id, d, self.timing.status_timeout).await
                }
                None => Ok(()),
            };
        };

        match self.await_task(&task, self.timing.task_timeout).await {
            Err(ProvisionError::Hypervisor(e)) if e.is_unusable_handle() => match desired {
                Some(d) => {
                    tracing::warn!(op, instance_id = id, %task, "unusable task handle; polling status");
                    self.await_status(id, d, self.timing.status_timeout).await
                }
                None => Err(e.into()),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::HypervisorError;
    use crate::testing::{self, FakeHypervisor};

    fn poller(hv: Arc<FakeHypervisor>) -> TaskPoller {
        TaskPoller::new(hv, testing::fast_settings().hypervisor)
    }

    #[tokio::test]
    async fn task_ok_after_running() {
        let hv = Arc::new(FakeHypervisor::default());
        hv.script_task("UPID:a", &[("running", None), ("stopped", Some("OK"))]);
        poller(hv.clone())
            .await_task(&TaskHandle("UPID:a".into()), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn task_failure_carries_exit_status() {
        let hv = Arc::new(FakeHypervisor::default());
        hv.script_task("UPID:b", &[("stopped", Some("command failed: exit code 1"))]);
        let err = poller(hv)
            .await_task(&TaskHandle("UPID:b".into()), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ProvisionError::HypervisorTaskFailed { exit_status, .. } => {
                assert_eq!(exit_status, "command failed: exit code 1")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_never_stopping_times_out() {
        let hv = Arc::new(FakeHypervisor::default());
        hv.script_task("UPID:c", &[("running", None)]);
        let err = poller(hv)
            .await_task(&TaskHandle("UPID:c".into()), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::HypervisorTimeout { .. }));
    }

    #[tokio::test]
    async fn unusable_handle_falls_back_to_status() {
        let hv = Arc::new(FakeHypervisor::default());
        hv.set_status(5001, "running");
        let issued = Err(HypervisorError::Other("unable to parse worker upid ''".into()));
        poller(hv)
            .drive("start", 5001, issued, Some(Desired::Running))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_handle_without_target_is_done() {
        let hv = Arc::new(FakeHypervisor::default());
        poller(hv).drive("configure", 5001, Ok(None), None).await.unwrap();
    }

    #[tokio::test]
    async fn absent_is_reached_when_container_is_gone() {
        let hv = Arc::new(FakeHypervisor::default());
        poller(hv)
            .await_status(5999, Desired::Absent, Duration::from_millis(50))
            .await
            .unwrap();
    }
}
