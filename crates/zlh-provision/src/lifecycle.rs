use std::{net::Ipv4Addr, sync::Arc};

use zlh_model::InstanceId;

use crate::config::HypervisorTiming;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::{CloneSpec, ConfigureSpec, Hypervisor, NetworkInterface};
use crate::poller::{Desired, TaskPoller};

/// First non-loopback IPv4 address on any non-`lo` interface.
pub fn first_ipv4(ifaces: &[NetworkInterface]) -> Option<Ipv4Addr> {
    ifaces
        .iter()
        .filter(|i| i.name != "lo")
        .flat_map(|i| i.addresses.iter())
        .filter_map(|a| a.split('/').next()?.trim().parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback())
}

/// Issues hypervisor calls and drives each one to completion.
#[derive(Clone)]
pub struct LifecycleDriver {
    hv: Arc<dyn Hypervisor>,
    poller: TaskPoller,
    timing: HypervisorTiming,
}

impl LifecycleDriver {
    pub fn new(hv: Arc<dyn Hypervisor>, timing: HypervisorTiming) -> Self {
        Self {
            poller: TaskPoller::new(hv.clone(), timing.clone()),
            hv,
            timing,
        }
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hv
    }

    pub async fn clone_container(&self, spec: &CloneSpec) -> Result<()> {
        tracing::info!(
            instance_id = spec.new_id,
            template_id = spec.template_id,
            storage = %spec.storage,
            "cloning container"
        );
        let issued = self.hv.clone_container(spec).await;
        self.poller
            .drive("clone", spec.new_id, issued, Some(Desired::Stopped))
            .await
    }

    pub async fn configure(&self, spec: &ConfigureSpec) -> Result<()> {
        tracing::info!(
            instance_id = spec.id,
            cpu = spec.cpu,
            memory_mib = spec.memory_mib,
            bridge = %spec.bridge,
            "configuring container"
        );
        let issued = self.hv.configure(spec).await;
        self.poller.drive("configure", spec.id, issued, None).await
    }

    /// No-op unless resizing is enabled.
    pub async fn resize(&self, id: InstanceId, disk_gib: i32) -> Result<()> {
        if !self.timing.allow_resize {
            tracing::debug!(instance_id = id, disk_gib, "resize disabled; skipping");
            return Ok(());
        }
        tracing::info!(instance_id = id, disk_gib, "resizing rootfs");
        let issued = self.hv.resize(id, disk_gib).await;
        self.poller.drive("resize", id, issued, None).await
    }

    pub async fn start(&self, id: InstanceId) -> Result<()> {
        let issued = self.hv.start(id).await;
        self.poller
            .drive("start", id, issued, Some(Desired::Running))
            .await
    }

    pub async fn shutdown(&self, id: InstanceId) -> Result<()> {
        let issued = self.hv.shutdown(id).await;
        self.poller
            .drive("shutdown", id, issued, Some(Desired::Stopped))
            .await
    }

    pub async fn stop(&self, id: InstanceId) -> Result<()> {
        let issued = self.hv.stop(id).await;
        self.poller
            .drive("stop", id, issued, Some(Desired::Stopped))
            .await
    }

    /// Stops the container if it is running, then deletes it. A container
    /// that does not exist counts as deleted.
    pub async fn delete(&self, id: InstanceId) -> Result<()> {
        match self.hv.container_status(id).await {
            Err(e) if e.is_not_found() => return Ok(()),
            Ok(status) if status == "running" => {
                if let Err(err) = self.stop(id).await {
                    tracing::warn!(instance_id = id, error = %err, "stop before delete failed");
                }
            }
            _ => {}
        }
        match self.hv.delete(id).await {
            Err(e) if e.is_not_found() => Ok(()),
            issued => {
                self.poller
                    .drive("delete", id, issued, Some(Desired::Absent))
                    .await
            }
        }
    }

    pub async fn is_running(&self, id: InstanceId) -> Result<bool> {
        match self.hv.container_status(id).await {
            Ok(s) => Ok(s == "running"),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Up to `start_retry.max_attempts` starts with linearly growing waits.
    pub async fn start_with_retry(&self, id: InstanceId) -> Result<()> {
        let policy = self.timing.start_retry;
        policy
            .run(
                "container start",
                |attempt| async move {
                    tracing::info!(instance_id = id, attempt, "starting container");
                    self.start(id).await
                },
                |_| true,
            )
            .await
            .map_err(|err| ProvisionError::StartFailed {
                id,
                attempts: policy.max_attempts,
                last: err.to_string(),
            })
    }

    /// Waits for the guest to pick up an IPv4 address.
    pub async fn resolve_address(&self, id: InstanceId) -> Result<Ipv4Addr> {
        self.timing
            .address_retry
            .run(
                "address discovery",
                |_| async move {
                    let ifaces = self.hv.interfaces(id).await.map_err(|e| e.to_string())?;
                    first_ipv4(&ifaces).ok_or_else(|| "no IPv4 address yet".to_string())
                },
                |_| true,
            )
            .await
            .map_err(|_| ProvisionError::AddressUnavailable { id })
    }
}
