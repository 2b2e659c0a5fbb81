use std::time::Duration;

use serde_json::Value;
use zlh_model::InstanceId;

use super::{
    CloneSpec, ConfigureSpec, HvResult, Hypervisor, HypervisorError, NetworkInterface, TaskHandle,
    TaskStatus,
};
use crate::config::{env_any, env_bool, env_string};

#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// Base URL without the `/api2/json` suffix.
    pub host: String,
    pub node: String,
    /// Full `PVEAPIToken=user@realm!id=secret` header value.
    pub token: String,
    pub verify_tls: bool,
    pub pool: Option<String>,
}

impl ProxmoxConfig {
    pub fn from_env() -> Result<Self, HypervisorError> {
        let host = env_string("PROXMOX_HOST")
            .ok_or_else(|| HypervisorError::Other("PROXMOX_HOST is required".to_string()))?;
        let node = env_string("PROXMOX_NODE")
            .ok_or_else(|| HypervisorError::Other("PROXMOX_NODE is required".to_string()))?;
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            node,
            token: token_header()?,
            verify_tls: env_bool("PROXMOX_VERIFY_TLS").unwrap_or(true),
            pool: env_string("PROXMOX_POOL"),
        })
    }
}

fn token_header() -> Result<String, HypervisorError> {
    if let Some(raw) = env_any(&["PROXMOX_API_TOKEN", "PVE_API_TOKEN", "PVEAPITOKEN"]) {
        if raw.starts_with("PVEAPIToken=") {
            return Ok(raw);
        }
        if raw.contains('!') && raw.contains('=') {
            return Ok(format!("PVEAPIToken={raw}"));
        }
    }
    match (
        env_string("PROXMOX_USER"),
        env_string("PROXMOX_API_TOKEN_ID"),
        env_string("PROXMOX_API_TOKEN_SECRET"),
    ) {
        (Some(user), Some(id), Some(secret)) => Ok(format!("PVEAPIToken={user}!{id}={secret}")),
        _ => Err(HypervisorError::Other(
            "missing Proxmox API token (PROXMOX_API_TOKEN or PROXMOX_USER + PROXMOX_API_TOKEN_ID + PROXMOX_API_TOKEN_SECRET)"
                .to_string(),
        )),
    }
}

/// Node name embedded in a UPID (`UPID:<node>:...`).
fn upid_node<'a>(upid: &'a str, fallback: &'a str) -> &'a str {
    upid.split(':')
        .nth(1)
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback)
}

fn task_from(data: &Value) -> Option<TaskHandle> {
    data.as_str()
        .filter(|s| !s.is_empty())
        .map(|s| TaskHandle(s.to_string()))
}

fn parse_interfaces(data: &Value) -> Vec<NetworkInterface> {
    let Some(list) = data.as_array() else {
        return Vec::new();
    };
    list.iter()
        .map(|intf| {
            let mut addresses = Vec::new();
            if let Some(ips) = intf.get("ip-addresses").and_then(Value::as_array) {
                addresses.extend(
                    ips.iter()
                        .filter_map(|ip| ip.get("ip-address").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
            for key in ["inet", "inet6"] {
                if let Some(a) = intf.get(key).and_then(Value::as_str) {
                    addresses.push(a.to_string());
                }
            }
            NetworkInterface {
                name: intf
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                addresses,
            }
        })
        .collect()
}

pub struct ProxmoxClient {
    http: reqwest::Client,
    cfg: ProxmoxConfig,
}

impl ProxmoxClient {
    pub fn new(cfg: ProxmoxConfig) -> Result<Self, HypervisorError> {
        let http = reqwest::Client::builder()
            .user_agent("zlh-control")
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()
            .map_err(|source| HypervisorError::Transport {
                op: "client",
                source,
            })?;
        Ok(Self { http, cfg })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json{path}", self.cfg.host)
    }

    fn lxc(&self, id: InstanceId, rest: &str) -> String {
        self.url(&format!("/nodes/{}/lxc/{id}{rest}", self.cfg.node))
    }

    async fn send(&self, op: &'static str, req: reqwest::RequestBuilder) -> HvResult<Value> {
        let resp = req
            .header("Authorization", &self.cfg.token)
            .send()
            .await
            .map_err(|source| HypervisorError::Transport { op, source })?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(HypervisorError::Api {
                op,
                status: status.as_u16(),
                body,
            });
        }
        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        Ok(parsed.get("data").cloned().unwrap_or(Value::Null))
    }

    async fn task_call(
        &self,
        op: &'static str,
        req: reqwest::RequestBuilder,
    ) -> HvResult<Option<TaskHandle>> {
        let data = self.send(op, req).await?;
        Ok(task_from(&data))
    }
}

#[async_trait::async_trait]
impl Hypervisor for ProxmoxClient {
    async fn clone_container(&self, spec: &CloneSpec) -> HvResult<Option<TaskHandle>> {
        let mut form = vec![
            ("newid", spec.new_id.to_string()),
            ("hostname", spec.hostname.clone()),
            ("full", "1".to_string()),
            ("storage", spec.storage.clone()),
        ];
        if let Some(pool) = &self.cfg.pool {
            form.push(("pool", pool.clone()));
        }
        let req = self
            .http
            .post(self.lxc(spec.template_id, "/clone"))
            .form(&form);
        self.task_call("lxc/clone", req).await
    }

    async fn configure(&self, spec: &ConfigureSpec) -> HvResult<Option<TaskHandle>> {
        let form = [
            ("cores", spec.cpu.to_string()),
            ("memory", spec.memory_mib.to_string()),
            (
                "net0",
                format!("name=eth0,bridge={},ip=dhcp,type=veth", spec.bridge),
            ),
            ("tags", spec.tags.join(",")),
            ("description", spec.description.clone()),
        ];
        let req = self.http.put(self.lxc(spec.id, "/config")).form(&form);
        self.task_call("lxc/config", req).await
    }

    async fn resize(&self, id: InstanceId, disk_gib: i32) -> HvResult<Option<TaskHandle>> {
        let form = [("disk", "rootfs".to_string()), ("size", format!("{disk_gib}G"))];
        let req = self.http.put(self.lxc(id, "/resize")).form(&form);
        self.task_call("lxc/resize", req).await
    }

    async fn start(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        let req = self.http.post(self.lxc(id, "/status/start"));
        self.task_call("lxc/start", req).await
    }

    async fn shutdown(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        let req = self
            .http
            .post(self.lxc(id, "/status/shutdown"))
            .form(&[("timeout", "60")]);
        self.task_call("lxc/shutdown", req).await
    }

    async fn stop(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        let req = self.http.post(self.lxc(id, "/status/stop"));
        self.task_call("lxc/stop", req).await
    }

    async fn delete(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        let req = self
            .http
            .delete(self.lxc(id, ""))
            .query(&[("purge", "1")]);
        match self.task_call("lxc/delete", req).await {
            Err(e) if e.is_not_found() => Err(HypervisorError::NotFound(id)),
            other => other,
        }
    }

    async fn task_status(&self, task: &TaskHandle) -> HvResult<TaskStatus> {
        let node = upid_node(&task.0, &self.cfg.node);
        let url = self.url(&format!("/nodes/{node}/tasks/{}/status", task.0));
        let data = self.send("tasks/status", self.http.get(url)).await?;
        Ok(TaskStatus {
            status: data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            exit_status: data
                .get("exitstatus")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn container_status(&self, id: InstanceId) -> HvResult<String> {
        let req = self.http.get(self.lxc(id, "/status/current"));
        match self.send("lxc/status/current", req).await {
            Ok(data) => Ok(data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_ascii_lowercase()),
            Err(e) if e.is_not_found() => Err(HypervisorError::NotFound(id)),
            Err(e) => Err(e),
        }
    }

    async fn interfaces(&self, id: InstanceId) -> HvResult<Vec<NetworkInterface>> {
        let data = self
            .send("lxc/interfaces", self.http.get(self.lxc(id, "/interfaces")))
            .await?;
        Ok(parse_interfaces(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upid_node_falls_back() {
        assert_eq!(
            upid_node("UPID:zlh-prod2:0000ABCD:01:65:vzstart:5001:root@pam:", "zlh-prod1"),
            "zlh-prod2"
        );
        assert_eq!(upid_node("garbage", "zlh-prod1"), "zlh-prod1");
    }

    #[test]
    fn parses_both_interface_shapes() {
        let data = serde_json::json!([
            { "name": "lo", "inet": "127.0.0.1/8" },
            { "name": "eth0", "inet": "10.200.0.14/24", "inet6": "fe80::1/64" },
            { "name": "eth1", "ip-addresses": [{ "ip-address": "10.60.0.9", "prefix": 24 }] }
        ]);
        let ifaces = parse_interfaces(&data);
        assert_eq!(ifaces.len(), 3);
        assert_eq!(ifaces[1].addresses, vec!["10.200.0.14/24", "fe80::1/64"]);
        assert_eq!(ifaces[2].addresses, vec!["10.60.0.9"]);
    }

    #[test]
    fn empty_data_is_no_task() {
        assert_eq!(task_from(&Value::Null), None);
        assert_eq!(
            task_from(&serde_json::json!("UPID:n:1")),
            Some(TaskHandle("UPID:n:1".into()))
        );
    }
}
