use std::time::Duration;

use serde_json::Value;
use zlh_model::Transport;

use super::{AddressRecord, DnsProvider, EdgeError, EdgeResult, ServiceRecord};
use crate::config::env_string;

#[derive(Debug, Clone)]
pub struct TechnitiumConfig {
    /// Base URL including `/api`.
    pub api_url: String,
    pub token: String,
    pub zone: String,
}

impl TechnitiumConfig {
    pub fn from_env(zone: &str) -> Result<Self, EdgeError> {
        Ok(Self {
            api_url: env_string("TECHNITIUM_API_URL")
                .unwrap_or_else(|| "http://10.60.0.253:5380/api".to_string())
                .trim_end_matches('/')
                .to_string(),
            token: env_string("TECHNITIUM_API_TOKEN")
                .ok_or_else(|| EdgeError::Config("TECHNITIUM_API_TOKEN is required".to_string()))?,
            zone: zone.to_string(),
        })
    }
}

fn is_missing(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("no such record") || m.contains("no such domain") || m.contains("not found")
}

/// Internal authoritative DNS.
pub struct TechnitiumDns {
    http: reqwest::Client,
    cfg: TechnitiumConfig,
}

impl TechnitiumDns {
    pub fn new(cfg: TechnitiumConfig) -> Result<Self, EdgeError> {
        let http = reqwest::Client::builder()
            .user_agent("zlh-control")
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|source| EdgeError::Transport {
                op: "technitium client",
                source,
            })?;
        Ok(Self { http, cfg })
    }

    /// Technitium answers 200 with `{status: "ok" | "error", errorMessage}`.
    async fn call(&self, op: &'static str, path: &str, params: &[(&str, String)]) -> EdgeResult<Value> {
        let mut form: Vec<(&str, String)> = vec![
            ("token", self.cfg.token.clone()),
            ("zone", self.cfg.zone.clone()),
        ];
        form.extend(params.iter().cloned());
        let resp = self
            .http
            .post(format!("{}{path}", self.cfg.api_url))
            .form(&form)
            .send()
            .await
            .map_err(|source| EdgeError::Transport { op, source })?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(EdgeError::Api {
                op,
                status: status.as_u16(),
                body,
            });
        }
        let json: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        if json.get("status").and_then(Value::as_str) == Some("ok") {
            return Ok(json);
        }
        Err(EdgeError::Rejected {
            op,
            message: json
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("technitium error")
                .to_string(),
        })
    }

    async fn records(&self, domain: &str, kind: &str) -> EdgeResult<Vec<Value>> {
        let res = self
            .call("records/get", "/zones/records/get", &[("domain", domain.to_string())])
            .await;
        let json = match res {
            Ok(j) => j,
            Err(EdgeError::Rejected { message, .. }) if is_missing(&message) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(json
            .pointer("/response/records")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter(|r| r.get("type").and_then(Value::as_str) == Some(kind))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, params: &[(&str, String)]) -> EdgeResult<()> {
        match self.call("records/delete", "/zones/records/delete", params).await {
            Err(EdgeError::Rejected { message, .. }) if is_missing(&message) => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

fn rdata(rec: &Value) -> &Value {
    rec.get("rData")
        .or_else(|| rec.get("rdata"))
        .unwrap_or(&Value::Null)
}

fn field(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_string(),
    }
}

#[async_trait::async_trait]
impl DnsProvider for TechnitiumDns {
    async fn add_address(&self, rec: &AddressRecord) -> EdgeResult<()> {
        self.call(
            "records/add A",
            "/zones/records/add",
            &[
                ("domain", rec.fqdn.clone()),
                ("type", "A".to_string()),
                ("ttl", rec.ttl.to_string()),
                ("ipAddress", rec.ip.clone()),
                ("overwrite", "true".to_string()),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn delete_address(&self, fqdn: &str) -> EdgeResult<()> {
        for rec in self.records(fqdn, "A").await? {
            let ip = rdata(&rec)
                .get("ipAddress")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.delete(&[
                ("domain", fqdn.to_string()),
                ("type", "A".to_string()),
                ("ipAddress", ip),
            ])
            .await?;
        }
        Ok(())
    }

    async fn add_service(&self, rec: &ServiceRecord) -> EdgeResult<()> {
        let owner = ServiceRecord::owner_name(&rec.service, rec.transport, &rec.fqdn);
        self.call(
            "records/add SRV",
            "/zones/records/add",
            &[
                ("domain", owner),
                ("type", "SRV".to_string()),
                ("ttl", rec.ttl.to_string()),
                ("priority", "0".to_string()),
                ("weight", "0".to_string()),
                ("port", rec.port.to_string()),
                ("target", rec.target.clone()),
                ("overwrite", "true".to_string()),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn delete_service(&self, service: &str, transport: Transport, fqdn: &str) -> EdgeResult<()> {
        let owner = ServiceRecord::owner_name(service, transport, fqdn);
        for rec in self.records(&owner, "SRV").await? {
            let data = rdata(&rec);
            let target = data
                .get("target")
                .and_then(Value::as_str)
                .unwrap_or(fqdn)
                .to_string();
            self.delete(&[
                ("domain", owner.clone()),
                ("type", "SRV".to_string()),
                ("priority", field(data, "priority")),
                ("weight", field(data, "weight")),
                ("port", field(data, "port")),
                ("target", target),
            ])
            .await?;
        }
        Ok(())
    }
}
