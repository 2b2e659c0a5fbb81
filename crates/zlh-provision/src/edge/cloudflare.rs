use std::time::Duration;

use serde_json::{Value, json};
use zlh_model::Transport;

use super::{AddressRecord, DnsProvider, EdgeError, EdgeResult, ServiceRecord};
use crate::config::env_string;
use crate::payload::short_name;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, Clone)]
pub struct CloudflareConfig {
    pub zone_id: String,
    pub token: String,
    pub zone: String,
}

impl CloudflareConfig {
    pub fn from_env(zone: &str) -> Result<Self, EdgeError> {
        Ok(Self {
            zone_id: env_string("CLOUDFLARE_ZONE_ID")
                .ok_or_else(|| EdgeError::Config("CLOUDFLARE_ZONE_ID is required".to_string()))?,
            token: env_string("CLOUDFLARE_API_TOKEN")
                .ok_or_else(|| EdgeError::Config("CLOUDFLARE_API_TOKEN is required".to_string()))?,
            zone: env_string("CLOUDFLARE_ZONE_NAME").unwrap_or_else(|| zone.to_string()),
        })
    }
}

/// Duplicate-record errors on create mean the record is already in place.
fn is_duplicate(body: &str) -> bool {
    body.contains("81057") || body.contains("81058") || body.contains("already exists")
}

/// Public DNS host.
pub struct CloudflareDns {
    http: reqwest::Client,
    cfg: CloudflareConfig,
}

impl CloudflareDns {
    pub fn new(cfg: CloudflareConfig) -> Result<Self, EdgeError> {
        let http = reqwest::Client::builder()
            .user_agent("zlh-control")
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|source| EdgeError::Transport {
                op: "cloudflare client",
                source,
            })?;
        Ok(Self { http, cfg })
    }

    fn records_url(&self) -> String {
        format!("{API_BASE}/zones/{}/dns_records", self.cfg.zone_id)
    }

    async fn create(&self, op: &'static str, body: Value) -> EdgeResult<()> {
        let resp = self
            .http
            .post(self.records_url())
            .bearer_auth(&self.cfg.token)
            .json(&body)
            .send()
            .await
            .map_err(|source| EdgeError::Transport { op, source })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        if is_duplicate(&text) {
            tracing::debug!(op, "record already present");
            return Ok(());
        }
        Err(EdgeError::Api {
            op,
            status: status.as_u16(),
            body: text,
        })
    }

    async fn delete_by_name(&self, name: &str, kind: &str) -> EdgeResult<()> {
        let op = "dns_records delete";
        let resp = self
            .http
            .get(self.records_url())
            .bearer_auth(&self.cfg.token)
            .query(&[("name", name), ("type", kind)])
            .send()
            .await
            .map_err(|source| EdgeError::Transport { op, source })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EdgeError::Api {
                op,
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let list: Value = resp.json().await.unwrap_or(Value::Null);
        let ids: Vec<String> = list
            .get("result")
            .and_then(Value::as_array)
            .map(|recs| {
                recs.iter()
                    .filter_map(|r| r.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        for id in ids {
            let resp = self
                .http
                .delete(format!("{}/{id}", self.records_url()))
                .bearer_auth(&self.cfg.token)
                .send()
                .await
                .map_err(|source| EdgeError::Transport { op, source })?;
            let status = resp.status();
            if !status.is_success() && status.as_u16() != 404 {
                return Err(EdgeError::Api {
                    op,
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
            tracing::debug!(name, kind, record_id = %id, "cloudflare record deleted");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DnsProvider for CloudflareDns {
    async fn add_address(&self, rec: &AddressRecord) -> EdgeResult<()> {
        self.create(
            "dns_records create A",
            json!({
                "type": "A",
                "name": rec.fqdn,
                "content": rec.ip,
                "ttl": rec.ttl,
                "proxied": false,
            }),
        )
        .await
    }

    async fn delete_address(&self, fqdn: &str) -> EdgeResult<()> {
        self.delete_by_name(fqdn, "A").await
    }

    async fn add_service(&self, rec: &ServiceRecord) -> EdgeResult<()> {
        let owner = ServiceRecord::owner_name(&rec.service, rec.transport, &rec.fqdn);
        self.create(
            "dns_records create SRV",
            json!({
                "type": "SRV",
                "name": owner,
                "ttl": rec.ttl,
                "data": {
                    "service": format!("_{}", rec.service),
                    "proto": format!("_{}", rec.transport.as_str()),
                    "name": short_name(&rec.fqdn, &self.cfg.zone),
                    "target": rec.target,
                    "port": rec.port,
                    "priority": 0,
                    "weight": 0,
                },
            }),
        )
        .await
    }

    async fn delete_service(&self, service: &str, transport: Transport, fqdn: &str) -> EdgeResult<()> {
        let owner = ServiceRecord::owner_name(service, transport, fqdn);
        self.delete_by_name(&owner, "SRV").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection() {
        assert!(is_duplicate(r#"{"errors":[{"code":81057,"message":"Record already exists."}]}"#));
        assert!(!is_duplicate(r#"{"errors":[{"code":10000,"message":"Authentication error"}]}"#));
    }
}
