//! Workload catalog: what service a workload advertises, on which transport,
//! and which edge routing strategy publishes it.
//!
//! The mapping changed several times in production, so it is data. Built-in
//! defaults can be replaced with a TOML file named by `ZLH_WORKLOADS_FILE`.

use std::path::Path;

use zlh_model::{RoutingStrategy, Transport};

use crate::config::env_string;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct WorkloadProfile {
    pub key: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// SRV service label, without the leading underscore.
    pub service: String,
    pub transport: Transport,
    /// Port the workload listens on inside the guest.
    #[serde(default)]
    pub default_port: Option<u16>,
    pub routing: RoutingStrategy,
    pub hostname_prefix: String,
    /// Variants that are spelled out in the hostname (`mc-paper-5001`).
    #[serde(default)]
    pub hostname_variants: Vec<String>,
}

impl WorkloadProfile {
    fn matches(&self, workload: &str) -> bool {
        self.key == workload || self.aliases.iter().any(|a| a == workload)
    }

    pub fn uses_protocol_proxy(&self) -> bool {
        self.routing == RoutingStrategy::ProtocolProxy
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct CatalogFile {
    #[serde(rename = "workload", default)]
    workloads: Vec<WorkloadProfile>,
    generic: Option<WorkloadProfile>,
    dev: Option<WorkloadProfile>,
}

#[derive(Debug, Clone)]
pub struct WorkloadCatalog {
    profiles: Vec<WorkloadProfile>,
    generic: WorkloadProfile,
    dev: WorkloadProfile,
}

fn profile(
    key: &str,
    aliases: &[&str],
    transport: Transport,
    port: u16,
    routing: RoutingStrategy,
    prefix: &str,
) -> WorkloadProfile {
    WorkloadProfile {
        key: key.to_string(),
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        service: key.to_string(),
        transport,
        default_port: Some(port),
        routing,
        hostname_prefix: prefix.to_string(),
        hostname_variants: Vec::new(),
    }
}

impl WorkloadCatalog {
    pub fn builtin() -> Self {
        use RoutingStrategy::{ProtocolProxy, ReverseProxy};
        use Transport::{Tcp, Udp};

        let mut minecraft = profile("minecraft", &["mc", "mcp"], Tcp, 25565, ProtocolProxy, "mc");
        minecraft.hostname_variants = ["paper", "forge", "fabric", "vanilla", "purpur", "neoforge"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        Self {
            profiles: vec![
                minecraft,
                profile("rust", &[], Udp, 28015, ReverseProxy, "rust"),
                profile("terraria", &[], Tcp, 7777, ReverseProxy, "terraria"),
                profile("projectzomboid", &[], Udp, 16261, ReverseProxy, "projectzomboid"),
                profile("valheim", &[], Udp, 2456, ReverseProxy, "valheim"),
                profile("palworld", &[], Udp, 8211, ReverseProxy, "palworld"),
            ],
            generic: WorkloadProfile {
                key: "generic".to_string(),
                aliases: Vec::new(),
                service: "game".to_string(),
                transport: Tcp,
                default_port: None,
                routing: ReverseProxy,
                hostname_prefix: "game".to_string(),
                hostname_variants: Vec::new(),
            },
            dev: WorkloadProfile {
                key: "dev".to_string(),
                aliases: Vec::new(),
                service: "dev".to_string(),
                transport: Tcp,
                default_port: None,
                routing: ReverseProxy,
                hostname_prefix: "dev".to_string(),
                hostname_variants: Vec::new(),
            },
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let file: CatalogFile = toml::from_str(raw)?;
        let builtin = Self::builtin();
        Ok(Self {
            profiles: file.workloads,
            generic: file.generic.unwrap_or(builtin.generic),
            dev: file.dev.unwrap_or(builtin.dev),
        })
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("read {}: {e}", path.display()))?;
        Self::from_toml_str(&raw).map_err(|e| format!("parse {}: {e}", path.display()))
    }

    /// Catalog from `ZLH_WORKLOADS_FILE`, falling back to built-ins.
    pub fn from_env() -> Self {
        let Some(path) = env_string("ZLH_WORKLOADS_FILE") else {
            return Self::builtin();
        };
        match Self::load(Path::new(&path)) {
            Ok(c) => {
                tracing::info!(path, workloads = c.profiles.len(), "loaded workload catalog");
                c
            }
            Err(err) => {
                tracing::warn!(path, %err, "failed to load workload catalog; using built-ins");
                Self::builtin()
            }
        }
    }

    /// Exact key/alias match first, then a key contained in the name
    /// (`minecraft-java` resolves to `minecraft`), then the generic profile.
    pub fn resolve(&self, workload: &str) -> &WorkloadProfile {
        let w = workload.trim().to_ascii_lowercase();
        self.profiles
            .iter()
            .find(|p| p.matches(&w))
            .or_else(|| self.profiles.iter().find(|p| w.contains(p.key.as_str())))
            .unwrap_or(&self.generic)
    }

    pub fn dev(&self) -> &WorkloadProfile {
        &self.dev
    }
}

impl Default for WorkloadCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_minecraft_family() {
        let c = WorkloadCatalog::builtin();
        assert_eq!(c.resolve("minecraft").key, "minecraft");
        assert_eq!(c.resolve("MC").key, "minecraft");
        assert_eq!(c.resolve("minecraft-bedrock").key, "minecraft");
        assert!(c.resolve("minecraft").uses_protocol_proxy());
        assert_eq!(c.resolve("minecraft").default_port, Some(25565));
    }

    #[test]
    fn unknown_workload_falls_back_to_generic() {
        let c = WorkloadCatalog::builtin();
        let p = c.resolve("factorio");
        assert_eq!(p.key, "generic");
        assert_eq!(p.routing, RoutingStrategy::ReverseProxy);
        assert_eq!(p.default_port, None);
    }

    #[test]
    fn valheim_is_udp_reverse_proxy() {
        let c = WorkloadCatalog::builtin();
        let p = c.resolve("valheim");
        assert_eq!(p.transport, Transport::Udp);
        assert_eq!(p.default_port, Some(2456));
        assert!(!p.uses_protocol_proxy());
    }

    #[test]
    fn toml_catalog_replaces_mapping() {
        let raw = r#"
[[workload]]
key = "minecraft"
service = "minecraft"
transport = "tcp"
default_port = 25565
routing = "reverse_proxy"
hostname_prefix = "mc"
"#;
        let c = WorkloadCatalog::from_toml_str(raw).unwrap();
        assert!(!c.resolve("minecraft").uses_protocol_proxy());
        assert_eq!(c.resolve("terraria").key, "generic");
        assert_eq!(c.dev().key, "dev");
    }
}
