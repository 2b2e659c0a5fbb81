use std::{ops::RangeInclusive, time::Duration};

use zlh_model::InstanceClass;

use crate::retry::RetryPolicy;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First non-empty value among several historical variable names.
pub(crate) fn env_any(names: &[&str]) -> Option<String> {
    names.iter().find_map(|n| env_string(n))
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_millis(name: &str, default: Duration, min: Duration, max: Duration) -> Duration {
    env_u64(name)
        .map(Duration::from_millis)
        .map(|d| d.clamp(min, max))
        .unwrap_or(default)
}

fn env_range(name: &str, default: RangeInclusive<i32>) -> RangeInclusive<i32> {
    // "5000-5999"
    let Some(raw) = env_string(name) else {
        return default;
    };
    let parsed = raw.split_once('-').and_then(|(a, b)| {
        let a = a.trim().parse::<i32>().ok()?;
        let b = b.trim().parse::<i32>().ok()?;
        (a <= b).then_some(a..=b)
    });
    match parsed {
        Some(r) => r,
        None => {
            tracing::warn!(name, value = %raw, "ignoring malformed range");
            default
        }
    }
}

/// Whether the orchestrator publishes edges itself or hands off to the
/// durable publish queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Inline,
    Queued,
}

#[derive(Debug, Clone)]
pub struct IdentifierRanges {
    pub game: RangeInclusive<i32>,
    pub dev: RangeInclusive<i32>,
}

impl IdentifierRanges {
    pub fn for_class(&self, class: InstanceClass) -> RangeInclusive<i32> {
        match class {
            InstanceClass::Game => self.game.clone(),
            InstanceClass::Dev => self.dev.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortPoolSettings {
    pub class: String,
    pub range: RangeInclusive<i32>,
}

#[derive(Debug, Clone)]
pub struct HypervisorTiming {
    pub task_timeout: Duration,
    /// Backoff between task-status polls; only the delay schedule is used,
    /// the deadline bounds the loop.
    pub task_backoff: RetryPolicy,
    pub status_interval: Duration,
    pub status_timeout: Duration,
    pub start_retry: RetryPolicy,
    pub address_retry: RetryPolicy,
    pub allow_resize: bool,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub port: u16,
    pub token: Option<String>,
    pub status_interval: Duration,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EdgeSettings {
    pub zone: String,
    /// Internal DNS target for protocol-proxy routed workloads.
    pub protocol_proxy_address: String,
    /// Internal DNS target for reverse-proxy routed workloads.
    pub reverse_proxy_address: String,
    /// Public DNS target for every workload.
    pub public_address: String,
    pub ttl: u32,
    pub publish_dev: bool,
}

#[derive(Debug, Clone)]
pub struct ResourceDefaults {
    pub cpu: i32,
    pub memory_mib: i32,
    pub disk_gib: i32,
    pub game_bridge: String,
    pub dev_bridge: String,
    pub storage: String,
    pub base_image_id: i32,
}

impl ResourceDefaults {
    pub fn bridge_for(&self, class: InstanceClass) -> &str {
        match class {
            InstanceClass::Dev => &self.dev_bridge,
            InstanceClass::Game => &self.game_bridge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub mode: PublishMode,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    /// How long a claimed job may stay `running` before another worker
    /// takes it over.
    pub lease: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub identifiers: IdentifierRanges,
    pub ports: PortPoolSettings,
    pub hypervisor: HypervisorTiming,
    pub agent: AgentSettings,
    pub edge: EdgeSettings,
    pub resources: ResourceDefaults,
    pub publish: PublishSettings,
    pub store_retry: RetryPolicy,
    pub agent_refresh_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            identifiers: IdentifierRanges {
                game: 5000..=5999,
                dev: 6000..=6999,
            },
            ports: PortPoolSettings {
                class: "game".to_string(),
                range: 50000..=59999,
            },
            hypervisor: HypervisorTiming {
                task_timeout: Duration::from_secs(5 * 60),
                task_backoff: RetryPolicy::exponential(
                    u32::MAX,
                    Duration::from_secs(1),
                    2,
                    Duration::from_secs(10),
                ),
                status_interval: Duration::from_millis(1200),
                status_timeout: Duration::from_secs(180),
                start_retry: RetryPolicy::linear(
                    3,
                    Duration::from_secs(15),
                    Duration::from_secs(45),
                ),
                address_retry: RetryPolicy::fixed(12, Duration::from_secs(10)),
                allow_resize: false,
            },
            agent: AgentSettings {
                port: 18888,
                token: None,
                status_interval: Duration::from_secs(3),
                ready_timeout: Duration::from_secs(10 * 60),
                request_timeout: Duration::from_secs(30),
            },
            edge: EdgeSettings {
                zone: "zerolaghub.quest".to_string(),
                protocol_proxy_address: "10.70.0.241".to_string(),
                reverse_proxy_address: "10.60.0.242".to_string(),
                public_address: "139.64.165.248".to_string(),
                ttl: 60,
                publish_dev: true,
            },
            resources: ResourceDefaults {
                cpu: 2,
                memory_mib: 2048,
                disk_gib: 16,
                game_bridge: "vmbr3".to_string(),
                dev_bridge: "vmbr2".to_string(),
                storage: "zlh-thin".to_string(),
                base_image_id: 900,
            },
            publish: PublishSettings {
                mode: PublishMode::Inline,
                retry: RetryPolicy::exponential(
                    5,
                    Duration::from_secs(2),
                    2,
                    Duration::from_secs(60),
                ),
                poll_interval: Duration::from_secs(2),
                lease: Duration::from_secs(5 * 60),
            },
            store_retry: RetryPolicy::exponential(
                5,
                Duration::from_millis(20),
                2,
                Duration::from_millis(500),
            ),
            agent_refresh_interval: Duration::from_secs(5),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();

        let zone = env_any(&["ZLH_DNS_ZONE", "TECHNITIUM_ZONE", "DNS_ZONE"]).unwrap_or(d.edge.zone);

        let protocol_proxy_address = env_any(&["VELOCITY_EDGE_IP", "TRAEFIK_EDGE_IP"])
            .unwrap_or(d.edge.protocol_proxy_address);
        let reverse_proxy_address = env_any(&["TRAEFIK_EDGE_IP", "VELOCITY_EDGE_IP"])
            .unwrap_or(d.edge.reverse_proxy_address);
        let public_address = env_any(&["CLOUDFLARE_EDGE_IP", "EDGE_PUBLIC_IP"])
            .unwrap_or(d.edge.public_address);

        let publish_mode = match env_string("ZLH_PUBLISH_MODE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            Some("queued") | Some("queue") => PublishMode::Queued,
            _ => PublishMode::Inline,
        };

        Self {
            identifiers: IdentifierRanges {
                game: env_range("ZLH_GAME_ID_RANGE", d.identifiers.game),
                dev: env_range("ZLH_DEV_ID_RANGE", d.identifiers.dev),
            },
            ports: PortPoolSettings {
                class: env_string("ZLH_PORT_CLASS").unwrap_or(d.ports.class),
                range: env_range("ZLH_PORT_RANGE", d.ports.range),
            },
            hypervisor: HypervisorTiming {
                task_timeout: env_millis(
                    "ZLH_TASK_TIMEOUT_MS",
                    d.hypervisor.task_timeout,
                    Duration::from_secs(10),
                    Duration::from_secs(60 * 60),
                ),
                status_timeout: env_millis(
                    "ZLH_STATUS_TIMEOUT_MS",
                    d.hypervisor.status_timeout,
                    Duration::from_secs(10),
                    Duration::from_secs(60 * 60),
                ),
                start_retry: RetryPolicy::linear(
                    3,
                    env_millis(
                        "ZLH_START_RETRY_STEP_MS",
                        Duration::from_secs(15),
                        Duration::from_millis(100),
                        Duration::from_secs(5 * 60),
                    ),
                    Duration::from_secs(15 * 60),
                ),
                allow_resize: env_bool("PVE_ALLOW_RESIZE").unwrap_or(false),
                ..d.hypervisor
            },
            agent: AgentSettings {
                port: env_u64("ZLH_AGENT_PORT")
                    .and_then(|v| u16::try_from(v).ok())
                    .unwrap_or(d.agent.port),
                token: env_string("ZLH_AGENT_TOKEN"),
                ready_timeout: env_millis(
                    "ZLH_AGENT_TIMEOUT_MS",
                    d.agent.ready_timeout,
                    Duration::from_secs(10),
                    Duration::from_secs(60 * 60),
                ),
                ..d.agent
            },
            edge: EdgeSettings {
                zone: zone.trim_matches('.').to_ascii_lowercase(),
                protocol_proxy_address,
                reverse_proxy_address,
                public_address,
                ttl: env_u64("ZLH_DNS_TTL")
                    .map(|v| v.clamp(30, 86_400) as u32)
                    .unwrap_or(d.edge.ttl),
                publish_dev: env_bool("ZLH_PUBLISH_DEV").unwrap_or(d.edge.publish_dev),
            },
            resources: ResourceDefaults {
                storage: env_any(&["PROXMOX_STORAGE", "PROXMOX_DEFAULT_STORAGE"])
                    .unwrap_or(d.resources.storage),
                base_image_id: env_any(&[
                    "ZLH_AGENT_TEMPLATE_ID",
                    "AGENT_TEMPLATE_VMID",
                    "BASE_TEMPLATE_VMID",
                ])
                .and_then(|v| v.parse::<i32>().ok())
                .unwrap_or(d.resources.base_image_id),
                ..d.resources
            },
            publish: PublishSettings {
                mode: publish_mode,
                lease: env_millis(
                    "ZLH_PUBLISH_LEASE_MS",
                    d.publish.lease,
                    Duration::from_secs(10),
                    Duration::from_secs(60 * 60),
                ),
                ..d.publish
            },
            store_retry: d.store_retry,
            agent_refresh_interval: env_millis(
                "ZLH_AGENT_REFRESH_MS",
                d.agent_refresh_interval,
                Duration::from_secs(1),
                Duration::from_secs(10 * 60),
            ),
        }
    }
}
