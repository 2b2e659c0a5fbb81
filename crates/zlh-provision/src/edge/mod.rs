//! Edge publication: internal DNS, public DNS, and either a protocol-proxy
//! backend or reverse-proxy routes, each applied best-effort.

pub mod cloudflare;
pub mod technitium;
pub mod traefik;
pub mod velocity;

use std::sync::Arc;

use zlh_model::{InstanceClass, InstanceId, Transport};

use crate::config::EdgeSettings;
use crate::error::{ProvisionError, Result};
use crate::payload::{fqdn, short_name};
use crate::workloads::{WorkloadCatalog, WorkloadProfile};

const DEFAULT_PROXY_PORT: u16 = 25565;

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("{op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op}: HTTP {status}: {body}")]
    Api {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("{op}: {message}")]
    Rejected { op: &'static str, message: String },

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("route yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Config(String),
}

pub type EdgeResult<T> = std::result::Result<T, EdgeError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub fqdn: String,
    pub ip: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service: String,
    pub transport: Transport,
    pub fqdn: String,
    pub port: u16,
    pub target: String,
    pub ttl: u32,
}

impl ServiceRecord {
    /// `_<service>._<proto>.<fqdn>`
    pub fn owner_name(service: &str, transport: Transport, fqdn: &str) -> String {
        format!("_{service}._{}.{fqdn}", transport.as_str())
    }
}

/// One DNS backend. Deletes treat a missing record as success.
#[async_trait::async_trait]
pub trait DnsProvider: Send + Sync {
    async fn add_address(&self, rec: &AddressRecord) -> EdgeResult<()>;
    async fn delete_address(&self, fqdn: &str) -> EdgeResult<()>;
    async fn add_service(&self, rec: &ServiceRecord) -> EdgeResult<()>;
    async fn delete_service(&self, service: &str, transport: Transport, fqdn: &str) -> EdgeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    DuplicateSkipped,
}

#[async_trait::async_trait]
pub trait ProtocolProxy: Send + Sync {
    async fn register(&self, name: &str, address: &str, port: u16) -> EdgeResult<Registration>;
    /// Unknown names are not an error.
    async fn unregister(&self, name: &str) -> EdgeResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hostname: String,
    pub external_port: u16,
    pub backend_address: String,
    pub backend_port: u16,
    pub transport: Transport,
}

#[async_trait::async_trait]
pub trait RouteWriter: Send + Sync {
    async fn write_route(&self, route: &Route) -> EdgeResult<()>;
    /// Removes every route for `hostname`, returning how many were removed.
    async fn remove_routes(&self, hostname: &str) -> EdgeResult<usize>;
}

/// What the publisher needs to know about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeTarget {
    pub instance_id: InstanceId,
    pub hostname: String,
    pub class: InstanceClass,
    pub workload: String,
    pub address: Option<String>,
    pub ports: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeReport {
    pub steps: Vec<StepOutcome>,
}

impl EdgeReport {
    fn record(&mut self, instance_id: InstanceId, step: impl Into<String>, res: EdgeResult<()>) {
        let step = step.into();
        let error = match res {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(instance_id, step = %step, error = %err, "edge step failed");
                Some(err.to_string())
            }
        };
        self.steps.push(StepOutcome { step, error });
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    pub fn ran(&self, step: &str) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }
}

fn to_port(p: i32) -> Option<u16> {
    u16::try_from(p).ok().filter(|p| *p > 0)
}

/// Guest-side port behind the `index`-th external port. The first one maps
/// to the workload's listen port when it has one.
pub fn backend_port(profile: &WorkloadProfile, index: usize, external: u16) -> u16 {
    match (index, profile.default_port) {
        (0, Some(p)) => p,
        _ => external,
    }
}

#[derive(Clone)]
pub struct EdgePublisher {
    catalog: Arc<WorkloadCatalog>,
    internal_dns: Arc<dyn DnsProvider>,
    public_dns: Arc<dyn DnsProvider>,
    proxy: Arc<dyn ProtocolProxy>,
    routes: Arc<dyn RouteWriter>,
    settings: EdgeSettings,
}

impl EdgePublisher {
    pub fn new(
        catalog: Arc<WorkloadCatalog>,
        internal_dns: Arc<dyn DnsProvider>,
        public_dns: Arc<dyn DnsProvider>,
        proxy: Arc<dyn ProtocolProxy>,
        routes: Arc<dyn RouteWriter>,
        settings: EdgeSettings,
    ) -> Self {
        Self {
            catalog,
            internal_dns,
            public_dns,
            proxy,
            routes,
            settings,
        }
    }

    pub fn profile(&self, class: InstanceClass, workload: &str) -> &WorkloadProfile {
        match class {
            InstanceClass::Dev => self.catalog.dev(),
            InstanceClass::Game => self.catalog.resolve(workload),
        }
    }

    pub fn should_publish(&self, class: InstanceClass) -> bool {
        class == InstanceClass::Game || self.settings.publish_dev
    }

    pub fn fqdn(&self, hostname: &str) -> String {
        fqdn(hostname, &self.settings.zone)
    }

    /// Fails only when there is nothing to publish; individual edge steps
    /// are logged and reported.
    pub async fn publish(&self, target: &EdgeTarget) -> Result<EdgeReport> {
        let address = target
            .address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| {
                ProvisionError::PublishFailed(format!(
                    "instance {} has no backend address",
                    target.instance_id
                ))
            })?;
        if target.hostname.trim().is_empty() {
            return Err(ProvisionError::PublishFailed(format!(
                "instance {} has no hostname",
                target.instance_id
            )));
        }

        let id = target.instance_id;
        let profile = self.profile(target.class, &target.workload);
        let fqdn = self.fqdn(&target.hostname);
        let short = short_name(&fqdn, &self.settings.zone).to_string();
        let ports: Vec<u16> = target.ports.iter().filter_map(|p| to_port(*p)).collect();
        let srv_port = ports.first().copied().or(profile.default_port);
        let ttl = self.settings.ttl;

        tracing::info!(
            instance_id = id,
            hostname = %fqdn,
            workload = %profile.key,
            backend = address,
            ?ports,
            "publishing edge"
        );

        let mut report = EdgeReport::default();

        let internal_ip = if profile.uses_protocol_proxy() {
            &self.settings.protocol_proxy_address
        } else {
            for (i, &external) in ports.iter().enumerate() {
                let route = Route {
                    hostname: short.clone(),
                    external_port: external,
                    backend_address: address.to_string(),
                    backend_port: backend_port(profile, i, external),
                    transport: profile.transport,
                };
                let res = self.routes.write_route(&route).await;
                report.record(id, format!("route:{external}"), res);
            }
            &self.settings.reverse_proxy_address
        };

        let a = AddressRecord {
            fqdn: fqdn.clone(),
            ip: internal_ip.clone(),
            ttl,
        };
        let res = self.internal_dns.add_address(&a).await;
        report.record(id, "internal:a", res);

        if let Some(port) = srv_port {
            let srv = ServiceRecord {
                service: profile.service.clone(),
                transport: profile.transport,
                fqdn: fqdn.clone(),
                port,
                target: fqdn.clone(),
                ttl,
            };
            let res = self.internal_dns.add_service(&srv).await;
            report.record(id, "internal:srv", res);
            let res = self.public_dns.add_service(&srv).await;
            report.record(id, "public:srv", res);
        }

        let public_a = AddressRecord {
            fqdn: fqdn.clone(),
            ip: self.settings.public_address.clone(),
            ttl,
        };
        let res = self.public_dns.add_address(&public_a).await;
        report.record(id, "public:a", res);

        if profile.uses_protocol_proxy() {
            let port = profile.default_port.unwrap_or(DEFAULT_PROXY_PORT);
            let res = self.proxy.register(&fqdn, address, port).await.map(|_| ());
            report.record(id, "proxy:register", res);
        }

        tracing::info!(
            instance_id = id,
            hostname = %fqdn,
            failed = report.failures().count(),
            "edge publish complete"
        );
        Ok(report)
    }

    /// Mirror of [`publish`](Self::publish). Every step runs regardless of
    /// routing strategy and a missing record counts as removed.
    pub async fn unpublish(&self, target: &EdgeTarget) -> EdgeReport {
        let id = target.instance_id;
        let profile = self.profile(target.class, &target.workload);
        let fqdn = self.fqdn(&target.hostname);
        let short = short_name(&fqdn, &self.settings.zone).to_string();

        tracing::info!(instance_id = id, hostname = %fqdn, "unpublishing edge");
        let mut report = EdgeReport::default();

        let res = self.routes.remove_routes(&short).await.map(|n| {
            if n == 0 {
                tracing::debug!(instance_id = id, hostname = %short, "no routes to remove");
            }
        });
        report.record(id, "routes:remove", res);

        let res = self.proxy.unregister(&fqdn).await;
        report.record(id, "proxy:unregister", res);

        let res = self.internal_dns.delete_address(&fqdn).await;
        report.record(id, "internal:a", res);
        let res = self
            .internal_dns
            .delete_service(&profile.service, profile.transport, &fqdn)
            .await;
        report.record(id, "internal:srv", res);

        let res = self.public_dns.delete_address(&fqdn).await;
        report.record(id, "public:a", res);
        let res = self
            .public_dns
            .delete_service(&profile.service, profile.transport, &fqdn)
            .await;
        report.record(id, "public:srv", res);

        report
    }
}
