//! The provisioning saga.
//!
//! `Allocating → PortReserving → Cloning → Configuring → Starting →
//! AgentConfiguring → AgentAwaiting → Persisting → Publishing → Confirmed`.
//! Every step registers its undo action before (or right after) producing a
//! side effect; any failure moves to `Failed` and runs the collected
//! compensations, then returns the original error.

use std::{net::Ipv4Addr, sync::Arc};

use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zlh_db::entities::instances;
use zlh_model::{InstanceClass, InstanceId, SagaState};

use crate::agent::{AgentClient, GuestAgent};
use crate::compensation::{Compensation, CompensationList, Compensators};
use crate::config::{PublishMode, Settings};
use crate::edge::{EdgePublisher, EdgeTarget, backend_port};
use crate::error::{ProvisionError, Result};
use crate::hypervisor::{CloneSpec, ConfigureSpec, Hypervisor};
use crate::identifiers::IdentifierAllocator;
use crate::lifecycle::LifecycleDriver;
use crate::payload;
use crate::ports::PortAllocator;
use crate::publish_queue::PublishQueue;
use crate::store::now;
use crate::templates::{Blueprint, ResourceRequest, TemplateResolver};
use crate::workloads::WorkloadProfile;

const MAX_PORTS: u32 = 16;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionRequest {
    pub customer_id: String,
    #[serde(alias = "ctype")]
    pub class: Option<String>,
    #[serde(alias = "workload")]
    pub game: Option<String>,
    pub variant: Option<String>,
    pub version: Option<String>,
    pub world: Option<String>,
    pub runtime: Option<String>,
    #[serde(alias = "template")]
    pub template_slug: Option<String>,
    pub name: Option<String>,
    pub ports_needed: u32,
    pub resources: ResourceRequest,
    pub storage: Option<String>,
    pub artifact_path: Option<String>,
    pub java_path: Option<String>,
    pub steam_user: Option<String>,
    pub steam_pass: Option<String>,
    pub steam_auth: Option<String>,
    pub admin_user: Option<String>,
    pub admin_pass: Option<String>,
}

fn trimmed(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
}

impl ProvisionRequest {
    pub fn class(&self) -> InstanceClass {
        InstanceClass::parse_lenient(self.class.as_deref())
    }

    /// Catalog key: the game for game instances, the runtime for dev.
    pub fn workload(&self) -> Option<String> {
        match self.class() {
            InstanceClass::Game => trimmed(&self.game),
            InstanceClass::Dev => trimmed(&self.runtime),
        }
    }

    /// Everything that can be rejected before a side effect is produced.
    pub fn validate(&self, profile: &WorkloadProfile) -> Result<()> {
        if self.customer_id.trim().is_empty() {
            return Err(ProvisionError::Validation("customerId is required".to_string()));
        }
        if self.ports_needed > MAX_PORTS {
            return Err(ProvisionError::Validation(format!(
                "portsNeeded must be at most {MAX_PORTS}"
            )));
        }
        match self.class() {
            InstanceClass::Dev => {
                if trimmed(&self.runtime).is_none() {
                    return Err(ProvisionError::Validation(
                        "runtime is required for dev instances".to_string(),
                    ));
                }
            }
            InstanceClass::Game => {
                if trimmed(&self.game).is_none() {
                    return Err(ProvisionError::Validation(
                        "game is required for game instances".to_string(),
                    ));
                }
                if profile.uses_protocol_proxy() && !profile.hostname_variants.is_empty() {
                    let variant = trimmed(&self.variant).ok_or_else(|| {
                        ProvisionError::Validation("variant is required for minecraft".to_string())
                    })?;
                    // An explicit artifact path replaces the variant's download mapping.
                    if trimmed(&self.artifact_path).is_none() {
                        payload::minecraft_artifact(&variant, "0")?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub identifier: InstanceId,
    pub address: String,
    /// Fully qualified.
    pub hostname: String,
    pub ports: Vec<i32>,
}

/// What happened during one run, for callers and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SagaTrace {
    pub states: Vec<SagaState>,
    pub compensations: Vec<&'static str>,
    pub failed_at: Option<SagaState>,
}

impl SagaTrace {
    pub fn current(&self) -> Option<SagaState> {
        self.states.last().copied()
    }

    fn enter(&mut self, id: Option<InstanceId>, to: SagaState) {
        if let Some(from) = self.current() {
            debug_assert!(from.can_transition(to), "{from} -> {to}");
        }
        tracing::info!(instance_id = id, state = %to, "saga state");
        self.states.push(to);
    }
}

/// Mutable per-run state threaded through the steps.
struct Run {
    trace: SagaTrace,
    undo: CompensationList,
    id: Option<InstanceId>,
}

impl Run {
    fn enter(&mut self, to: SagaState) {
        self.trace.enter(self.id, to);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    db: DatabaseConnection,
    settings: Settings,
    ids: IdentifierAllocator,
    ports: PortAllocator,
    templates: TemplateResolver,
    driver: LifecycleDriver,
    agent: AgentClient,
    publisher: EdgePublisher,
    queue: PublishQueue,
}

impl Orchestrator {
    pub fn new(
        db: DatabaseConnection,
        settings: Settings,
        hypervisor: Arc<dyn Hypervisor>,
        agent: Arc<dyn GuestAgent>,
        publisher: EdgePublisher,
    ) -> Self {
        let ids = IdentifierAllocator::new(db.clone(), settings.identifiers.clone(), settings.store_retry);
        let ports = PortAllocator::new(db.clone(), settings.store_retry);
        let queue = PublishQueue::new(
            db.clone(),
            publisher.clone(),
            ports.clone(),
            settings.ports.class.clone(),
            settings.publish.clone(),
        );
        Self {
            templates: TemplateResolver::new(db.clone()),
            driver: LifecycleDriver::new(hypervisor, settings.hypervisor.clone()),
            agent: AgentClient::new(agent, &settings.agent),
            db,
            settings,
            ids,
            ports,
            publisher,
            queue,
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn driver(&self) -> &LifecycleDriver {
        &self.driver
    }

    pub fn publisher(&self) -> &EdgePublisher {
        &self.publisher
    }

    pub fn publish_queue(&self) -> &PublishQueue {
        &self.queue
    }

    fn compensators(&self) -> Compensators {
        Compensators {
            db: self.db.clone(),
            ids: self.ids.clone(),
            ports: self.ports.clone(),
            driver: self.driver.clone(),
            publisher: self.publisher.clone(),
        }
    }

    pub async fn provision(&self, req: ProvisionRequest) -> Result<Provisioned> {
        self.provision_traced(req).await.0
    }

    pub async fn provision_traced(&self, req: ProvisionRequest) -> (Result<Provisioned>, SagaTrace) {
        let mut run = Run {
            trace: SagaTrace::default(),
            undo: CompensationList::default(),
            id: None,
        };
        let result = self.run_saga(&req, &mut run).await;
        let Run { mut trace, undo, id } = run;

        match result {
            Ok(done) => {
                trace.enter(id, SagaState::Confirmed);
                (Ok(done), trace)
            }
            Err(err) => {
                let failed_at = trace.current();
                trace.failed_at = failed_at;
                tracing::error!(
                    instance_id = id,
                    failed_at = ?failed_at,
                    code = err.code(),
                    error = %err,
                    "provisioning failed"
                );
                trace.enter(id, SagaState::Failed);
                if !undo.is_empty() {
                    trace.compensations = undo.run(&self.compensators()).await;
                }
                (Err(err), trace)
            }
        }
    }

    async fn run_saga(&self, req: &ProvisionRequest, run: &mut Run) -> Result<Provisioned> {
        let class = req.class();
        let workload = req.workload().unwrap_or_default();
        let profile = self.publisher.profile(class, &workload).clone();
        req.validate(&profile)?;
        let variant = trimmed(&req.variant);

        let template = self
            .templates
            .resolve(req.template_slug.as_deref(), Some(&workload), variant.as_deref())
            .await?;
        let blueprint = Blueprint::build(
            class,
            template.as_ref(),
            &req.resources,
            req.storage.as_deref(),
            &self.settings.resources,
        );

        run.enter(SagaState::Allocating);
        let id = self.ids.allocate(class).await?;
        run.id = Some(id);
        run.undo.push(Compensation::ReleaseIdentifier(id));

        run.enter(SagaState::PortReserving);
        let ports = self.reserve_ports(req, &profile, id, run).await?;

        let hostname = match class {
            InstanceClass::Game => payload::game_hostname(&profile, variant.as_deref(), id),
            InstanceClass::Dev => payload::dev_hostname(req.runtime.as_deref(), id),
        };
        let fqdn = self.publisher.fqdn(&hostname);

        run.enter(SagaState::Cloning);
        run.undo.push(Compensation::DeleteContainer(id));
        self.driver
            .clone_container(&CloneSpec {
                template_id: blueprint.base_image_id,
                new_id: id,
                hostname: hostname.clone(),
                storage: blueprint.storage.clone(),
            })
            .await?;

        run.enter(SagaState::Configuring);
        self.driver
            .configure(&ConfigureSpec {
                id,
                cpu: blueprint.resources.cpu,
                memory_mib: blueprint.resources.memory_mib,
                bridge: blueprint.bridge.clone(),
                tags: vec![
                    "zlh".to_string(),
                    class.as_str().to_string(),
                    profile.key.clone(),
                ],
                description: format!("customer={} workload={workload}", req.customer_id.trim()),
            })
            .await?;
        if blueprint.needs_resize() {
            self.driver.resize(id, blueprint.resources.disk_gib).await?;
        }

        run.enter(SagaState::Starting);
        self.driver.start_with_retry(id).await?;
        let address = self.driver.resolve_address(id).await?;

        run.enter(SagaState::AgentConfiguring);
        let config = self.build_payload(id, req, &profile, &ports)?;
        let address_str = address.to_string();
        self.agent.push_config(&address_str, &config).await?;

        run.enter(SagaState::AgentAwaiting);
        let status = self
            .agent
            .await_running(&address_str, self.agent.ready_timeout())
            .await?;

        run.enter(SagaState::Persisting);
        self.persist(id, req, class, &fqdn, address, &ports, status.state.as_str(), config)
            .await?;
        run.undo.push(Compensation::DeleteInstanceRecord(id));

        run.enter(SagaState::Publishing);
        let target = EdgeTarget {
            instance_id: id,
            hostname: fqdn.clone(),
            class,
            workload: workload.clone(),
            address: Some(address_str.clone()),
            ports: ports.clone(),
        };
        if self.publisher.should_publish(class) {
            self.publish(&target, run).await?;
        } else {
            tracing::info!(instance_id = id, "edge publication disabled for class");
            self.ports.commit(id, &ports, &self.settings.ports.class).await?;
        }

        self.ids.confirm(id).await?;
        Ok(Provisioned {
            identifier: id,
            address: address_str,
            hostname: fqdn,
            ports,
        })
    }

    /// Protocol-proxy workloads share the proxy's public port and reserve
    /// nothing.
    async fn reserve_ports(
        &self,
        req: &ProvisionRequest,
        profile: &WorkloadProfile,
        id: InstanceId,
        run: &mut Run,
    ) -> Result<Vec<i32>> {
        if profile.uses_protocol_proxy() {
            if req.ports_needed > 0 {
                tracing::info!(
                    instance_id = id,
                    requested = req.ports_needed,
                    workload = %profile.key,
                    "protocol-proxy workload; skipping port reservation"
                );
            }
            return Ok(Vec::new());
        }
        if req.ports_needed == 0 {
            return Ok(Vec::new());
        }
        run.undo.push(Compensation::ReleasePorts(id));
        let ports = self
            .ports
            .reserve(&self.settings.ports.class, req.ports_needed as usize, id)
            .await?;
        tracing::info!(instance_id = id, ?ports, "ports reserved");
        Ok(ports)
    }

    /// Ports the guest listens on, in external-port order.
    fn guest_ports(profile: &WorkloadProfile, external: &[i32]) -> Vec<i32> {
        if external.is_empty() {
            return profile.default_port.map(i32::from).into_iter().collect();
        }
        external
            .iter()
            .enumerate()
            .map(|(i, &p)| match u16::try_from(p) {
                Ok(port) => i32::from(backend_port(profile, i, port)),
                Err(_) => p,
            })
            .collect()
    }

    fn build_payload(
        &self,
        id: InstanceId,
        req: &ProvisionRequest,
        profile: &WorkloadProfile,
        ports: &[i32],
    ) -> Result<Value> {
        match req.class() {
            InstanceClass::Dev => payload::dev_payload(id, req),
            InstanceClass::Game => {
                payload::game_payload(id, req, profile, &Self::guest_ports(profile, ports))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        id: InstanceId,
        req: &ProvisionRequest,
        class: InstanceClass,
        fqdn: &str,
        address: Ipv4Addr,
        ports: &[i32],
        agent_state: &str,
        config: Value,
    ) -> Result<()> {
        let ts = now();
        instances::ActiveModel {
            id: Set(id),
            customer_id: Set(req.customer_id.trim().to_string()),
            class: Set(class.as_str().to_string()),
            game: Set(trimmed(&req.game)),
            variant: Set(trimmed(&req.variant)),
            runtime: Set(trimmed(&req.runtime)),
            version: Set(req.version.clone()),
            address: Set(Some(address.to_string())),
            ports: Set(serde_json::json!(ports)),
            hostname: Set(fqdn.to_string()),
            agent_state: Set(Some(agent_state.to_string())),
            agent_last_seen: Set(Some(ts)),
            payload: Set(config),
            created_at: Set(ts),
            updated_at: Set(ts),
        }
        .insert(&self.db)
        .await?;
        tracing::info!(instance_id = id, hostname = fqdn, "instance recorded");
        Ok(())
    }

    async fn publish(&self, target: &EdgeTarget, run: &mut Run) -> Result<()> {
        let id = target.instance_id;
        run.undo.push(Compensation::Unpublish(target.clone()));
        match self.settings.publish.mode {
            PublishMode::Inline => {
                let report = self.publisher.publish(target).await?;
                if report.failures().count() > 0 {
                    tracing::warn!(
                        instance_id = id,
                        failed = report.failures().count(),
                        "edge published with partial failures"
                    );
                }
                self.ports
                    .commit(id, &target.ports, &self.settings.ports.class)
                    .await
            }
            PublishMode::Queued => {
                self.queue.enqueue(target).await?;
                Ok(())
            }
        }
    }
}
