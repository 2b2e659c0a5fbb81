//! In-memory store and recording fakes for every external seam.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, Set};
use sea_orm_migration::MigratorTrait;
use serde_json::Value;
use zlh_db::entities::instances;
use zlh_model::{AgentState, InstanceId, Transport};

use crate::agent::{AgentCallError, AgentStatus, GuestAgent};
use crate::config::Settings;
use crate::edge::{
    AddressRecord, DnsProvider, EdgeError, EdgePublisher, EdgeResult, ProtocolProxy, Registration,
    Route, RouteWriter, ServiceRecord,
};
use crate::hypervisor::{
    CloneSpec, ConfigureSpec, HvResult, Hypervisor, HypervisorError, NetworkInterface, TaskHandle,
    TaskStatus,
};
use crate::retry::RetryPolicy;
use crate::store::now;
use crate::workloads::WorkloadCatalog;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Single-connection SQLite so every handle sees the same database.
pub async fn memory_db() -> DatabaseConnection {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await.unwrap();
    zlh_migration::Migrator::up(&db, None).await.unwrap();
    db
}

pub fn fast_settings() -> Settings {
    let mut s = Settings::default();
    let ms = Duration::from_millis;
    s.hypervisor.task_timeout = ms(500);
    s.hypervisor.task_backoff = RetryPolicy::exponential(u32::MAX, ms(1), 2, ms(5));
    s.hypervisor.status_interval = ms(1);
    s.hypervisor.status_timeout = ms(200);
    s.hypervisor.start_retry = RetryPolicy::linear(3, ms(1), ms(5));
    s.hypervisor.address_retry = RetryPolicy::fixed(3, ms(1));
    s.agent.status_interval = ms(1);
    s.agent.ready_timeout = ms(50);
    s.agent.request_timeout = ms(1000);
    s.publish.retry = RetryPolicy::exponential(3, ms(1), 2, ms(4));
    s.publish.poll_interval = ms(5);
    s.publish.lease = ms(50);
    s.store_retry = RetryPolicy::exponential(10, ms(1), 2, ms(20));
    s.agent_refresh_interval = ms(5);
    s
}

pub async fn insert_instance(db: &DatabaseConnection, id: InstanceId, hostname: &str) {
    let ts = now();
    instances::ActiveModel {
        id: Set(id),
        customer_id: Set("cust-test".to_string()),
        class: Set("game".to_string()),
        game: Set(Some("minecraft".to_string())),
        variant: Set(Some("paper".to_string())),
        runtime: Set(None),
        version: Set(Some("1.20.1".to_string())),
        address: Set(Some(format!("10.200.0.{}", id % 200 + 10))),
        ports: Set(serde_json::json!([])),
        hostname: Set(hostname.to_string()),
        agent_state: Set(Some("running".to_string())),
        agent_last_seen: Set(None),
        payload: Set(serde_json::json!({})),
        created_at: Set(ts),
        updated_at: Set(ts),
    }
    .insert(db)
    .await
    .unwrap();
}

#[derive(Default)]
struct HvState {
    containers: HashMap<InstanceId, String>,
    tasks: HashMap<String, VecDeque<TaskStatus>>,
    calls: Vec<String>,
    failing_starts: u32,
    failing_deletes: bool,
    no_address: HashSet<InstanceId>,
    configured: HashMap<InstanceId, ConfigureSpec>,
}

/// Containers change state synchronously and no task handles are issued,
/// so the driver always falls through to status polling. Only mutating calls
/// are recorded, as `"<op> <id>"`.
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<HvState>,
}

impl FakeHypervisor {
    /// The last scripted status repeats once the script runs out.
    pub fn script_task(&self, handle: &str, steps: &[(&str, Option<&str>)]) {
        let steps = steps
            .iter()
            .map(|(status, exit)| TaskStatus {
                status: status.to_string(),
                exit_status: exit.map(str::to_string),
            })
            .collect();
        lock(&self.state).tasks.insert(handle.to_string(), steps);
    }

    pub fn set_status(&self, id: InstanceId, status: &str) {
        lock(&self.state).containers.insert(id, status.to_string());
    }

    pub fn fail_starts(&self, n: u32) {
        lock(&self.state).failing_starts = n;
    }

    pub fn fail_deletes(&self) {
        lock(&self.state).failing_deletes = true;
    }

    pub fn withhold_address(&self, id: InstanceId) {
        lock(&self.state).no_address.insert(id);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn count_calls(&self, call: &str) -> usize {
        lock(&self.state).calls.iter().filter(|c| *c == call).count()
    }

    pub fn configured(&self, id: InstanceId) -> Option<ConfigureSpec> {
        lock(&self.state).configured.get(&id).cloned()
    }

    fn record(&self, op: &str, id: InstanceId) -> std::sync::MutexGuard<'_, HvState> {
        let mut st = lock(&self.state);
        st.calls.push(format!("{op} {id}"));
        st
    }

    fn transition(&self, op: &str, id: InstanceId, to: Option<&str>) -> HvResult<Option<TaskHandle>> {
        let mut st = self.record(op, id);
        if !st.containers.contains_key(&id) {
            return Err(HypervisorError::NotFound(id));
        }
        if let Some(to) = to {
            st.containers.insert(id, to.to_string());
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl Hypervisor for FakeHypervisor {
    async fn clone_container(&self, spec: &CloneSpec) -> HvResult<Option<TaskHandle>> {
        let mut st = self.record("clone", spec.new_id);
        st.containers.insert(spec.new_id, "stopped".to_string());
        Ok(None)
    }

    async fn configure(&self, spec: &ConfigureSpec) -> HvResult<Option<TaskHandle>> {
        let res = self.transition("configure", spec.id, None);
        if res.is_ok() {
            lock(&self.state).configured.insert(spec.id, spec.clone());
        }
        res
    }

    async fn resize(&self, id: InstanceId, _disk_gib: i32) -> HvResult<Option<TaskHandle>> {
        self.transition("resize", id, None)
    }

    async fn start(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        let mut st = self.record("start", id);
        if st.failing_starts > 0 {
            st.failing_starts -= 1;
            return Err(HypervisorError::Api {
                op: "start",
                status: 500,
                body: "simulated start failure".to_string(),
            });
        }
        if !st.containers.contains_key(&id) {
            return Err(HypervisorError::NotFound(id));
        }
        st.containers.insert(id, "running".to_string());
        Ok(None)
    }

    async fn shutdown(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        self.transition("shutdown", id, Some("stopped"))
    }

    async fn stop(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        self.transition("stop", id, Some("stopped"))
    }

    async fn delete(&self, id: InstanceId) -> HvResult<Option<TaskHandle>> {
        let mut st = self.record("delete", id);
        if st.failing_deletes {
            return Err(HypervisorError::Api {
                op: "delete",
                status: 500,
                body: "simulated delete failure".to_string(),
            });
        }
        match st.containers.remove(&id) {
            Some(_) => Ok(None),
            None => Err(HypervisorError::NotFound(id)),
        }
    }

    async fn task_status(&self, task: &TaskHandle) -> HvResult<TaskStatus> {
        let mut st = lock(&self.state);
        let steps = st
            .tasks
            .get_mut(&task.0)
            .ok_or_else(|| HypervisorError::Other(format!("unable to parse worker upid '{task}'")))?;
        match steps.len() {
            0 => Err(HypervisorError::Other(format!("task {task} has no status"))),
            1 => Ok(steps[0].clone()),
            _ => Ok(steps.pop_front().unwrap()),
        }
    }

    async fn container_status(&self, id: InstanceId) -> HvResult<String> {
        lock(&self.state)
            .containers
            .get(&id)
            .cloned()
            .ok_or(HypervisorError::NotFound(id))
    }

    async fn interfaces(&self, id: InstanceId) -> HvResult<Vec<NetworkInterface>> {
        let st = lock(&self.state);
        if !st.containers.contains_key(&id) {
            return Err(HypervisorError::NotFound(id));
        }
        let mut ifaces = vec![NetworkInterface {
            name: "lo".to_string(),
            addresses: vec!["127.0.0.1/8".to_string()],
        }];
        if !st.no_address.contains(&id) {
            ifaces.push(NetworkInterface {
                name: "eth0".to_string(),
                addresses: vec![format!("10.200.0.{}/24", id % 200 + 10)],
            });
        }
        Ok(ifaces)
    }
}

#[derive(Default)]
struct AgentFakeState {
    script: VecDeque<String>,
    error: Option<String>,
    status_calls: usize,
    status_down: bool,
    reject: Option<(u16, String)>,
    pushed: Vec<Value>,
}

#[derive(Default)]
pub struct FakeAgent {
    state: Mutex<AgentFakeState>,
}

impl FakeAgent {
    /// States returned by successive `/status` calls; the last one repeats.
    pub fn script(&self, states: &[&str]) {
        lock(&self.state).script = states.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_error(&self, message: &str) {
        lock(&self.state).error = Some(message.to_string());
    }

    pub fn reject_config(&self, status: u16, body: &str) {
        lock(&self.state).reject = Some((status, body.to_string()));
    }

    pub fn fail_status(&self) {
        lock(&self.state).status_down = true;
    }

    pub fn status_calls(&self) -> usize {
        lock(&self.state).status_calls
    }

    pub fn pushed(&self) -> Vec<Value> {
        lock(&self.state).pushed.clone()
    }
}

#[async_trait::async_trait]
impl GuestAgent for FakeAgent {
    async fn push_config(&self, _address: &str, payload: &Value) -> Result<(), AgentCallError> {
        let mut st = lock(&self.state);
        st.pushed.push(payload.clone());
        match st.reject.clone() {
            Some((status, body)) => Err(AgentCallError::Http {
                op: "agent /config",
                status,
                body,
            }),
            None => Ok(()),
        }
    }

    async fn status(&self, _address: &str) -> Result<AgentStatus, AgentCallError> {
        let mut st = lock(&self.state);
        st.status_calls += 1;
        if st.status_down {
            return Err(AgentCallError::Http {
                op: "agent /status",
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let state = if st.script.len() > 1 {
            st.script.pop_front().unwrap_or_default()
        } else {
            st.script.front().cloned().unwrap_or_else(|| "idle".to_string())
        };
        Ok(AgentStatus {
            state: AgentState::parse(&state),
            error: st.error.clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeDns {
    records: Mutex<Vec<String>>,
    failing: Mutex<bool>,
}

impl FakeDns {
    /// `"A <fqdn> <ip>"` and `"SRV <owner> <port>"`.
    pub fn records(&self) -> Vec<String> {
        lock(&self.records).clone()
    }

    /// Adds fail from now on.
    pub fn fail_all(&self) {
        *lock(&self.failing) = true;
    }

    fn check(&self, op: &'static str) -> EdgeResult<()> {
        if *lock(&self.failing) {
            return Err(EdgeError::Rejected {
                op,
                message: "simulated dns failure".to_string(),
            });
        }
        Ok(())
    }

    fn upsert(&self, prefix: String, line: String) {
        let mut recs = lock(&self.records);
        recs.retain(|r| !r.starts_with(&prefix));
        recs.push(line);
    }
}

#[async_trait::async_trait]
impl DnsProvider for FakeDns {
    async fn add_address(&self, rec: &AddressRecord) -> EdgeResult<()> {
        self.check("add A")?;
        self.upsert(format!("A {} ", rec.fqdn), format!("A {} {}", rec.fqdn, rec.ip));
        Ok(())
    }

    async fn delete_address(&self, fqdn: &str) -> EdgeResult<()> {
        let prefix = format!("A {fqdn} ");
        lock(&self.records).retain(|r| !r.starts_with(&prefix));
        Ok(())
    }

    async fn add_service(&self, rec: &ServiceRecord) -> EdgeResult<()> {
        self.check("add SRV")?;
        let owner = ServiceRecord::owner_name(&rec.service, rec.transport, &rec.fqdn);
        self.upsert(format!("SRV {owner} "), format!("SRV {owner} {}", rec.port));
        Ok(())
    }

    async fn delete_service(&self, service: &str, transport: Transport, fqdn: &str) -> EdgeResult<()> {
        let prefix = format!("SRV {} ", ServiceRecord::owner_name(service, transport, fqdn));
        lock(&self.records).retain(|r| !r.starts_with(&prefix));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProxy {
    backends: Mutex<Vec<(String, String, u16)>>,
}

impl FakeProxy {
    pub fn registered(&self) -> Vec<(String, String, u16)> {
        lock(&self.backends).clone()
    }
}

#[async_trait::async_trait]
impl ProtocolProxy for FakeProxy {
    async fn register(&self, name: &str, address: &str, port: u16) -> EdgeResult<Registration> {
        let entry = (name.to_string(), address.to_string(), port);
        let mut backends = lock(&self.backends);
        if backends.contains(&entry) {
            return Ok(Registration::DuplicateSkipped);
        }
        backends.push(entry);
        Ok(Registration::Registered)
    }

    async fn unregister(&self, name: &str) -> EdgeResult<()> {
        lock(&self.backends).retain(|(n, _, _)| n != name);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRoutes {
    routes: Mutex<Vec<Route>>,
}

impl FakeRoutes {
    /// Routes currently in place, in write order.
    pub fn written(&self) -> Vec<Route> {
        lock(&self.routes).clone()
    }
}

#[async_trait::async_trait]
impl RouteWriter for FakeRoutes {
    async fn write_route(&self, route: &Route) -> EdgeResult<()> {
        let mut routes = lock(&self.routes);
        routes.retain(|r| !(r.hostname == route.hostname && r.external_port == route.external_port));
        routes.push(route.clone());
        Ok(())
    }

    async fn remove_routes(&self, hostname: &str) -> EdgeResult<usize> {
        let mut routes = lock(&self.routes);
        let before = routes.len();
        routes.retain(|r| r.hostname != hostname);
        Ok(before - routes.len())
    }
}

#[derive(Default, Clone)]
pub struct EdgeFakes {
    pub internal: Arc<FakeDns>,
    pub public: Arc<FakeDns>,
    pub proxy: Arc<FakeProxy>,
    pub routes: Arc<FakeRoutes>,
}

impl EdgeFakes {
    pub fn publisher(&self, settings: &Settings) -> EdgePublisher {
        EdgePublisher::new(
            Arc::new(WorkloadCatalog::builtin()),
            self.internal.clone(),
            self.public.clone(),
            self.proxy.clone(),
            self.routes.clone(),
            settings.edge.clone(),
        )
    }
}
