//! Decommissioning a delivered instance: archive, free, unpublish, delete.

use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, sea_query::OnConflict,
};
use serde::Serialize;
use uuid::Uuid;
use zlh_db::entities::{archived_instances, instances};
use zlh_model::{InstanceClass, InstanceId};

use crate::edge::{EdgePublisher, EdgeTarget};
use crate::error::{ProvisionError, Result};
use crate::lifecycle::LifecycleDriver;
use crate::ports::PortAllocator;
use crate::publish_queue;
use crate::store::now;

/// Where the teardown found its facts about the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownSource {
    Instance,
    Archive,
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    pub identifier: InstanceId,
    pub source: TeardownSource,
    pub archived: bool,
    pub publish_jobs_cancelled: u64,
    pub ports_released: u64,
    pub container_deleted: bool,
    pub unpublished: bool,
    pub edge_failures: Vec<String>,
    pub record_deleted: bool,
}

impl TeardownReport {
    fn new(identifier: InstanceId, source: TeardownSource) -> Self {
        Self {
            identifier,
            source,
            archived: false,
            publish_jobs_cancelled: 0,
            ports_released: 0,
            container_deleted: false,
            unpublished: false,
            edge_failures: Vec::new(),
            record_deleted: false,
        }
    }
}

fn workload_of(class: &str, game: Option<&str>, runtime: Option<&str>) -> (InstanceClass, String) {
    let class = InstanceClass::parse_lenient(Some(class));
    let workload = match class {
        InstanceClass::Dev => runtime,
        InstanceClass::Game => game,
    };
    (class, workload.unwrap_or_default().to_string())
}

fn ports_of(v: &serde_json::Value) -> Vec<i32> {
    serde_json::from_value(v.clone()).unwrap_or_default()
}

#[derive(Clone)]
pub struct Decommissioner {
    db: DatabaseConnection,
    ports: PortAllocator,
    driver: LifecycleDriver,
    publisher: EdgePublisher,
}

impl Decommissioner {
    pub fn new(
        db: DatabaseConnection,
        ports: PortAllocator,
        driver: LifecycleDriver,
        publisher: EdgePublisher,
    ) -> Self {
        Self {
            db,
            ports,
            driver,
            publisher,
        }
    }

    pub async fn decommission(&self, id: InstanceId, force: bool) -> Result<TeardownReport> {
        if let Some(row) = instances::Entity::find_by_id(id).one(&self.db).await? {
            return self.from_instance(row, force).await;
        }
        let archived = archived_instances::Entity::find()
            .filter(archived_instances::Column::InstanceId.eq(id))
            .one(&self.db)
            .await?;
        match archived {
            Some(a) => self.from_archive(a).await,
            None => self.orphan(id).await,
        }
    }

    async fn from_instance(&self, row: instances::Model, force: bool) -> Result<TeardownReport> {
        let id = row.id;
        if !force && self.driver.is_running(id).await? {
            return Err(ProvisionError::StillRunning { id });
        }
        tracing::info!(instance_id = id, hostname = %row.hostname, force, "decommissioning instance");

        let mut report = TeardownReport::new(id, TeardownSource::Instance);
        report.archived = self.archive(&row).await?;
        report.publish_jobs_cancelled = publish_queue::cancel_for_instance(&self.db, id).await?;
        report.ports_released = self.ports.release_by_owner(id).await?;
        report.container_deleted = self.delete_container(id).await;

        let (class, workload) = workload_of(&row.class, row.game.as_deref(), row.runtime.as_deref());
        self.unpublish(
            &mut report,
            EdgeTarget {
                instance_id: id,
                hostname: row.hostname.clone(),
                class,
                workload,
                address: row.address.clone(),
                ports: ports_of(&row.ports),
            },
        )
        .await;

        let res = instances::Entity::delete_by_id(id).exec(&self.db).await?;
        report.record_deleted = res.rows_affected > 0;
        tracing::info!(instance_id = id, "instance decommissioned");
        Ok(report)
    }

    async fn from_archive(&self, a: archived_instances::Model) -> Result<TeardownReport> {
        let id = a.instance_id;
        tracing::info!(instance_id = id, "instance already archived; finishing teardown");
        let mut report = TeardownReport::new(id, TeardownSource::Archive);
        report.archived = true;
        report.publish_jobs_cancelled = publish_queue::cancel_for_instance(&self.db, id).await?;
        report.ports_released = self.ports.release_by_owner(id).await?;
        report.container_deleted = self.delete_container(id).await;

        let (class, workload) = workload_of(&a.class, a.game.as_deref(), a.runtime.as_deref());
        self.unpublish(
            &mut report,
            EdgeTarget {
                instance_id: id,
                hostname: a.hostname.clone(),
                class,
                workload,
                address: a.address.clone(),
                ports: ports_of(&a.ports),
            },
        )
        .await;
        Ok(report)
    }

    async fn orphan(&self, id: InstanceId) -> Result<TeardownReport> {
        tracing::info!(instance_id = id, "no record found; cleaning orphan resources");
        let mut report = TeardownReport::new(id, TeardownSource::Orphan);
        report.publish_jobs_cancelled = publish_queue::cancel_for_instance(&self.db, id).await?;
        report.ports_released = self.ports.release_by_owner(id).await?;
        report.container_deleted = self.delete_container(id).await;
        Ok(report)
    }

    /// Inserting an archive row twice for one instance is a no-op.
    async fn archive(&self, row: &instances::Model) -> Result<bool> {
        let archive = archived_instances::ActiveModel {
            id: Set(Uuid::new_v4()),
            instance_id: Set(row.id),
            customer_id: Set(row.customer_id.clone()),
            class: Set(row.class.clone()),
            game: Set(row.game.clone()),
            variant: Set(row.variant.clone()),
            runtime: Set(row.runtime.clone()),
            version: Set(row.version.clone()),
            address: Set(row.address.clone()),
            ports: Set(row.ports.clone()),
            hostname: Set(row.hostname.clone()),
            payload: Set(row.payload.clone()),
            reason: Set("decommission".to_string()),
            archived_at: Set(now()),
        };
        let inserted = archived_instances::Entity::insert(archive)
            .on_conflict(
                OnConflict::column(archived_instances::Column::InstanceId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        if inserted == 0 {
            tracing::debug!(instance_id = row.id, "archive already present");
        }
        Ok(true)
    }

    async fn delete_container(&self, id: InstanceId) -> bool {
        match self.driver.delete(id).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(instance_id = id, error = %err, "container delete failed");
                false
            }
        }
    }

    async fn unpublish(&self, report: &mut TeardownReport, target: EdgeTarget) {
        if target.hostname.trim().is_empty() {
            return;
        }
        let edge = self.publisher.unpublish(&target).await;
        report.unpublished = true;
        report.edge_failures = edge
            .failures()
            .map(|s| format!("{}: {}", s.step, s.error.as_deref().unwrap_or_default()))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{self, EdgeFakes, FakeHypervisor};

    struct Harness {
        db: DatabaseConnection,
        hv: Arc<FakeHypervisor>,
        ports: PortAllocator,
        fakes: EdgeFakes,
        decom: Decommissioner,
    }

    async fn harness() -> Harness {
        let db = testing::memory_db().await;
        let settings = testing::fast_settings();
        let hv = Arc::new(FakeHypervisor::default());
        let fakes = EdgeFakes::default();
        let ports = PortAllocator::new(db.clone(), settings.store_retry);
        let decom = Decommissioner::new(
            db.clone(),
            ports.clone(),
            LifecycleDriver::new(hv.clone(), settings.hypervisor.clone()),
            fakes.publisher(&settings),
        );
        Harness {
            db,
            hv,
            ports,
            fakes,
            decom,
        }
    }

    #[tokio::test]
    async fn running_container_needs_force() {
        let h = harness().await;
        testing::insert_instance(&h.db, 5001, "mc-5001").await;
        h.hv.set_status(5001, "running");

        let err = h.decom.decommission(5001, false).await.unwrap_err();
        assert!(matches!(err, ProvisionError::StillRunning { id: 5001 }));
        assert!(instances::Entity::find_by_id(5001).one(&h.db).await.unwrap().is_some());
        assert!(h.hv.calls().is_empty());
    }

    #[tokio::test]
    async fn forced_teardown_archives_and_frees_everything() {
        let h = harness().await;
        testing::insert_instance(&h.db, 5001, "mc-5001").await;
        h.hv.set_status(5001, "running");
        h.ports.seed("game", 50000..=50002).await.unwrap();
        h.ports.reserve("game", 2, 5001).await.unwrap();

        let report = h.decom.decommission(5001, true).await.unwrap();
        assert_eq!(report.source, TeardownSource::Instance);
        assert!(report.archived && report.container_deleted && report.record_deleted);
        assert_eq!(report.ports_released, 2);
        assert!(report.edge_failures.is_empty());
        assert_eq!(h.hv.calls(), vec!["stop 5001", "delete 5001"]);
        assert!(h.ports.owned_by(5001).await.unwrap().is_empty());
        assert!(instances::Entity::find_by_id(5001).one(&h.db).await.unwrap().is_none());
        assert!(h.fakes.internal.records().is_empty());

        let archived = archived_instances::Entity::find().all(&h.db).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].instance_id, 5001);
    }

    #[tokio::test]
    async fn second_call_finishes_from_archive() {
        let h = harness().await;
        testing::insert_instance(&h.db, 5001, "mc-5001").await;
        h.hv.set_status(5001, "stopped");
        h.decom.decommission(5001, false).await.unwrap();

        let again = h.decom.decommission(5001, false).await.unwrap();
        assert_eq!(again.source, TeardownSource::Archive);
        assert!(again.container_deleted);
        assert_eq!(archived_instances::Entity::find().all(&h.db).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn orphan_ports_are_released() {
        let h = harness().await;
        h.ports.seed("game", 50000..=50001).await.unwrap();
        h.ports.reserve("game", 1, 5099).await.unwrap();

        let report = h.decom.decommission(5099, false).await.unwrap();
        assert_eq!(report.source, TeardownSource::Orphan);
        assert_eq!(report.ports_released, 1);
        assert!(report.container_deleted);
        assert!(!report.unpublished);
    }
}
