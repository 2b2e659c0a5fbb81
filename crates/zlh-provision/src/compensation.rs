//! Undo actions collected while a provisioning saga runs.

use sea_orm::{DatabaseConnection, EntityTrait};
use zlh_db::entities::instances;
use zlh_model::InstanceId;

use crate::edge::{EdgePublisher, EdgeTarget};
use crate::identifiers::IdentifierAllocator;
use crate::lifecycle::LifecycleDriver;
use crate::ports::PortAllocator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    Unpublish(EdgeTarget),
    DeleteInstanceRecord(InstanceId),
    ReleasePorts(InstanceId),
    DeleteContainer(InstanceId),
    ReleaseIdentifier(InstanceId),
}

impl Compensation {
    /// Execution order; lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Compensation::Unpublish(_) => 0,
            Compensation::DeleteInstanceRecord(_) => 1,
            Compensation::ReleasePorts(_) => 2,
            Compensation::DeleteContainer(_) => 3,
            Compensation::ReleaseIdentifier(_) => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compensation::Unpublish(_) => "unpublish",
            Compensation::DeleteInstanceRecord(_) => "delete_instance_record",
            Compensation::ReleasePorts(_) => "release_ports",
            Compensation::DeleteContainer(_) => "delete_container",
            Compensation::ReleaseIdentifier(_) => "release_identifier",
        }
    }
}

/// The collaborators an undo action may touch.
#[derive(Clone)]
pub struct Compensators {
    pub db: DatabaseConnection,
    pub ids: IdentifierAllocator,
    pub ports: PortAllocator,
    pub driver: LifecycleDriver,
    pub publisher: EdgePublisher,
}

impl Compensators {
    async fn apply(&self, step: &Compensation) -> Result<(), String> {
        match step {
            Compensation::Unpublish(target) => {
                let report = self.publisher.unpublish(target).await;
                match report.failures().count() {
                    0 => Ok(()),
                    n => Err(format!("{n} edge step(s) failed")),
                }
            }
            Compensation::DeleteInstanceRecord(id) => instances::Entity::delete_by_id(*id)
                .exec(&self.db)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Compensation::ReleasePorts(id) => self
                .ports
                .release_by_owner(*id)
                .await
                .map(|n| tracing::debug!(instance_id = *id, released = n, "ports released"))
                .map_err(|e| e.to_string()),
            Compensation::DeleteContainer(id) => {
                self.driver.delete(*id).await.map_err(|e| e.to_string())
            }
            Compensation::ReleaseIdentifier(id) => {
                self.ids.release(*id).await.map_err(|e| e.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct CompensationList {
    steps: Vec<Compensation>,
}

impl CompensationList {
    /// Registering the same action twice keeps one copy.
    pub fn push(&mut self, step: Compensation) {
        if !self.steps.contains(&step) {
            self.steps.push(step);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every registered action in rank order. Failures are logged and
    /// never stop the remaining actions. Returns the names that ran.
    pub async fn run(mut self, with: &Compensators) -> Vec<&'static str> {
        self.steps.sort_by_key(Compensation::rank);
        let mut ran = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            match with.apply(step).await {
                Ok(()) => tracing::info!(step = step.name(), "compensation applied"),
                Err(error) => tracing::warn!(step = step.name(), %error, "compensation failed"),
            }
            ran.push(step.name());
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sea_orm::EntityTrait;

    use super::*;
    use crate::testing::{self, EdgeFakes, FakeHypervisor};

    async fn compensators(hv: Arc<FakeHypervisor>) -> Compensators {
        let db = testing::memory_db().await;
        let settings = testing::fast_settings();
        Compensators {
            ids: IdentifierAllocator::new(db.clone(), settings.identifiers.clone(), settings.store_retry),
            ports: PortAllocator::new(db.clone(), settings.store_retry),
            driver: LifecycleDriver::new(hv, settings.hypervisor.clone()),
            publisher: EdgeFakes::default().publisher(&settings),
            db,
        }
    }

    #[tokio::test]
    async fn runs_in_rank_order_regardless_of_registration() {
        let hv = Arc::new(FakeHypervisor::default());
        let c = compensators(hv).await;
        let mut list = CompensationList::default();
        list.push(Compensation::ReleaseIdentifier(5001));
        list.push(Compensation::DeleteContainer(5001));
        list.push(Compensation::ReleasePorts(5001));
        list.push(Compensation::DeleteInstanceRecord(5001));
        list.push(Compensation::ReleasePorts(5001));

        let ran = list.run(&c).await;
        assert_eq!(
            ran,
            vec!["delete_instance_record", "release_ports", "delete_container", "release_identifier"]
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let hv = Arc::new(FakeHypervisor::default());
        hv.set_status(5001, "stopped");
        hv.fail_deletes();
        let c = compensators(hv.clone()).await;
        testing::insert_instance(&c.db, 5001, "mc-5001").await;
        c.ports.seed("game", 50000..=50003).await.unwrap();
        c.ports.reserve("game", 2, 5001).await.unwrap();

        let mut list = CompensationList::default();
        list.push(Compensation::DeleteInstanceRecord(5001));
        list.push(Compensation::ReleasePorts(5001));
        list.push(Compensation::DeleteContainer(5001));
        list.push(Compensation::ReleaseIdentifier(5001));
        let ran = list.run(&c).await;

        assert_eq!(ran.len(), 4);
        assert_eq!(hv.count_calls("delete 5001"), 1);
        assert!(c.ports.owned_by(5001).await.unwrap().is_empty());
        assert!(instances::Entity::find_by_id(5001).one(&c.db).await.unwrap().is_none());
    }
}
