use std::ops::RangeInclusive;

use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    sea_query::{Expr, OnConflict},
};
use zlh_db::entities::port_pool;
use zlh_model::{InstanceId, PortStatus};

use crate::error::{ProvisionError, Result};
use crate::retry::RetryPolicy;
use crate::store::{self, now};

/// Free → reserved → allocated → free, scoped to an owning identifier.
#[derive(Clone)]
pub struct PortAllocator {
    db: DatabaseConnection,
    retry: RetryPolicy,
}

impl PortAllocator {
    pub fn new(db: DatabaseConnection, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Reserves the lowest `count` free ports of `class` for `owner`. All or
    /// nothing: on any shortfall the transaction is dropped uncommitted.
    pub async fn reserve(&self, class: &str, count: usize, owner: InstanceId) -> Result<Vec<i32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.retry
            .run(
                "port reserve",
                |_| self.reserve_once(class, count, owner),
                store::is_retryable,
            )
            .await
    }

    async fn reserve_once(&self, class: &str, count: usize, owner: InstanceId) -> Result<Vec<i32>> {
        let txn = store::begin_serializable(&self.db).await?;

        let free = port_pool::Entity::find()
            .filter(port_pool::Column::Class.eq(class))
            .filter(port_pool::Column::Status.eq(PortStatus::Free.as_str()))
            .order_by_asc(port_pool::Column::Port)
            .limit(count as u64)
            .all(&txn)
            .await?;

        if free.len() < count {
            return Err(ProvisionError::InsufficientPorts {
                class: class.to_string(),
                requested: count,
                available: free.len(),
            });
        }

        let ports: Vec<i32> = free.iter().map(|p| p.port).collect();
        let flipped = port_pool::Entity::update_many()
            .col_expr(port_pool::Column::Status, Expr::value(PortStatus::Reserved.as_str()))
            .col_expr(port_pool::Column::OwnerId, Expr::value(owner))
            .col_expr(port_pool::Column::UpdatedAt, Expr::value(now()))
            .filter(port_pool::Column::Port.is_in(ports.clone()))
            .filter(port_pool::Column::Status.eq(PortStatus::Free.as_str()))
            .exec(&txn)
            .await?;

        if flipped.rows_affected != count as u64 {
            // Someone else took a port between select and update; retry.
            return Err(ProvisionError::Store(sea_orm::DbErr::Custom(format!(
                "could not serialize port reservation ({} of {count} flipped)",
                flipped.rows_affected
            ))));
        }

        txn.commit().await?;
        tracing::info!(instance_id = owner, class, ?ports, "ports reserved");
        Ok(ports)
    }

    /// Reserved ports owned by `owner` become allocated. Ports that are
    /// already allocated are left as they are.
    pub async fn commit(&self, owner: InstanceId, ports: &[i32], class: &str) -> Result<()> {
        if ports.is_empty() {
            return Ok(());
        }
        let res = port_pool::Entity::update_many()
            .col_expr(port_pool::Column::Status, Expr::value(PortStatus::Allocated.as_str()))
            .col_expr(port_pool::Column::UpdatedAt, Expr::value(now()))
            .filter(port_pool::Column::OwnerId.eq(owner))
            .filter(port_pool::Column::Class.eq(class))
            .filter(port_pool::Column::Port.is_in(ports.to_vec()))
            .filter(port_pool::Column::Status.eq(PortStatus::Reserved.as_str()))
            .exec(&self.db)
            .await?;
        tracing::info!(instance_id = owner, ?ports, committed = res.rows_affected, "ports allocated");
        Ok(())
    }

    /// Returns every port owned by `owner` to the pool. Safe to repeat.
    pub async fn release_by_owner(&self, owner: InstanceId) -> Result<u64> {
        let res = port_pool::Entity::update_many()
            .col_expr(port_pool::Column::Status, Expr::value(PortStatus::Free.as_str()))
            .col_expr(port_pool::Column::OwnerId, Expr::value(Option::<i32>::None))
            .col_expr(port_pool::Column::UpdatedAt, Expr::value(now()))
            .filter(port_pool::Column::OwnerId.eq(owner))
            .exec(&self.db)
            .await?;
        if res.rows_affected > 0 {
            tracing::info!(instance_id = owner, released = res.rows_affected, "ports released");
        }
        Ok(res.rows_affected)
    }

    /// Inserts a free entry for every port in `range` that does not exist yet.
    pub async fn seed(&self, class: &str, range: RangeInclusive<i32>) -> Result<u64> {
        let mut inserted = 0u64;
        let ports: Vec<i32> = range.collect();
        for chunk in ports.chunks(500) {
            let rows = chunk.iter().map(|&port| port_pool::ActiveModel {
                port: Set(port),
                class: Set(class.to_string()),
                status: Set(PortStatus::Free.as_str().to_string()),
                owner_id: Set(None),
                updated_at: Set(now()),
                ..Default::default()
            });
            inserted += port_pool::Entity::insert_many(rows)
                .on_conflict(
                    OnConflict::column(port_pool::Column::Port)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await?;
        }
        tracing::info!(class, inserted, "port pool seeded");
        Ok(inserted)
    }

    pub async fn owned_by(&self, owner: InstanceId) -> Result<Vec<port_pool::Model>> {
        Ok(port_pool::Entity::find()
            .filter(port_pool::Column::OwnerId.eq(owner))
            .order_by_asc(port_pool::Column::Port)
            .all(&self.db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    async fn pool(range: RangeInclusive<i32>) -> (DatabaseConnection, PortAllocator) {
        let db = testing::memory_db().await;
        let ports = PortAllocator::new(db.clone(), testing::fast_settings().store_retry);
        ports.seed("game", range).await.unwrap();
        (db, ports)
    }

    async fn snapshot(db: &DatabaseConnection) -> Vec<(i32, String, Option<i32>)> {
        port_pool::Entity::find()
            .order_by_asc(port_pool::Column::Port)
            .all(db)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.port, p.status, p.owner_id))
            .collect()
    }

    #[tokio::test]
    async fn seed_is_idempotent() {
        let (db, ports) = pool(50000..=50004).await;
        assert_eq!(ports.seed("game", 50000..=50009).await.unwrap(), 5);
        assert_eq!(snapshot(&db).await.len(), 10);
    }

    #[tokio::test]
    async fn reserve_takes_lowest_free_ports() {
        let (db, ports) = pool(50000..=50009).await;
        let first = ports.reserve("game", 2, 5001).await.unwrap();
        assert_eq!(first, vec![50000, 50001]);
        let second = ports.reserve("game", 3, 5002).await.unwrap();
        assert_eq!(second, vec![50002, 50003, 50004]);

        let snap = snapshot(&db).await;
        assert_eq!(snap[0], (50000, "reserved".to_string(), Some(5001)));
        assert_eq!(snap[4], (50004, "reserved".to_string(), Some(5002)));
        assert_eq!(snap[5], (50005, "free".to_string(), None));
    }

    #[tokio::test]
    async fn reserve_is_all_or_nothing() {
        let (db, ports) = pool(50000..=50002).await;
        ports.reserve("game", 2, 5001).await.unwrap();
        let before = snapshot(&db).await;

        let err = ports.reserve("game", 2, 5002).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InsufficientPorts { requested: 2, available: 1, .. }
        ));
        assert_eq!(snapshot(&db).await, before);
    }

    #[tokio::test]
    async fn zero_ports_touches_nothing() {
        let (db, ports) = pool(50000..=50002).await;
        let before = snapshot(&db).await;
        assert!(ports.reserve("game", 0, 5001).await.unwrap().is_empty());
        ports.commit(5001, &[], "game").await.unwrap();
        assert_eq!(snapshot(&db).await, before);
    }

    #[tokio::test]
    async fn commit_flips_reserved_to_allocated_idempotently() {
        let (_db, ports) = pool(50000..=50004).await;
        let got = ports.reserve("game", 2, 5001).await.unwrap();
        ports.commit(5001, &got, "game").await.unwrap();
        ports.commit(5001, &got, "game").await.unwrap();
        let owned = ports.owned_by(5001).await.unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|p| p.status == "allocated"));
    }

    #[tokio::test]
    async fn commit_ignores_ports_of_other_owners() {
        let (_db, ports) = pool(50000..=50004).await;
        let mine = ports.reserve("game", 1, 5001).await.unwrap();
        let theirs = ports.reserve("game", 1, 5002).await.unwrap();
        ports.commit(5001, &[mine[0], theirs[0]], "game").await.unwrap();
        assert_eq!(ports.owned_by(5002).await.unwrap()[0].status, "reserved");
    }

    #[tokio::test]
    async fn release_by_owner_is_idempotent() {
        let (db, ports) = pool(50000..=50004).await;
        let got = ports.reserve("game", 3, 5001).await.unwrap();
        ports.commit(5001, &got[..1], "game").await.unwrap();

        assert_eq!(ports.release_by_owner(5001).await.unwrap(), 3);
        let once = snapshot(&db).await;
        assert_eq!(ports.release_by_owner(5001).await.unwrap(), 0);
        assert_eq!(snapshot(&db).await, once);
        assert!(once.iter().all(|(_, s, o)| s == "free" && o.is_none()));
    }

    #[tokio::test]
    async fn release_without_ports_is_noop() {
        let (_db, ports) = pool(50000..=50001).await;
        assert_eq!(ports.release_by_owner(9999).await.unwrap(), 0);
    }
}
