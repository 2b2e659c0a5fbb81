use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, sea_query::OnConflict,
};
use zlh_db::entities::{identifier_counters, instances};
use zlh_model::{InstanceClass, InstanceId};

use crate::config::IdentifierRanges;
use crate::error::{ProvisionError, Result};
use crate::retry::RetryPolicy;
use crate::store::{self, now};

/// Next cursor value, wrapping `max + 1` back to `min`.
fn advance(current: i32, min: i32, max: i32) -> i32 {
    if current < min || current >= max {
        min
    } else {
        current + 1
    }
}

#[derive(Clone)]
pub struct IdentifierAllocator {
    db: DatabaseConnection,
    ranges: IdentifierRanges,
    retry: RetryPolicy,
}

impl IdentifierAllocator {
    pub fn new(db: DatabaseConnection, ranges: IdentifierRanges, retry: RetryPolicy) -> Self {
        Self { db, ranges, retry }
    }

    pub async fn allocate(&self, class: InstanceClass) -> Result<InstanceId> {
        let range = self.ranges.for_class(class);
        let (min, max) = (*range.start(), *range.end());
        self.retry
            .run(
                "identifier allocate",
                |_| self.allocate_once(class, min, max),
                store::is_retryable,
            )
            .await
    }

    async fn allocate_once(&self, class: InstanceClass, min: i32, max: i32) -> Result<InstanceId> {
        let txn = store::begin_serializable(&self.db).await?;

        identifier_counters::Entity::insert(identifier_counters::ActiveModel {
            class: Set(class.as_str().to_string()),
            current: Set(min - 1),
            updated_at: Set(now()),
        })
        .on_conflict(
            OnConflict::column(identifier_counters::Column::Class)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

        let counter = identifier_counters::Entity::find_by_id(class.as_str().to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ProvisionError::Store(sea_orm::DbErr::RecordNotFound(format!(
                    "identifier counter for {class}"
                )))
            })?;

        let span = (max - min + 1).max(0) as u32;
        let mut cursor = counter.current;
        for _ in 0..span {
            cursor = advance(cursor, min, max);
            if !Self::in_use(&txn, cursor).await? {
                let mut active: identifier_counters::ActiveModel = counter.into();
                active.current = Set(cursor);
                active.updated_at = Set(now());
                active.update(&txn).await?;
                txn.commit().await?;
                tracing::debug!(%class, instance_id = cursor, "identifier allocated");
                return Ok(cursor);
            }
        }

        Err(ProvisionError::RangeExhausted { class, min, max })
    }

    async fn in_use<C: ConnectionTrait>(conn: &C, id: InstanceId) -> Result<bool> {
        let n = instances::Entity::find()
            .filter(instances::Column::Id.eq(id))
            .count(conn)
            .await?;
        Ok(n > 0)
    }

    /// Identifiers are not reclaimed eagerly; the cursor moves past them and
    /// probing skips live instances on wraparound.
    pub async fn release(&self, id: InstanceId) -> Result<()> {
        tracing::debug!(instance_id = id, "identifier release (no-op)");
        Ok(())
    }

    pub async fn confirm(&self, id: InstanceId) -> Result<()> {
        tracing::debug!(instance_id = id, "identifier confirmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::collections::HashSet;

    fn allocator(db: DatabaseConnection, game: std::ops::RangeInclusive<i32>) -> IdentifierAllocator {
        IdentifierAllocator::new(
            db,
            IdentifierRanges {
                game,
                dev: 6000..=6999,
            },
            testing::fast_settings().store_retry,
        )
    }

    #[test]
    fn advance_wraps_to_min() {
        assert_eq!(advance(4999, 5000, 5999), 5000);
        assert_eq!(advance(5000, 5000, 5999), 5001);
        assert_eq!(advance(5999, 5000, 5999), 5000);
    }

    #[tokio::test]
    async fn first_allocation_starts_at_range_min() {
        let db = testing::memory_db().await;
        let ids = allocator(db, 5000..=5999);
        assert_eq!(ids.allocate(InstanceClass::Game).await.unwrap(), 5000);
        assert_eq!(ids.allocate(InstanceClass::Game).await.unwrap(), 5001);
        assert_eq!(ids.allocate(InstanceClass::Dev).await.unwrap(), 6000);
    }

    #[tokio::test]
    async fn skips_identifiers_held_by_live_instances() {
        let db = testing::memory_db().await;
        testing::insert_instance(&db, 5000, "mc-5000").await;
        testing::insert_instance(&db, 5001, "mc-5001").await;
        let ids = allocator(db, 5000..=5999);
        assert_eq!(ids.allocate(InstanceClass::Game).await.unwrap(), 5002);
    }

    #[tokio::test]
    async fn wraps_and_reports_exhaustion() {
        let db = testing::memory_db().await;
        let ids = allocator(db.clone(), 5000..=5002);
        assert_eq!(ids.allocate(InstanceClass::Game).await.unwrap(), 5000);
        assert_eq!(ids.allocate(InstanceClass::Game).await.unwrap(), 5001);
        assert_eq!(ids.allocate(InstanceClass::Game).await.unwrap(), 5002);
        // Wraps: 5000 is free again because nothing persisted an instance.
        assert_eq!(ids.allocate(InstanceClass::Game).await.unwrap(), 5000);

        for id in 5000..=5002 {
            testing::insert_instance(&db, id, &format!("game-{id}")).await;
        }
        let err = ids.allocate(InstanceClass::Game).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::RangeExhausted { min: 5000, max: 5002, .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_allocations_are_unique() {
        let db = testing::memory_db().await;
        let ids = allocator(db, 5000..=5999);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                ids.allocate(InstanceClass::Game).await.unwrap()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen.len(), 20);
    }
}
