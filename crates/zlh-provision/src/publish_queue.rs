//! Durable retry queue for edge publication.

use std::time::Duration;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
    sea_query::{Expr, SimpleExpr},
};
use uuid::Uuid;
use zlh_db::entities::{instances, publish_jobs};
use zlh_model::{InstanceClass, InstanceId};

use crate::config::PublishSettings;
use crate::edge::{EdgePublisher, EdgeTarget};
use crate::error::{ProvisionError, Result};
use crate::ports::PortAllocator;
use crate::store::now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Published,
    Rescheduled { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
    /// The instance was torn down before the job ran.
    Cancelled,
}

const CLAIM_BATCH: u64 = 16;

fn held_by(token: Option<Uuid>) -> SimpleExpr {
    match token {
        Some(t) => publish_jobs::Column::ClaimToken.eq(t),
        None => publish_jobs::Column::ClaimToken.is_null(),
    }
}

/// Ends every unfinished job for `instance_id`. A worker still running one
/// of them loses its claim and its result is discarded.
pub async fn cancel_for_instance(db: &DatabaseConnection, instance_id: InstanceId) -> Result<u64> {
    let ts = now();
    let res = publish_jobs::Entity::update_many()
        .col_expr(publish_jobs::Column::State, Expr::value(JobState::Cancelled.as_str()))
        .col_expr(publish_jobs::Column::LastError, Expr::value("instance decommissioned"))
        .col_expr(publish_jobs::Column::FinishedAt, Expr::value(ts))
        .col_expr(publish_jobs::Column::UpdatedAt, Expr::value(ts))
        .filter(publish_jobs::Column::InstanceId.eq(instance_id))
        .filter(
            publish_jobs::Column::State
                .is_in([JobState::Pending.as_str(), JobState::Running.as_str()]),
        )
        .exec(db)
        .await?;
    if res.rows_affected > 0 {
        tracing::info!(instance_id, cancelled = res.rows_affected, "publish jobs cancelled");
    }
    Ok(res.rows_affected)
}

#[derive(Clone)]
pub struct PublishQueue {
    db: DatabaseConnection,
    publisher: EdgePublisher,
    ports: PortAllocator,
    port_class: String,
    settings: PublishSettings,
}

impl PublishQueue {
    pub fn new(
        db: DatabaseConnection,
        publisher: EdgePublisher,
        ports: PortAllocator,
        port_class: String,
        settings: PublishSettings,
    ) -> Self {
        Self {
            db,
            publisher,
            ports,
            port_class,
            settings,
        }
    }

    pub async fn enqueue(&self, target: &EdgeTarget) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let ts = now();
        publish_jobs::ActiveModel {
            id: Set(id),
            instance_id: Set(target.instance_id),
            hostname: Set(target.hostname.clone()),
            workload: Set(target.workload.clone()),
            class: Set(target.class.as_str().to_string()),
            address: Set(target.address.clone()),
            ports: Set(serde_json::json!(target.ports)),
            state: Set(JobState::Pending.as_str().to_string()),
            attempt_count: Set(0),
            last_error: Set(None),
            next_attempt_at: Set(ts),
            created_at: Set(ts),
            updated_at: Set(ts),
            finished_at: Set(None),
            claim_token: Set(None),
            leased_until: Set(None),
        }
        .insert(&self.db)
        .await?;
        tracing::info!(instance_id = target.instance_id, job_id = %id, "publish job queued");
        Ok(id)
    }

    /// Moves due pending jobs, and running jobs whose lease ran out, to
    /// running under a fresh claim token. A job another worker claimed first
    /// is skipped.
    pub async fn claim_due(&self) -> Result<Vec<publish_jobs::Model>> {
        let ts = now();
        let due = publish_jobs::Entity::find()
            .filter(
                Condition::any()
                    .add(
                        Condition::all()
                            .add(publish_jobs::Column::State.eq(JobState::Pending.as_str()))
                            .add(publish_jobs::Column::NextAttemptAt.lte(ts)),
                    )
                    .add(
                        Condition::all()
                            .add(publish_jobs::Column::State.eq(JobState::Running.as_str()))
                            .add(publish_jobs::Column::LeasedUntil.lte(ts)),
                    ),
            )
            .order_by_asc(publish_jobs::Column::NextAttemptAt)
            .limit(CLAIM_BATCH)
            .all(&self.db)
            .await?;

        let leased_until = ts + chrono::Duration::from_std(self.settings.lease).unwrap_or_default();
        let mut claimed = Vec::with_capacity(due.len());
        for mut job in due {
            let token = Uuid::new_v4();
            let res = publish_jobs::Entity::update_many()
                .col_expr(publish_jobs::Column::State, Expr::value(JobState::Running.as_str()))
                .col_expr(publish_jobs::Column::ClaimToken, Expr::value(token))
                .col_expr(publish_jobs::Column::LeasedUntil, Expr::value(leased_until))
                .col_expr(publish_jobs::Column::UpdatedAt, Expr::value(ts))
                .filter(publish_jobs::Column::Id.eq(job.id))
                .filter(publish_jobs::Column::State.eq(job.state.clone()))
                .filter(held_by(job.claim_token))
                .exec(&self.db)
                .await?;
            if res.rows_affected != 1 {
                continue;
            }
            if job.state == JobState::Running.as_str() {
                tracing::warn!(
                    job_id = %job.id,
                    instance_id = job.instance_id,
                    "publish job lease expired; reclaimed"
                );
            }
            job.state = JobState::Running.as_str().to_string();
            job.claim_token = Some(token);
            job.leased_until = Some(leased_until);
            claimed.push(job);
        }
        Ok(claimed)
    }

    fn target_for(job: &publish_jobs::Model, row: &instances::Model) -> EdgeTarget {
        EdgeTarget {
            instance_id: job.instance_id,
            hostname: job.hostname.clone(),
            class: InstanceClass::parse_lenient(Some(&job.class)),
            workload: job.workload.clone(),
            address: job.address.clone().or_else(|| row.address.clone()),
            ports: serde_json::from_value(job.ports.clone()).unwrap_or_default(),
        }
    }

    /// `Ok(false)` when the instance no longer exists.
    async fn attempt(&self, job: &publish_jobs::Model) -> Result<bool> {
        let Some(row) = instances::Entity::find_by_id(job.instance_id)
            .one(&self.db)
            .await?
        else {
            return Ok(false);
        };
        let target = Self::target_for(job, &row);
        self.publisher.publish(&target).await?;
        self.ports
            .commit(target.instance_id, &target.ports, &self.port_class)
            .await?;
        Ok(true)
    }

    /// Runs one claimed job and records the result, unless the claim was lost
    /// to cancellation or lease expiry in the meantime.
    pub async fn process(&self, job: publish_jobs::Model) -> Result<JobOutcome> {
        let attempt = u32::try_from(job.attempt_count).unwrap_or(0) + 1;
        let result = self.attempt(&job).await;

        let mut update: publish_jobs::ActiveModel = job.clone().into();
        update.attempt_count = Set(attempt as i32);
        update.updated_at = Set(now());
        update.claim_token = Set(None);
        update.leased_until = Set(None);

        let outcome = match result {
            Ok(true) => {
                update.state = Set(JobState::Done.as_str().to_string());
                update.last_error = Set(None);
                update.finished_at = Set(Some(now()));
                tracing::info!(instance_id = job.instance_id, attempt, "edge published");
                JobOutcome::Published
            }
            Ok(false) => {
                update.state = Set(JobState::Cancelled.as_str().to_string());
                update.last_error = Set(Some("instance no longer exists".to_string()));
                update.finished_at = Set(Some(now()));
                tracing::info!(instance_id = job.instance_id, "instance gone; publish job cancelled");
                JobOutcome::Cancelled
            }
            Err(err) if attempt < self.settings.retry.max_attempts => {
                let delay = self.settings.retry.delay(attempt);
                update.state = Set(JobState::Pending.as_str().to_string());
                update.last_error = Set(Some(err.to_string()));
                update.next_attempt_at = Set(now() + chrono::Duration::from_std(delay).unwrap_or_default());
                tracing::warn!(
                    instance_id = job.instance_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "edge publish failed; rescheduled"
                );
                JobOutcome::Rescheduled { attempt, delay }
            }
            Err(err) => {
                update.state = Set(JobState::Failed.as_str().to_string());
                update.last_error = Set(Some(err.to_string()));
                update.finished_at = Set(Some(now()));
                tracing::error!(
                    instance_id = job.instance_id,
                    attempts = attempt,
                    error = %err,
                    "edge publish gave up; instance left running without edge presence"
                );
                JobOutcome::GaveUp { attempts: attempt }
            }
        };

        let res = publish_jobs::Entity::update_many()
            .set(update)
            .filter(publish_jobs::Column::Id.eq(job.id))
            .filter(publish_jobs::Column::State.eq(JobState::Running.as_str()))
            .filter(held_by(job.claim_token))
            .exec(&self.db)
            .await?;
        if res.rows_affected == 0 {
            tracing::warn!(
                job_id = %job.id,
                instance_id = job.instance_id,
                ?outcome,
                "publish job claim lost; result discarded"
            );
        }
        Ok(outcome)
    }

    /// Claims and processes whatever is due. Returns how many jobs ran.
    pub async fn tick(&self) -> Result<usize> {
        let jobs = self.claim_due().await?;
        let n = jobs.len();
        for job in jobs {
            let id = job.id;
            if let Err(err) = self.process(job).await {
                tracing::warn!(job_id = %id, error = %err, "publish job bookkeeping failed");
            }
        }
        Ok(n)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.tick().await {
                    tracing::warn!(error = %err, "publish queue tick failed");
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        })
    }

    pub async fn job(&self, id: Uuid) -> Result<publish_jobs::Model> {
        publish_jobs::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ProvisionError::PublishFailed(format!("publish job {id} not found")))
    }
}
