use std::{sync::Arc, time::Duration};

use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use zlh_db::entities::instances;

use crate::agent::GuestAgent;
use crate::error::Result;
use crate::store::now;

/// Keeps `instances.agent_state` fresh. Writes nothing else.
#[derive(Clone)]
pub struct AgentStatusRefresher {
    db: DatabaseConnection,
    agent: Arc<dyn GuestAgent>,
    interval: Duration,
}

impl AgentStatusRefresher {
    pub fn new(db: DatabaseConnection, agent: Arc<dyn GuestAgent>, interval: Duration) -> Self {
        Self { db, agent, interval }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.tick().await {
                    tracing::warn!(error = %err, "agent status refresh failed");
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    /// Returns how many instances answered.
    pub async fn tick(&self) -> Result<usize> {
        let rows = instances::Entity::find()
            .filter(instances::Column::Address.is_not_null())
            .all(&self.db)
            .await?;

        let mut answered = 0;
        for row in rows {
            let id = row.id;
            let Some(address) = row.address.clone() else { continue };

            let status = match self.agent.status(&address).await {
                Ok(s) => s,
                Err(err) => {
                    tracing::debug!(instance_id = id, address = %address, error = %err, "agent unreachable");
                    continue;
                }
            };

            answered += 1;
            if let Err(err) = self.record(row, status.state.as_str()).await {
                tracing::warn!(instance_id = id, error = %err, "agent state not recorded");
            }
        }
        Ok(answered)
    }

    async fn record(&self, row: instances::Model, state: &str) -> Result<()> {
        if row.agent_state.as_deref() != Some(state) {
            tracing::info!(
                instance_id = row.id,
                from = row.agent_state.as_deref().unwrap_or("unknown"),
                to = state,
                "agent state changed"
            );
        }
        let mut update: instances::ActiveModel = row.into();
        update.agent_state = Set(Some(state.to_string()));
        update.agent_last_seen = Set(Some(now()));
        update.update(&self.db).await?;
        Ok(())
    }
}
