//! Routing configuration storage. Rules live as JSONB data and parse
//! into the closed condition grammar.

use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::model::routing::{RoutingConfig, RoutingRule};
use crate::model::worker::WorkerId;

impl super::Db {
    /// Load a scope's routing configuration, if one exists.
    pub async fn routing_config(&self, scope_id: Uuid) -> Result<Option<RoutingConfig>> {
        let row: Option<(serde_json::Value, Option<Uuid>)> = sqlx::query_as(
            "SELECT rules, default_worker_id FROM routing_configs WHERE scope_id = $1",
        )
        .bind(scope_id)
        .fetch_optional(self.pool())
        .await?;

        let Some((rules_json, default_worker)) = row else {
            return Ok(None);
        };

        let rules: Vec<RoutingRule> = serde_json::from_value(rules_json)?;
        Ok(Some(RoutingConfig {
            scope_id,
            rules,
            default_worker_id: default_worker.map(WorkerId),
        }))
    }

    /// Create or replace a scope's routing configuration.
    pub async fn upsert_routing_config(&self, config: &RoutingConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO routing_configs (scope_id, rules, default_worker_id, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (scope_id)
             DO UPDATE SET rules = $2, default_worker_id = $3, updated_at = $4",
        )
        .bind(config.scope_id)
        .bind(serde_json::to_value(&config.rules)?)
        .bind(config.default_worker_id.map(|w| w.0))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
