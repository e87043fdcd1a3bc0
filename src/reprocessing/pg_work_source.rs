//! # Postgres Work Source
//!
//! Claims rows with `FOR UPDATE SKIP LOCKED` and refreshes their touch column in
//! the same statement, inside one transaction. A claimed row is not selected
//! again until its touch time falls outside the lease window, so a crashed
//! claimer's items become claimable once the lease lapses.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::work_source::{ClaimError, WorkItemId, WorkSource};
use crate::config::WorkSourceConfig;
use crate::error::{ReprocessorError, Result};

/// Row-claiming work source over a Postgres table
#[derive(Debug, Clone)]
pub struct PgWorkSource {
    pool: PgPool,
    config: WorkSourceConfig,
    claim_sql: String,
}

impl PgWorkSource {
    /// Build a work source over an existing pool.
    ///
    /// The configuration is validated because its identifiers are spliced into SQL.
    pub fn new(pool: PgPool, config: WorkSourceConfig) -> Result<Self> {
        config.validate()?;
        let claim_sql = build_claim_sql(&config);
        Ok(Self {
            pool,
            config,
            claim_sql,
        })
    }

    /// Open a pool from `database_url` and build the work source on it
    pub async fn connect(config: WorkSourceConfig) -> Result<Self> {
        let url = config.database_url.clone().ok_or_else(|| {
            ReprocessorError::ConfigurationError(
                "work_source.database_url is required for the Postgres work source".to_string(),
            )
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&url)
            .await
            .map_err(|e| ReprocessorError::DatabaseError(format!("Failed to connect: {e}")))?;

        Self::new(pool, config)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn claim_sql(&self) -> &str {
        &self.claim_sql
    }
}

#[async_trait]
impl WorkSource for PgWorkSource {
    #[instrument(skip(self), fields(table = %self.config.table))]
    async fn claim_batch(&self, max_count: usize) -> std::result::Result<Vec<WorkItemId>, ClaimError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);
        let lease_seconds = self.config.lease_seconds as f64;

        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(&self.claim_sql)
            .bind(limit)
            .bind(lease_seconds)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(
            requested = max_count,
            claimed = ids.len(),
            "Claimed rows from Postgres work source"
        );

        Ok(ids.into_iter().map(WorkItemId::from).collect())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

/// Claim statement for a validated configuration.
///
/// `$1` is the batch size, `$2` the lease in seconds.
pub(crate) fn build_claim_sql(config: &WorkSourceConfig) -> String {
    let table = &config.table;
    let id = &config.id_column;
    let touched = &config.touched_column;
    let predicate = &config.claimable_predicate;

    format!(
        "WITH claimable AS ( \
            SELECT {id} FROM {table} \
            WHERE ({predicate}) AND {touched} < now() - make_interval(secs => $2) \
            ORDER BY {touched} ASC \
            LIMIT $1 \
            FOR UPDATE SKIP LOCKED \
        ) \
        UPDATE {table} AS t SET {touched} = now() \
        FROM claimable \
        WHERE t.{id} = claimable.{id} \
        RETURNING t.{id}::text"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_sql_uses_configured_identifiers() {
        let config = WorkSourceConfig {
            table: "integration.results".to_string(),
            id_column: "result_id".to_string(),
            touched_column: "updated_at".to_string(),
            claimable_predicate: "status = 'stale'".to_string(),
            ..WorkSourceConfig::default()
        };
        let sql = build_claim_sql(&config);

        assert!(sql.contains("SELECT result_id FROM integration.results"));
        assert!(sql.contains("WHERE (status = 'stale') AND updated_at < now() - make_interval(secs => $2)"));
        assert!(sql.contains("ORDER BY updated_at ASC"));
        assert!(sql.contains("LIMIT $1"));
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("UPDATE integration.results AS t SET updated_at = now()"));
        assert!(sql.ends_with("RETURNING t.result_id::text"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_database_error() {
        let config = WorkSourceConfig {
            database_url: Some("postgres://[not-a-host".to_string()),
            ..WorkSourceConfig::default()
        };
        let err = PgWorkSource::connect(config).await.unwrap_err();
        assert!(matches!(err, ReprocessorError::DatabaseError(ref msg) if msg.starts_with("Failed to connect")));

        let missing = PgWorkSource::connect(WorkSourceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, ReprocessorError::ConfigurationError(_)));
    }

    #[test]
    fn test_default_claim_sql() {
        let sql = build_claim_sql(&WorkSourceConfig::default());
        assert!(sql.contains("FROM work_items"));
        assert!(sql.contains("WHERE (TRUE)"));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_identifiers() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/unused")
            .unwrap();
        let config = WorkSourceConfig {
            table: "work_items; DROP TABLE work_items".to_string(),
            ..WorkSourceConfig::default()
        };
        let err = PgWorkSource::new(pool, config).unwrap_err();
        assert!(matches!(err, ReprocessorError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_connect_requires_database_url() {
        let err = PgWorkSource::connect(WorkSourceConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("database_url"));
    }
}
