//! PostgreSQL deployment store implementation.

use async_trait::async_trait;
use foundry_intent::Category;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::error::{ControlError, ControlResult};
use crate::types::{Analytics, ContainerHandle, DeploymentId, DeploymentRecord, DeploymentStatus};

use super::{DeploymentFilter, DeploymentStore};

const COLUMNS: &str = "id, name, category, port, endpoint, container, instance, status, error, \
                       call_count, error_count, last_response_ms, created_at, updated_at";

/// PostgreSQL-backed deployment store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                port INTEGER NOT NULL,
                endpoint TEXT NOT NULL,
                container TEXT NOT NULL,
                instance TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                call_count BIGINT NOT NULL DEFAULT 0,
                error_count BIGINT NOT NULL DEFAULT 0,
                last_response_ms BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_status
            ON deployments (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_created_at
            ON deployments (created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &sqlx::postgres::PgRow) -> ControlResult<DeploymentRecord> {
        let id: String = row.get("id");
        let category_str: String = row.get("category");
        let port: i32 = row.get("port");
        let container: String = row.get("container");
        let status_str: String = row.get("status");
        let call_count: i64 = row.get("call_count");
        let error_count: i64 = row.get("error_count");
        let last_response_ms: Option<i64> = row.get("last_response_ms");

        let category: Category = category_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse category '{category_str}': {e}"))
        })?;

        let status: DeploymentStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        let port = u16::try_from(port)
            .map_err(|_| ControlError::Serialisation(format!("port out of range: {port}")))?;

        Ok(DeploymentRecord {
            id: DeploymentId::new(id),
            name: row.get("name"),
            category,
            port,
            endpoint: row.get("endpoint"),
            container: ContainerHandle::new(container),
            instance: row.get("instance"),
            status,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            analytics: Analytics {
                call_count: u64::try_from(call_count).unwrap_or(0),
                error_count: u64::try_from(error_count).unwrap_or(0),
                last_response_ms: last_response_ms.and_then(|ms| u64::try_from(ms).ok()),
            },
            error: row.get("error"),
        })
    }

    async fn current_status(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentStatus>> {
        let row = sqlx::query("SELECT status FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            let status: String = r.get("status");
            status.parse().map_err(|e| {
                ControlError::Serialisation(format!("failed to parse status '{status}': {e}"))
            })
        })
        .transpose()
    }
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn create(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO deployments (
                id, name, category, port, endpoint, container, instance, status, error,
                call_count, error_count, last_response_ms, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                port = EXCLUDED.port,
                endpoint = EXCLUDED.endpoint,
                container = EXCLUDED.container,
                instance = EXCLUDED.instance,
                status = EXCLUDED.status,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            WHERE deployments.status NOT IN ('running_unverified', 'healthy')
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.name)
        .bind(record.category.as_str())
        .bind(i32::from(record.port))
        .bind(&record.endpoint)
        .bind(record.container.as_str())
        .bind(&record.instance)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(i64::try_from(record.analytics.call_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.analytics.error_count).unwrap_or(i64::MAX))
        .bind(
            record
                .analytics
                .last_response_ms
                .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
        )
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::Conflict(format!(
                "deployment {} is already live",
                record.id
            )));
        }

        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM deployments WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {COLUMNS} FROM deployments WHERE 1=1");

        let mut params: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        if filter.live_only {
            query.push_str(" AND status IN ('running_unverified', 'healthy')");
        }

        query.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn compare_and_set_status(
        &self,
        id: &DeploymentId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, error = $2, updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(next.as_str())
        .bind(error)
        .bind(id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.current_status(id).await? {
            Some(actual) => Err(ControlError::StaleStatus {
                id: id.to_string(),
                expected: expected.as_str(),
                actual: actual.as_str(),
            }),
            None => Err(ControlError::NotFound(id.to_string())),
        }
    }

    async fn record_call(
        &self,
        id: &DeploymentId,
        response_ms: u64,
        success: bool,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET call_count = call_count + 1,
                error_count = error_count + CASE WHEN $1 THEN 0 ELSE 1 END,
                last_response_ms = $2,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(success)
        .bind(i64::try_from(response_ms).unwrap_or(i64::MAX))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM deployments WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::NotFound(id.to_string()));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
