use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{query, PgPool, Row};
use tracing::info;

use crate::models::{ContainerRecord, ContainerStatus, StoreError, WorkspaceId, WorkspaceStore};

/// Container fields of each workspace, persisted in PostgreSQL.
pub struct PgWorkspaceStore {
    pool: PgPool,
}

impl PgWorkspaceStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Connected to workspace record store");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        query(
            r#"
            CREATE TABLE IF NOT EXISTS workspace_containers (
                workspace_id BIGINT PRIMARY KEY,
                container_id TEXT,
                container_name TEXT,
                container_status TEXT NOT NULL DEFAULT 'not_created',
                container_url TEXT,
                container_port INTEGER,
                container_password TEXT,
                is_running BOOLEAN NOT NULL DEFAULT FALSE,
                last_accessed TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl WorkspaceStore for PgWorkspaceStore {
    async fn load(&self, id: WorkspaceId) -> Result<ContainerRecord, StoreError> {
        let row = query(
            r#"
            SELECT container_id, container_name, container_status, container_url,
                   container_port, container_password, is_running, last_accessed
            FROM workspace_containers
            WHERE workspace_id = $1
            "#,
        )
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(ContainerRecord::default());
        };

        let status: String = r.get("container_status");
        let status = status
            .parse::<ContainerStatus>()
            .map_err(|e| StoreError::Corrupt(id, e))?;
        let port = r
            .get::<Option<i32>, _>("container_port")
            .map(u16::try_from)
            .transpose()
            .map_err(|e| StoreError::Corrupt(id, e.to_string()))?;

        Ok(ContainerRecord {
            container_id: r.get("container_id"),
            container_name: r.get("container_name"),
            status,
            port,
            password: r.get("container_password"),
            url: r.get("container_url"),
            is_running: r.get("is_running"),
            last_accessed: r.get::<Option<DateTime<Utc>>, _>("last_accessed"),
        })
    }

    async fn save(&self, id: WorkspaceId, record: &ContainerRecord) -> Result<(), StoreError> {
        query(
            r#"
            INSERT INTO workspace_containers (
                workspace_id, container_id, container_name, container_status, container_url,
                container_port, container_password, is_running, last_accessed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (workspace_id) DO UPDATE SET
                container_id = EXCLUDED.container_id,
                container_name = EXCLUDED.container_name,
                container_status = EXCLUDED.container_status,
                container_url = EXCLUDED.container_url,
                container_port = EXCLUDED.container_port,
                container_password = EXCLUDED.container_password,
                is_running = EXCLUDED.is_running,
                last_accessed = EXCLUDED.last_accessed
            "#,
        )
        .bind(i64::from(id))
        .bind(&record.container_id)
        .bind(&record.container_name)
        .bind(record.status.as_str())
        .bind(&record.url)
        .bind(record.port.map(i32::from))
        .bind(&record.password)
        .bind(record.is_running)
        .bind(record.last_accessed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
