use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::EndpointConfig;

/// Read-only view of the endpoint configuration table.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All rows with the active flag set
    async fn active_endpoints(&self) -> Result<Vec<EndpointConfig>, StoreError>;

    /// Rows whose last-updated timestamp is after `since`, active or not.
    /// `None` returns every row.
    async fn changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EndpointConfig>, StoreError>;

    /// Active configs for the given identifiers. Unknown or inactive
    /// identifiers are simply absent from the map.
    async fn lookup(&self, ids: &[String]) -> Result<HashMap<String, EndpointConfig>, StoreError>;
}

#[cfg(feature = "postgres")]
pub use self::postgres::PgConfigStore;

#[cfg(feature = "postgres")]
mod postgres {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::Row;
    use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
    use tracing::debug;

    use super::ConfigStore;
    use crate::config::PostgresConfig;
    use crate::error::StoreError;
    use crate::model::EndpointConfig;

    /// Endpoint table in PostgreSQL.
    #[derive(Clone)]
    pub struct PgConfigStore {
        pool: PgPool,
        table: String,
    }

    impl PgConfigStore {
        pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.url)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;

            Ok(Self::from_pool(pool, config.table.clone()))
        }

        pub fn from_pool(pool: PgPool, table: String) -> Self {
            Self { pool, table }
        }

        fn select(&self, filter: &str) -> String {
            format!(
                r#"
                SELECT endpoint,
                       is_active,
                       EXTRACT(EPOCH FROM check_interval)::bigint AS interval_secs,
                       expected_status_code,
                       updated_at::timestamptz AS updated_at
                FROM {}
                {}
                "#,
                self.table, filter
            )
        }
    }

    fn decode(row: &PgRow) -> Result<EndpointConfig, StoreError> {
        let interval_secs: Option<i64> = row.try_get("interval_secs")?;
        let expected: Option<i32> = row.try_get("expected_status_code")?;

        Ok(EndpointConfig {
            id: row.try_get("endpoint")?,
            active: row.try_get("is_active")?,
            interval: Duration::from_secs(interval_secs.unwrap_or(0).max(0) as u64),
            expected_status: expected
                .and_then(|status| u16::try_from(status).ok())
                .unwrap_or(200),
            updated_at: row.try_get("updated_at")?,
        })
    }

    #[async_trait]
    impl ConfigStore for PgConfigStore {
        async fn active_endpoints(&self) -> Result<Vec<EndpointConfig>, StoreError> {
            let rows = sqlx::query(&self.select("WHERE is_active = true"))
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(decode).collect()
        }

        async fn changed_since(
            &self,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<EndpointConfig>, StoreError> {
            let rows = match since {
                Some(since) => {
                    sqlx::query(&self.select("WHERE updated_at > $1 ORDER BY updated_at"))
                        .bind(since)
                        .fetch_all(&self.pool)
                        .await?
                }
                None => {
                    sqlx::query(&self.select("ORDER BY updated_at")).fetch_all(&self.pool).await?
                }
            };
            debug!(rows = rows.len(), since = ?since, "Fetched changed endpoint rows");
            rows.iter().map(decode).collect()
        }

        async fn lookup(
            &self,
            ids: &[String],
        ) -> Result<HashMap<String, EndpointConfig>, StoreError> {
            if ids.is_empty() {
                return Ok(HashMap::new());
            }

            let rows = sqlx::query(&self.select("WHERE endpoint = ANY($1) AND is_active = true"))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;

            rows.iter()
                .map(|row| decode(row).map(|config| (config.id.clone(), config)))
                .collect()
        }
    }
}

/// In-process config table for tests and local runs.
#[derive(Default)]
pub struct MemoryConfigStore {
    rows: RwLock<HashMap<String, EndpointConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = EndpointConfig>) -> Self {
        let rows = rows.into_iter().map(|row| (row.id.clone(), row)).collect();
        Self { rows: RwLock::new(rows) }
    }

    /// Insert or replace a row
    pub async fn upsert(&self, config: EndpointConfig) {
        self.rows.write().await.insert(config.id.clone(), config);
    }

    /// Flip the active flag, bumping the last-updated timestamp
    pub async fn set_active(&self, id: &str, active: bool, updated_at: DateTime<Utc>) -> bool {
        match self.rows.write().await.get_mut(id) {
            Some(row) => {
                row.active = active;
                row.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    /// Hard delete, as an operator dropping the row would
    pub async fn delete(&self, id: &str) -> Option<EndpointConfig> {
        self.rows.write().await.remove(id)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn active_endpoints(&self) -> Result<Vec<EndpointConfig>, StoreError> {
        let mut rows: Vec<_> = self.rows.read().await.values().filter(|r| r.active).cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    async fn changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EndpointConfig>, StoreError> {
        let mut rows: Vec<_> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| since.map(|since| row.updated_at > since).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.updated_at);
        Ok(rows)
    }

    async fn lookup(&self, ids: &[String]) -> Result<HashMap<String, EndpointConfig>, StoreError> {
        let rows = self.rows.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|row| row.active)
            .map(|row| (row.id.clone(), row.clone()))
            .collect())
    }
}
