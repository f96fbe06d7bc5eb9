//! The due-time index: endpoint identifiers ordered by the Unix second they
//! are next due, plus the reconciliation watermark kept next to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::model::{EndpointConfig, ScheduleEntry};
use crate::store::ConfigStore;

/// Sorted-set primitive backing the index. Writing an existing member
/// replaces its score.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn upsert(&self, entries: &[ScheduleEntry]) -> Result<(), StoreError>;

    async fn remove(&self, members: &[String]) -> Result<(), StoreError>;

    /// Entries with score <= `max`, lowest score first
    async fn due(&self, max: i64) -> Result<Vec<ScheduleEntry>, StoreError>;

    async fn score(&self, member: &str) -> Result<Option<i64>, StoreError>;

    async fn members(&self) -> Result<Vec<String>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    async fn watermark(&self) -> Result<Option<String>, StoreError>;

    async fn set_watermark(&self, value: &str) -> Result<(), StoreError>;
}

#[cfg(feature = "redis")]
pub use self::redis::RedisScheduleStore;

#[cfg(feature = "redis")]
mod redis {
    use async_trait::async_trait;
    use deadpool_redis::redis::cmd;
    use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};

    use super::ScheduleStore;
    use crate::config::{RedisConfig, SchedulerConfig};
    use crate::error::StoreError;
    use crate::model::ScheduleEntry;

    /// Sorted set `index_key` plus string `watermark_key` in Redis.
    #[derive(Clone)]
    pub struct RedisScheduleStore {
        pool: Pool,
        index_key: String,
        watermark_key: String,
    }

    impl RedisScheduleStore {
        pub fn connect(redis: &RedisConfig, scheduler: &SchedulerConfig) -> Result<Self, StoreError> {
            let mut config = Config::from_url(redis.url.clone());
            config.pool = Some(PoolConfig::new(redis.pool_size.max(1)));
            let pool = config
                .create_pool(Some(Runtime::Tokio1))
                .map_err(|e| StoreError::Connection(e.to_string()))?;

            Ok(Self::from_pool(pool, &scheduler.index_key, &scheduler.watermark_key))
        }

        pub fn from_pool(pool: Pool, index_key: &str, watermark_key: &str) -> Self {
            Self { pool, index_key: index_key.to_string(), watermark_key: watermark_key.to_string() }
        }

        async fn conn(&self) -> Result<Connection, StoreError> {
            Ok(self.pool.get().await?)
        }
    }

    fn to_entries(raw: Vec<(String, f64)>) -> Vec<ScheduleEntry> {
        raw.into_iter()
            .map(|(member, score)| ScheduleEntry { member, score: score as i64 })
            .collect()
    }

    #[async_trait]
    impl ScheduleStore for RedisScheduleStore {
        async fn upsert(&self, entries: &[ScheduleEntry]) -> Result<(), StoreError> {
            if entries.is_empty() {
                return Ok(());
            }
            let mut command = cmd("ZADD");
            command.arg(&self.index_key);
            for entry in entries {
                command.arg(entry.score).arg(&entry.member);
            }
            let mut conn = self.conn().await?;
            let _: i64 = command.query_async(&mut conn).await?;
            Ok(())
        }

        async fn remove(&self, members: &[String]) -> Result<(), StoreError> {
            if members.is_empty() {
                return Ok(());
            }
            let mut command = cmd("ZREM");
            command.arg(&self.index_key);
            for member in members {
                command.arg(member);
            }
            let mut conn = self.conn().await?;
            let _: i64 = command.query_async(&mut conn).await?;
            Ok(())
        }

        async fn due(&self, max: i64) -> Result<Vec<ScheduleEntry>, StoreError> {
            let mut conn = self.conn().await?;
            let raw: Vec<(String, f64)> = cmd("ZRANGEBYSCORE")
                .arg(&self.index_key)
                .arg("-inf")
                .arg(max)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await?;
            Ok(to_entries(raw))
        }

        async fn score(&self, member: &str) -> Result<Option<i64>, StoreError> {
            let mut conn = self.conn().await?;
            let score: Option<f64> =
                cmd("ZSCORE").arg(&self.index_key).arg(member).query_async(&mut conn).await?;
            Ok(score.map(|score| score as i64))
        }

        async fn members(&self) -> Result<Vec<String>, StoreError> {
            let mut conn = self.conn().await?;
            Ok(cmd("ZRANGE").arg(&self.index_key).arg(0).arg(-1).query_async(&mut conn).await?)
        }

        async fn len(&self) -> Result<usize, StoreError> {
            let mut conn = self.conn().await?;
            Ok(cmd("ZCARD").arg(&self.index_key).query_async(&mut conn).await?)
        }

        async fn watermark(&self) -> Result<Option<String>, StoreError> {
            let mut conn = self.conn().await?;
            Ok(cmd("GET").arg(&self.watermark_key).query_async(&mut conn).await?)
        }

        async fn set_watermark(&self, value: &str) -> Result<(), StoreError> {
            let mut conn = self.conn().await?;
            let _: () = cmd("SET").arg(&self.watermark_key).arg(value).query_async(&mut conn).await?;
            Ok(())
        }
    }
}

#[derive(Default)]
struct MemoryIndexState {
    scores: HashMap<String, i64>,
    watermark: Option<String>,
}

/// In-process sorted set with the same replace-on-write semantics.
#[derive(Default)]
pub struct MemoryScheduleStore {
    state: Mutex<MemoryIndexState>,
    fail_writes: Mutex<u32>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` mutating calls fail with a connection error
    pub async fn fail_next_writes(&self, count: u32) {
        *self.fail_writes.lock().await = count;
    }

    async fn check_write(&self) -> Result<(), StoreError> {
        let mut remaining = self.fail_writes.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(StoreError::Connection("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert(&self, entries: &[ScheduleEntry]) -> Result<(), StoreError> {
        self.check_write().await?;
        let mut state = self.state.lock().await;
        for entry in entries {
            state.scores.insert(entry.member.clone(), entry.score);
        }
        Ok(())
    }

    async fn remove(&self, members: &[String]) -> Result<(), StoreError> {
        self.check_write().await?;
        let mut state = self.state.lock().await;
        for member in members {
            state.scores.remove(member);
        }
        Ok(())
    }

    async fn due(&self, max: i64) -> Result<Vec<ScheduleEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .scores
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| ScheduleEntry::new(member.clone(), *score))
            .collect();
        entries.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.member.cmp(&b.member)));
        Ok(entries)
    }

    async fn score(&self, member: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.state.lock().await.scores.get(member).copied())
    }

    async fn members(&self) -> Result<Vec<String>, StoreError> {
        let mut members: Vec<_> = self.state.lock().await.scores.keys().cloned().collect();
        members.sort();
        Ok(members)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.scores.len())
    }

    async fn watermark(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.watermark.clone())
    }

    async fn set_watermark(&self, value: &str) -> Result<(), StoreError> {
        self.check_write().await?;
        self.state.lock().await.watermark = Some(value.to_string());
        Ok(())
    }
}

/// What `reschedule` did with a batch of identifiers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RescheduleOutcome {
    pub rescheduled: usize,
    /// Identifiers without an active config, dropped from the index
    pub removed: usize,
}

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// No usable watermark, so the pass degenerated to full hydration
    pub full: bool,
    pub upserted: usize,
    pub removed: usize,
    pub watermark: Option<DateTime<Utc>>,
}

/// Scheduler-side operations over the index. The scheduler loop is the only
/// writer.
pub struct DueIndex {
    configs: Arc<dyn ConfigStore>,
    store: Arc<dyn ScheduleStore>,
    batch_size: usize,
}

impl DueIndex {
    pub fn new(configs: Arc<dyn ConfigStore>, store: Arc<dyn ScheduleStore>, batch_size: usize) -> Self {
        Self { configs, store, batch_size: batch_size.max(1) }
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    async fn upsert_batched(&self, entries: &[ScheduleEntry]) -> Result<(), StoreError> {
        for chunk in entries.chunks(self.batch_size) {
            self.store.upsert(chunk).await?;
        }
        Ok(())
    }

    async fn remove_batched(&self, members: &[String]) -> Result<(), StoreError> {
        for chunk in members.chunks(self.batch_size) {
            self.store.remove(chunk).await?;
        }
        Ok(())
    }

    fn entries_at(configs: &[EndpointConfig], now: i64) -> Vec<ScheduleEntry> {
        configs.iter().map(|config| ScheduleEntry::new(config.id.clone(), config.next_due(now))).collect()
    }

    /// Insert every active endpoint with score `now + interval`. Safe to call
    /// again: members are replaced, never duplicated.
    pub async fn hydrate(&self, now: i64) -> Result<usize, StoreError> {
        let active = self.configs.active_endpoints().await?;
        let entries = Self::entries_at(&active, now);
        self.upsert_batched(&entries).await?;
        info!(endpoints = entries.len(), "Hydrated due-time index");
        Ok(entries.len())
    }

    /// Active configs for a batch of members
    pub async fn lookup(&self, ids: &[String]) -> Result<HashMap<String, EndpointConfig>, StoreError> {
        self.configs.lookup(ids).await
    }

    /// Members with score <= `now`. Read-only.
    pub async fn poll_due(&self, now: i64) -> Result<Vec<String>, StoreError> {
        Ok(self.store.due(now).await?.into_iter().map(|entry| entry.member).collect())
    }

    /// Move each identifier to `now + interval`, using the interval currently
    /// in the config store. Identifiers that are no longer active are removed.
    pub async fn reschedule(&self, ids: &[String], now: i64) -> Result<RescheduleOutcome, StoreError> {
        if ids.is_empty() {
            return Ok(RescheduleOutcome::default());
        }

        let configs = self.configs.lookup(ids).await?;
        let mut entries = Vec::with_capacity(configs.len());
        let mut gone = Vec::new();
        for id in ids {
            match configs.get(id) {
                Some(config) => entries.push(ScheduleEntry::new(id.clone(), config.next_due(now))),
                None => gone.push(id.clone()),
            }
        }

        self.upsert_batched(&entries).await?;
        if !gone.is_empty() {
            debug!(count = gone.len(), "Dropping inactive endpoints from the index");
            self.remove_batched(&gone).await?;
        }

        Ok(RescheduleOutcome { rescheduled: entries.len(), removed: gone.len() })
    }

    /// Stored watermark, or `None` when it is absent, empty or unparseable.
    pub async fn watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = self.store.watermark().await?;
        Ok(raw.as_deref().map(str::trim).filter(|raw| !raw.is_empty()).and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|parsed| parsed.with_timezone(&Utc))
                .inspect_err(|error| {
                    warn!(watermark = raw, %error, "Ignoring corrupt sync watermark, doing a full sync")
                })
                .ok()
        }))
    }

    /// Apply config changes since the last pass to the index.
    ///
    /// The watermark advances only after both the upserts and the removals
    /// went through, so a failed pass is simply repeated from the old one.
    pub async fn reconcile(&self, now: i64) -> Result<ReconcileOutcome, StoreError> {
        let since = self.watermark().await?;
        let full = since.is_none();
        let rows = self.configs.changed_since(since).await?;

        let (active, inactive): (Vec<_>, Vec<_>) = rows.iter().cloned().partition(|row| row.active);
        let mut removals: Vec<String> = inactive.into_iter().map(|row| row.id).collect();

        if full {
            // Rows deleted outright never show up as changed; a full pass is
            // the only time they can be noticed.
            let known: HashSet<&str> = rows.iter().map(|row| row.id.as_str()).collect();
            let orphans = self.store.members().await?;
            removals.extend(orphans.into_iter().filter(|member| !known.contains(member.as_str())));
        }

        let entries = Self::entries_at(&active, now);
        self.upsert_batched(&entries).await?;
        self.remove_batched(&removals).await?;

        let watermark = rows.iter().map(|row| row.updated_at).max();
        if let Some(watermark) = watermark {
            self.store.set_watermark(&watermark.to_rfc3339_opts(SecondsFormat::Micros, true)).await?;
        }

        if !entries.is_empty() || !removals.is_empty() {
            info!(full, upserted = entries.len(), removed = removals.len(), "Reconciled due-time index");
        }

        Ok(ReconcileOutcome {
            full,
            upserted: entries.len(),
            removed: removals.len(),
            watermark: watermark.or(since),
        })
    }
}
