//! PostgreSQL counter store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use super::CounterStore;
use crate::error::{StoreError, StoreResult};
use crate::ratelimit::WindowCounter;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rate_limit_counters (
    key          TEXT PRIMARY KEY,
    window_start TIMESTAMPTZ NOT NULL,
    count        BIGINT NOT NULL CHECK (count >= 0),
    version      BIGINT NOT NULL
)
"#;

// Shared by every row, so a recreated key never gets a version back
const CREATE_VERSION_SEQUENCE: &str = r#"
CREATE SEQUENCE IF NOT EXISTS rate_limit_counter_versions
"#;

const CREATE_WINDOW_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS rate_limit_counters_window_start_idx
    ON rate_limit_counters (window_start)
"#;

/// Database row model.
#[derive(sqlx::FromRow)]
struct CounterRow {
    key: String,
    window_start: DateTime<Utc>,
    count: i64,
    version: i64,
}

impl TryFrom<CounterRow> for WindowCounter {
    type Error = StoreError;

    fn try_from(row: CounterRow) -> StoreResult<Self> {
        let count = u64::try_from(row.count)
            .map_err(|_| StoreError::Corrupt(format!("negative count for {}", row.key)))?;
        let version = u64::try_from(row.version)
            .map_err(|_| StoreError::Corrupt(format!("negative version for {}", row.key)))?;

        Ok(WindowCounter {
            key: row.key,
            window_start: row.window_start,
            count,
            version,
        })
    }
}

fn to_db_int(value: u64, field: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} out of range: {}", field, value)))
}

/// Counter store backed by a `rate_limit_counters` table.
///
/// Every conditional write is a single statement, so row-level locking in
/// PostgreSQL makes the version check and the write atomic across processes.
#[derive(Clone)]
pub struct PostgresCounterStore {
    pool: PgPool,
}

impl PostgresCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        info!(max_connections, "Connected to counter database");
        Ok(Self::new(pool))
    }

    /// Create the counter table, its index and the version sequence if they
    /// do not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(CREATE_VERSION_SEQUENCE).execute(&self.pool).await?;
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_WINDOW_INDEX).execute(&self.pool).await?;
        debug!("Counter schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    async fn find(&self, key: &str) -> StoreResult<Option<WindowCounter>> {
        let row = sqlx::query_as::<_, CounterRow>(
            r#"
            SELECT key, window_start, count, version
            FROM rate_limit_counters
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            warn!(error = %e, key, "Failed to read counter");
            StoreError::from(e)
        })?;

        row.map(WindowCounter::try_from).transpose()
    }

    async fn upsert(&self, counter: &WindowCounter) -> StoreResult<bool> {
        let count = to_db_int(counter.count, "count")?;

        let outcome = if counter.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO rate_limit_counters (key, window_start, count, version)
                VALUES ($1, $2, $3, nextval('rate_limit_counter_versions'))
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(&counter.key)
            .bind(counter.window_start)
            .bind(count)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE rate_limit_counters
                SET window_start = $2, count = $3,
                    version = nextval('rate_limit_counter_versions')
                WHERE key = $1 AND version = $4
                "#,
            )
            .bind(&counter.key)
            .bind(counter.window_start)
            .bind(count)
            .bind(to_db_int(counter.version, "version")?)
            .execute(&self.pool)
            .await
        };

        let result = outcome.map_err(|e| {
            warn!(error = %e, key = %counter.key, "Failed to write counter");
            StoreError::from(e)
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE window_start < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rand::Rng;

    async fn test_store() -> PostgresCounterStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PostgresCounterStore::connect(&url, 4, Duration::from_secs(5))
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn unique_key(prefix: &str) -> String {
        let suffix: u64 = rand::thread_rng().gen();
        format!("{}:test-{:x}", prefix, suffix)
    }

    #[test]
    fn test_row_conversion_rejects_negative_count() {
        let row = CounterRow {
            key: "CHAT:s1".to_string(),
            window_start: Utc::now(),
            count: -1,
            version: 1,
        };
        assert!(matches!(
            WindowCounter::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_conditional_writes() {
        let store = test_store().await;
        let key = unique_key("CHAT");
        let now = Utc::now();

        let first = WindowCounter::fresh(key.clone(), now).incremented();
        assert!(store.upsert(&first).await.unwrap());
        assert!(!store.upsert(&first).await.unwrap());

        let read = store.find(&key).await.unwrap().unwrap();
        assert_eq!(read.count, 1);
        assert!(read.version > 0);

        assert!(store.upsert(&read.incremented()).await.unwrap());
        assert!(!store.upsert(&read.incremented()).await.unwrap());
        assert_eq!(store.find(&key).await.unwrap().unwrap().count, 2);

        assert!(store.delete(&key).await.unwrap());
        assert!(store.find(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_recreated_row_never_matches_old_version() {
        let store = test_store().await;
        let key = unique_key("CHAT");
        let now = Utc::now();

        store
            .upsert(&WindowCounter::fresh(key.clone(), now).incremented())
            .await
            .unwrap();
        let before_delete = store.find(&key).await.unwrap().unwrap();

        store.delete(&key).await.unwrap();
        let later = now + ChronoDuration::seconds(120);
        assert!(store
            .upsert(&WindowCounter::fresh(key.clone(), later).incremented())
            .await
            .unwrap());

        let recreated = store.find(&key).await.unwrap().unwrap();
        assert_ne!(recreated.version, before_delete.version);
        assert!(!store
            .upsert(&before_delete.reopen(later).incremented())
            .await
            .unwrap());
        assert_eq!(store.find(&key).await.unwrap().unwrap(), recreated);

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_delete_expired_before() {
        let store = test_store().await;
        let old_key = unique_key("GENERATION");
        let new_key = unique_key("GENERATION");
        let long_ago = Utc::now() - ChronoDuration::days(3650);

        store
            .upsert(&WindowCounter::fresh(old_key.clone(), long_ago).incremented())
            .await
            .unwrap();
        store
            .upsert(&WindowCounter::fresh(new_key.clone(), Utc::now()).incremented())
            .await
            .unwrap();

        let removed = store
            .delete_expired_before(long_ago + ChronoDuration::seconds(1))
            .await
            .unwrap();

        assert!(removed >= 1);
        assert!(store.find(&old_key).await.unwrap().is_none());
        assert!(store.find(&new_key).await.unwrap().is_some());
        store.delete(&new_key).await.unwrap();
    }
}
