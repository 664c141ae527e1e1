// PostgreSQL Watch Store

use super::{DueCursor, WatchStore};
use crate::config::DatabaseConfig;
use crate::errors::StoreError;
use crate::models::{CaseFields, ExecutionResult, ExtractionOutcome, FailureRecord, FrequencyTier, Watch};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const WATCH_COLUMNS: &str = "id, owner_id, alias, search_mode, docket_number, party_name, \
                             tier, active, created_at, last_execution";

const RESULT_COLUMNS: &str =
    "id, watch_id, executed_at, outcome, case_number, court, last_action_date, case_status";

/// Watch Store backed by PostgreSQL
///
/// Leases are columns on the `watches` row and every lease transition is a
/// single conditional UPDATE, so concurrent schedulers and workers race on
/// row locks rather than on application state.
#[derive(Debug, Clone)]
pub struct PgWatchStore {
    pool: PgPool,
}

impl PgWatchStore {
    /// Connect a pool using the database configuration
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        info!("Initializing watch store connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create database pool");
                StoreError::ConnectionFailed(e.to_string())
            })?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Watch store connection pool initialized"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        info!("Watch store migrations applied");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Database health check failed");
                StoreError::HealthCheckFailed(e.to_string())
            })?;

        debug!("Database health check passed");
        Ok(())
    }

    pub async fn close(&self) {
        info!("Closing watch store connection pool");
        self.pool.close().await;
    }

    async fn release_in(
        tx: &mut Transaction<'_, Postgres>,
        watch_id: Uuid,
        token: Uuid,
    ) -> Result<bool, StoreError> {
        let released = sqlx::query(
            r#"
            UPDATE watches
            SET lease_token = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(watch_id)
        .bind(token)
        .execute(&mut **tx)
        .await?;

        Ok(released.rows_affected() == 1)
    }

    async fn insert_result_in(
        tx: &mut Transaction<'_, Postgres>,
        result: &ExecutionResult,
    ) -> Result<(), StoreError> {
        let fields = result.fields.as_ref();
        sqlx::query(&format!(
            "INSERT INTO execution_results ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            RESULT_COLUMNS
        ))
        .bind(result.id)
        .bind(result.watch_id)
        .bind(result.executed_at)
        .bind(result.outcome.to_string())
        .bind(fields.map(|f| f.case_number.clone()))
        .bind(fields.map(|f| f.court.clone()))
        .bind(fields.and_then(|f| f.last_action_date))
        .bind(fields.and_then(|f| f.status.clone()))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn advance_in(
        tx: &mut Transaction<'_, Postgres>,
        watch_id: Uuid,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // GREATEST ignores NULL, so a first execution simply sets the column
        sqlx::query("UPDATE watches SET last_execution = GREATEST(last_execution, $2) WHERE id = $1")
            .bind(watch_id)
            .bind(executed_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))
    }

    async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))
    }
}

fn result_from_row(row: &PgRow) -> Result<ExecutionResult, StoreError> {
    let outcome: String = row.try_get("outcome")?;
    let outcome = ExtractionOutcome::from_str(&outcome).map_err(StoreError::CorruptRecord)?;

    let case_number: Option<String> = row.try_get("case_number")?;
    let fields = match case_number {
        Some(case_number) => Some(CaseFields {
            case_number,
            court: row.try_get::<Option<String>, _>("court")?.unwrap_or_default(),
            last_action_date: row.try_get::<Option<NaiveDate>, _>("last_action_date")?,
            status: row.try_get("case_status")?,
        }),
        None => None,
    };

    Ok(ExecutionResult {
        id: row.try_get("id")?,
        watch_id: row.try_get("watch_id")?,
        executed_at: row.try_get("executed_at")?,
        fields,
        outcome,
    })
}

fn ttl_seconds(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

#[async_trait]
impl WatchStore for PgWatchStore {
    #[instrument(skip(self), fields(tier = %tier))]
    async fn list_due_watches(
        &self,
        tier: FrequencyTier,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> Result<Vec<Watch>, StoreError> {
        let cutoff = tier.due_cutoff(now);

        // '-infinity' stands in for NULL so the keyset comparison keeps
        // never-executed watches first
        let watches = sqlx::query_as::<_, Watch>(&format!(
            r#"
            SELECT {}
            FROM watches
            WHERE active = TRUE
              AND tier = $1
              AND (last_execution IS NULL OR last_execution <= $2)
              AND (lease_token IS NULL OR lease_expires_at <= NOW())
              AND (
                  NOT $3
                  OR (COALESCE(last_execution, '-infinity'::timestamptz), created_at, id)
                     > (COALESCE($4, '-infinity'::timestamptz), $5, $6)
              )
            ORDER BY COALESCE(last_execution, '-infinity'::timestamptz) ASC, created_at ASC, id ASC
            LIMIT $7
            "#,
            WATCH_COLUMNS
        ))
        .bind(tier.to_string())
        .bind(cutoff)
        .bind(after.is_some())
        .bind(after.and_then(|cursor| cursor.last_execution))
        .bind(after.map(|cursor| cursor.created_at))
        .bind(after.map(|cursor| cursor.id))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        debug!(count = watches.len(), "Found due watches");
        Ok(watches)
    }

    #[instrument(skip(self))]
    async fn get_watch(&self, watch_id: Uuid) -> Result<Option<Watch>, StoreError> {
        let watch = sqlx::query_as::<_, Watch>(&format!(
            "SELECT {} FROM watches WHERE id = $1",
            WATCH_COLUMNS
        ))
        .bind(watch_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(watch)
    }

    #[instrument(skip(self))]
    async fn latest_result(&self, watch_id: Uuid) -> Result<Option<ExecutionResult>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM execution_results
            WHERE watch_id = $1 AND outcome <> 'failed'
            ORDER BY executed_at DESC, seq DESC
            LIMIT 1
            "#,
            RESULT_COLUMNS
        ))
        .bind(watch_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(result_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_results(
        &self,
        watch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionResult>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM execution_results
            WHERE watch_id = $1
            ORDER BY executed_at DESC, seq DESC
            LIMIT $2
            "#,
            RESULT_COLUMNS
        ))
        .bind(watch_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(result_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn try_acquire_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let acquired = sqlx::query(
            r#"
            UPDATE watches
            SET lease_token = $2,
                lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1
              AND active = TRUE
              AND (lease_token IS NULL OR lease_expires_at <= NOW())
            "#,
        )
        .bind(watch_id)
        .bind(token)
        .bind(ttl_seconds(ttl))
        .execute(&self.pool)
        .await?;

        Ok(acquired.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let renewed = sqlx::query(
            r#"
            UPDATE watches
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(watch_id)
        .bind(token)
        .bind(ttl_seconds(ttl))
        .execute(&self.pool)
        .await?;

        Ok(renewed.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, watch_id: Uuid, token: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;
        let released = Self::release_in(&mut tx, watch_id, token).await?;
        Self::commit(tx).await?;
        Ok(released)
    }

    #[instrument(skip(self, result), fields(watch_id = %result.watch_id, outcome = %result.outcome))]
    async fn append_result(&self, result: &ExecutionResult) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        Self::insert_result_in(&mut tx, result).await?;
        Self::commit(tx).await
    }

    #[instrument(skip(self))]
    async fn update_last_execution(
        &self,
        watch_id: Uuid,
        executed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        Self::advance_in(&mut tx, watch_id, executed_at).await?;
        Self::commit(tx).await
    }

    #[instrument(skip(self, record), fields(watch_id = %record.watch_id, attempts = record.attempts))]
    async fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_failures (id, watch_id, lease_token, attempts, reason, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.watch_id)
        .bind(record.lease_token)
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
        .bind(&record.reason)
        .bind(record.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, result))]
    async fn complete_lease(
        &self,
        watch_id: Uuid,
        token: Uuid,
        result: Option<&ExecutionResult>,
        advance_to: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.begin().await?;

        if !Self::release_in(&mut tx, watch_id, token).await? {
            tx.rollback()
                .await
                .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
            debug!("Lease no longer held, nothing written");
            return Ok(false);
        }

        if let Some(result) = result {
            Self::insert_result_in(&mut tx, result).await?;
        }
        if let Some(executed_at) = advance_to {
            Self::advance_in(&mut tx, watch_id, executed_at).await?;
        }

        Self::commit(tx).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    async fn test_store() -> PgWatchStore {
        let settings = Settings::default();
        let store = PgWatchStore::connect(&settings.database)
            .await
            .expect("database should be reachable");
        store.migrate().await.expect("migrations should apply");
        store
    }

    async fn insert_watch(store: &PgWatchStore, watch: &Watch) {
        sqlx::query(
            r#"
            INSERT INTO watches (id, owner_id, alias, search_mode, docket_number, party_name,
                                 tier, active, created_at, last_execution)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(watch.id)
        .bind(watch.owner_id)
        .bind(&watch.alias)
        .bind(watch.search_mode.to_string())
        .bind(&watch.docket_number)
        .bind(&watch.party_name)
        .bind(watch.tier.to_string())
        .bind(watch.active)
        .bind(watch.created_at)
        .bind(watch.last_execution)
        .execute(store.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL to be running
    async fn test_lease_lifecycle() {
        let store = test_store().await;
        let watch = Watch::by_party_name(Uuid::new_v4(), "Ana Perez", FrequencyTier::Daily);
        insert_watch(&store, &watch).await;

        let token = Uuid::new_v4();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lease(watch.id, token, ttl).await.unwrap());
        assert!(!store.try_acquire_lease(watch.id, Uuid::new_v4(), ttl).await.unwrap());
        assert!(store.renew_lease(watch.id, token, ttl).await.unwrap());

        let now = Utc::now();
        let result = ExecutionResult::new(watch.id, now, None, ExtractionOutcome::NotFound);
        assert!(store.complete_lease(watch.id, token, Some(&result), Some(now)).await.unwrap());
        assert!(!store.complete_lease(watch.id, token, Some(&result), Some(now)).await.unwrap());

        let history = store.list_results(watch.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, ExtractionOutcome::NotFound);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL to be running
    async fn test_due_query_respects_tier_and_activity() {
        let store = test_store().await;
        let now = Utc::now();

        let due = Watch::by_party_name(Uuid::new_v4(), "Due", FrequencyTier::Monthly);
        let mut inactive = Watch::by_party_name(Uuid::new_v4(), "Inactive", FrequencyTier::Monthly);
        inactive.active = false;
        insert_watch(&store, &due).await;
        insert_watch(&store, &inactive).await;

        let listed = store
            .list_due_watches(FrequencyTier::Monthly, now, None, 10_000)
            .await
            .unwrap();
        assert!(listed.iter().any(|w| w.id == due.id));
        assert!(!listed.iter().any(|w| w.id == inactive.id));
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL to be running
    async fn test_due_query_pages_past_leased_watches() {
        let store = test_store().await;
        let now = Utc::now();
        let tier = FrequencyTier::Weekly;

        let mut ids = Vec::new();
        for name in ["Uno", "Dos", "Tres"] {
            let watch = Watch::by_party_name(Uuid::new_v4(), name, tier);
            insert_watch(&store, &watch).await;
            ids.push(watch.id);
        }
        assert!(store
            .try_acquire_lease(ids[0], Uuid::new_v4(), Duration::from_secs(600))
            .await
            .unwrap());

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .list_due_watches(tier, now, cursor.as_ref(), 1)
                .await
                .unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(DueCursor::of(last));
            seen.extend(page.iter().map(|w| w.id));
        }

        assert!(!seen.contains(&ids[0]));
        assert!(seen.contains(&ids[1]));
        assert!(seen.contains(&ids[2]));
    }
}
