//! Postgres-backed pipeline store.
//!
//! ## Concurrency
//!
//! - Stage results and work units are keyed by idempotency key; inserts use
//!   `ON CONFLICT DO NOTHING` so redelivered duplicates are no-ops.
//! - Campaign status changes are guarded `UPDATE ... WHERE status = ANY($n)`;
//!   `rows_affected` tells the caller whether it won the race.
//! - Matrix mutations and settlement lock the campaign row (`FOR UPDATE`) so
//!   concurrent trackers evaluate the verdict one at a time.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut / PoolClosed / Io | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! The trait is synchronous; calls are driven on a runtime owned by the store.
//! Do not call into it from inside another tokio runtime.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{debug, instrument};
use uuid::Uuid;

use creatiflow_core::{
    AspectRatio, AttemptStart, Campaign, CampaignConfig, CampaignId, CampaignStatus,
    CompletionMatrix, CompletionTuple, CorrelationId, FailureDetail, IdempotencyKey, Locale,
    ProductId, RecordOutcome, ResolvedOutcome, RevisionTicket, Stage, StageResult, TupleOutcome,
    TupleProgress, WorkUnit, WorkUnitRecord, WorkUnitState,
};

use super::{
    PipelineStore, StoreError, UnitStateCounts, UpsertOutcome, apply_result,
    notification_claimable, reopen_for_revision, settled_status,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id              UUID PRIMARY KEY,
    correlation_id  UUID NOT NULL UNIQUE,
    config          JSONB NOT NULL,
    status          TEXT NOT NULL,
    epoch           INTEGER NOT NULL,
    notified_epoch  INTEGER,
    failure         JSONB,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS completion_tuples (
    campaign_id       UUID NOT NULL REFERENCES campaigns(id),
    locale            TEXT NOT NULL,
    product_id        TEXT NOT NULL,
    aspect_ratio      TEXT NOT NULL,
    revision          INTEGER NOT NULL,
    seed              BIGINT NOT NULL,
    resolved_revision INTEGER,
    outcome           TEXT,
    source_key        UUID,
    PRIMARY KEY (campaign_id, locale, product_id, aspect_ratio)
);

CREATE TABLE IF NOT EXISTS work_units (
    idempotency_key UUID PRIMARY KEY,
    campaign_id     UUID NOT NULL REFERENCES campaigns(id),
    stage           TEXT NOT NULL,
    record          JSONB NOT NULL,
    state           TEXT NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS work_units_campaign_idx ON work_units (campaign_id, stage);

CREATE TABLE IF NOT EXISTS stage_results (
    idempotency_key      UUID PRIMARY KEY,
    campaign_id          UUID NOT NULL REFERENCES campaigns(id),
    stage                TEXT NOT NULL,
    revision             INTEGER NOT NULL,
    result               JSONB NOT NULL,
    downstream_published BOOLEAN NOT NULL DEFAULT FALSE,
    recorded_at          TIMESTAMPTZ NOT NULL
);
"#;

const CAMPAIGN_COLUMNS: &str = "id, correlation_id, config, status, epoch, notified_epoch, failure, created_at, updated_at";

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            StoreError::Conflict(format!("{operation}: unique violation: {}", db_err.message()))
        }
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("{operation}: database error: {}", db_err.message()))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("{operation}: connection pool unavailable: {err}"))
        }
        sqlx::Error::Io(io) => StoreError::Storage(format!("{operation}: io error: {io}")),
        _ => StoreError::Storage(format!("{operation}: {err}")),
    }
}

fn decode_error(operation: &str, err: impl core::fmt::Display) -> StoreError {
    StoreError::Storage(format!("{operation}: failed to decode row: {err}"))
}

/// Postgres implementation of [`PipelineStore`].
pub struct PostgresPipelineStore {
    pool: PgPool,
    runtime: Runtime,
}

impl core::fmt::Debug for PostgresPipelineStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresPipelineStore").finish_non_exhaustive()
    }
}

impl PostgresPipelineStore {
    /// Connect and make sure the schema exists.
    pub fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("creatiflow-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Storage(format!("failed to start store runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self { pool, runtime };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn lock_campaign(
        tx: &mut Transaction<'static, Postgres>,
        id: CampaignId,
        operation: &str,
    ) -> Result<Campaign, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or(StoreError::NotFound(id))?;
        campaign_from_row(&row)
    }

    async fn load_matrix(
        executor: &mut sqlx::PgConnection,
        id: CampaignId,
        operation: &str,
    ) -> Result<CompletionMatrix, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT locale, product_id, aspect_ratio, revision, seed, resolved_revision, outcome, source_key
            FROM completion_tuples
            WHERE campaign_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            tuples.push(tuple_from_row(&row)?);
        }
        Ok(CompletionMatrix::from_parts(id, tuples))
    }

    async fn save_campaign(
        tx: &mut Transaction<'static, Postgres>,
        campaign: &Campaign,
        operation: &str,
    ) -> Result<(), StoreError> {
        let failure = campaign
            .failure
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| decode_error(operation, e))?;
        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2, epoch = $3, notified_epoch = $4, failure = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(campaign.id.as_uuid())
        .bind(campaign.status.as_str())
        .bind(campaign.epoch as i32)
        .bind(campaign.notified_epoch.map(|e| e as i32))
        .bind(failure)
        .bind(campaign.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    async fn save_tuple(
        tx: &mut Transaction<'static, Postgres>,
        id: CampaignId,
        tuple: &CompletionTuple,
        progress: &TupleProgress,
        operation: &str,
    ) -> Result<(), StoreError> {
        let resolved = progress.resolved.as_ref();
        sqlx::query(
            r#"
            UPDATE completion_tuples
            SET revision = $5, seed = $6, resolved_revision = $7, outcome = $8, source_key = $9
            WHERE campaign_id = $1 AND locale = $2 AND product_id = $3 AND aspect_ratio = $4
            "#,
        )
        .bind(id.as_uuid())
        .bind(tuple.locale.as_str())
        .bind(tuple.product_id.as_str())
        .bind(tuple.aspect_ratio.as_str())
        .bind(progress.revision as i32)
        .bind(progress.seed as i64)
        .bind(resolved.map(|r| r.revision as i32))
        .bind(resolved.map(|r| r.outcome.as_str()))
        .bind(resolved.map(|r| *r.source.as_uuid()))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    async fn load_unit_for_update(
        tx: &mut Transaction<'static, Postgres>,
        key: IdempotencyKey,
        operation: &str,
    ) -> Result<Option<WorkUnitRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM work_units WHERE idempotency_key = $1 FOR UPDATE")
            .bind(key.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| unit_from_row(&r, operation)).transpose()
    }

    async fn save_unit(
        tx: &mut Transaction<'static, Postgres>,
        record: &WorkUnitRecord,
        operation: &str,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_value(record).map_err(|e| decode_error(operation, e))?;
        sqlx::query(
            r#"
            INSERT INTO work_units (idempotency_key, campaign_id, stage, record, state, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key)
            DO UPDATE SET record = EXCLUDED.record, state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.unit.idempotency_key.as_uuid())
        .bind(record.unit.campaign_id.as_uuid())
        .bind(record.unit.stage.as_str())
        .bind(json)
        .bind(record.state.as_str())
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(())
    }

    /// Run `f` on a unit record inside a transaction, creating it first if absent.
    fn with_unit<T>(
        &self,
        unit: &WorkUnit,
        operation: &'static str,
        f: impl FnOnce(&mut WorkUnitRecord, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))?;
            // Serialise first sight of a unit on its key.
            sqlx::query(
                r#"
                INSERT INTO work_units (idempotency_key, campaign_id, stage, record, state, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(unit.idempotency_key.as_uuid())
            .bind(unit.campaign_id.as_uuid())
            .bind(unit.stage.as_str())
            .bind(
                serde_json::to_value(WorkUnitRecord::requested(unit.clone(), Utc::now()))
                    .map_err(|e| decode_error(operation, e))?,
            )
            .bind(WorkUnitState::Requested.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

            let mut record = Self::load_unit_for_update(&mut tx, unit.idempotency_key, operation)
                .await?
                .ok_or_else(|| StoreError::Storage(format!("{operation}: unit row vanished")))?;
            let out = f(&mut record, Utc::now())?;
            Self::save_unit(&mut tx, &record, operation).await?;
            tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
            Ok(out)
        })
    }
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign, StoreError> {
    let op = "campaign_from_row";
    let id: Uuid = row.try_get("id").map_err(|e| decode_error(op, e))?;
    let correlation_id: Uuid = row.try_get("correlation_id").map_err(|e| decode_error(op, e))?;
    let config: serde_json::Value = row.try_get("config").map_err(|e| decode_error(op, e))?;
    let config: CampaignConfig = serde_json::from_value(config).map_err(|e| decode_error(op, e))?;
    let status: String = row.try_get("status").map_err(|e| decode_error(op, e))?;
    let epoch: i32 = row.try_get("epoch").map_err(|e| decode_error(op, e))?;
    let notified_epoch: Option<i32> = row.try_get("notified_epoch").map_err(|e| decode_error(op, e))?;
    let failure: Option<serde_json::Value> = row.try_get("failure").map_err(|e| decode_error(op, e))?;
    let failure: Option<FailureDetail> = failure
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| decode_error(op, e))?;

    Ok(Campaign {
        id: CampaignId::from_uuid(id),
        correlation_id: CorrelationId::from_uuid(correlation_id),
        config,
        status: CampaignStatus::parse(&status)?,
        epoch: epoch as u32,
        notified_epoch: notified_epoch.map(|e| e as u32),
        failure,
        created_at: row.try_get("created_at").map_err(|e| decode_error(op, e))?,
        updated_at: row.try_get("updated_at").map_err(|e| decode_error(op, e))?,
    })
}

fn tuple_from_row(row: &PgRow) -> Result<(CompletionTuple, TupleProgress), StoreError> {
    let op = "tuple_from_row";
    let locale: String = row.try_get("locale").map_err(|e| decode_error(op, e))?;
    let product_id: String = row.try_get("product_id").map_err(|e| decode_error(op, e))?;
    let aspect_ratio: String = row.try_get("aspect_ratio").map_err(|e| decode_error(op, e))?;
    let revision: i32 = row.try_get("revision").map_err(|e| decode_error(op, e))?;
    let seed: i64 = row.try_get("seed").map_err(|e| decode_error(op, e))?;
    let resolved_revision: Option<i32> =
        row.try_get("resolved_revision").map_err(|e| decode_error(op, e))?;
    let outcome: Option<String> = row.try_get("outcome").map_err(|e| decode_error(op, e))?;
    let source_key: Option<Uuid> = row.try_get("source_key").map_err(|e| decode_error(op, e))?;

    let resolved = match (resolved_revision, outcome, source_key) {
        (Some(revision), Some(outcome), Some(source)) => Some(ResolvedOutcome {
            revision: revision as u32,
            outcome: TupleOutcome::parse(&outcome)?,
            source: IdempotencyKey::from_uuid(source),
        }),
        _ => None,
    };

    Ok((
        CompletionTuple::new(
            Locale::new(locale)?,
            ProductId::new(product_id)?,
            aspect_ratio.parse::<AspectRatio>()?,
        ),
        TupleProgress {
            revision: revision as u32,
            seed: seed as u64,
            resolved,
        },
    ))
}

fn unit_from_row(row: &PgRow, operation: &str) -> Result<WorkUnitRecord, StoreError> {
    let json: serde_json::Value = row.try_get("record").map_err(|e| decode_error(operation, e))?;
    serde_json::from_value(json).map_err(|e| decode_error(operation, e))
}

fn result_from_row(row: &PgRow, operation: &str) -> Result<StageResult, StoreError> {
    let json: serde_json::Value = row.try_get("result").map_err(|e| decode_error(operation, e))?;
    let mut result: StageResult = serde_json::from_value(json).map_err(|e| decode_error(operation, e))?;
    result.downstream_published = row
        .try_get("downstream_published")
        .map_err(|e| decode_error(operation, e))?;
    Ok(result)
}

impl PipelineStore for PostgresPipelineStore {
    fn health_check(&self) -> Result<(), StoreError> {
        self.runtime
            .block_on(sqlx::query("SELECT 1").execute(&self.pool))
            .map_err(|e| map_sqlx_error("health_check", e))?;
        Ok(())
    }

    #[instrument(skip(self, campaign, matrix), fields(campaign_id = %campaign.id), err)]
    fn insert_campaign(&self, campaign: &Campaign, matrix: &CompletionMatrix) -> Result<(), StoreError> {
        let op = "insert_campaign";
        let config = serde_json::to_value(&campaign.config).map_err(|e| decode_error(op, e))?;
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(op, e))?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO campaigns (id, correlation_id, config, status, epoch, notified_epoch, failure, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(campaign.id.as_uuid())
            .bind(campaign.correlation_id.as_uuid())
            .bind(config)
            .bind(campaign.status.as_str())
            .bind(campaign.epoch as i32)
            .bind(campaign.created_at)
            .bind(campaign.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;
            if inserted.rows_affected() == 0 {
                return Err(StoreError::AlreadyExists(campaign.id));
            }

            for (tuple, progress) in matrix.tuples() {
                sqlx::query(
                    r#"
                    INSERT INTO completion_tuples (campaign_id, locale, product_id, aspect_ratio, revision, seed)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(campaign.id.as_uuid())
                .bind(tuple.locale.as_str())
                .bind(tuple.product_id.as_str())
                .bind(tuple.aspect_ratio.as_str())
                .bind(progress.revision as i32)
                .bind(progress.seed as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(op, e))?;
            }

            tx.commit().await.map_err(|e| map_sqlx_error(op, e))?;
            debug!(required = matrix.required_count(), "campaign persisted");
            Ok(())
        })
    }

    fn get_campaign(&self, id: CampaignId) -> Result<Campaign, StoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query(&format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"))
                    .bind(id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("get_campaign", e))?
            .ok_or(StoreError::NotFound(id))?;
        campaign_from_row(&row)
    }

    fn find_by_correlation(&self, correlation_id: CorrelationId) -> Result<Option<Campaign>, StoreError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query(&format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE correlation_id = $1"
                ))
                .bind(correlation_id.as_uuid())
                .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("find_by_correlation", e))?;
        row.map(|r| campaign_from_row(&r)).transpose()
    }

    #[instrument(skip(self, from, failure), fields(campaign_id = %id, to = %to), err)]
    fn transition_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        failure: Option<FailureDetail>,
    ) -> Result<bool, StoreError> {
        let op = "transition_status";
        let from: Vec<&str> = from.iter().map(CampaignStatus::as_str).collect();
        let failure = failure
            .map(|f| serde_json::to_value(&f))
            .transpose()
            .map_err(|e| decode_error(op, e))?;
        let result = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE campaigns
                    SET status = $2, failure = COALESCE($3, failure), updated_at = $4
                    WHERE id = $1 AND status = ANY($5)
                    "#,
                )
                .bind(id.as_uuid())
                .bind(to.as_str())
                .bind(failure)
                .bind(Utc::now())
                .bind(&from)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error(op, e))?;
        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing campaign.
            self.get_campaign(id)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn claim_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<bool, StoreError> {
        let op = "claim_ready_notification";
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(op, e))?;
            let mut campaign = Self::lock_campaign(&mut tx, id, op).await?;
            if !notification_claimable(&campaign, epoch) {
                return Ok(false);
            }
            campaign.notified_epoch = Some(epoch);
            Self::save_campaign(&mut tx, &campaign, op).await?;
            tx.commit().await.map_err(|e| map_sqlx_error(op, e))?;
            Ok(true)
        })
    }

    fn release_ready_notification(&self, id: CampaignId, epoch: u32) -> Result<(), StoreError> {
        self.runtime
            .block_on(
                sqlx::query(
                    "UPDATE campaigns SET notified_epoch = NULL WHERE id = $1 AND notified_epoch = $2",
                )
                .bind(id.as_uuid())
                .bind(epoch as i32)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("release_ready_notification", e))?;
        Ok(())
    }

    fn completion_matrix(&self, id: CampaignId) -> Result<CompletionMatrix, StoreError> {
        let op = "completion_matrix";
        self.runtime.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(|e| map_sqlx_error(op, e))?;
            let matrix = Self::load_matrix(&mut conn, id, op).await?;
            if matrix.required_count() == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(matrix)
        })
    }

    fn record_outcome(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        revision: u32,
        outcome: TupleOutcome,
        source: IdempotencyKey,
    ) -> Result<RecordOutcome, StoreError> {
        let op = "record_outcome";
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(op, e))?;
            Self::lock_campaign(&mut tx, id, op).await?;
            let mut matrix = Self::load_matrix(&mut tx, id, op).await?;
            let recorded = matrix.record(tuple, revision, outcome, source);
            if recorded == RecordOutcome::Inserted {
                if let Some(progress) = matrix.progress(tuple) {
                    Self::save_tuple(&mut tx, id, tuple, progress, op).await?;
                }
                tx.commit().await.map_err(|e| map_sqlx_error(op, e))?;
            }
            Ok(recorded)
        })
    }

    fn advance_revision(
        &self,
        id: CampaignId,
        tuple: &CompletionTuple,
        fresh_seed: u64,
    ) -> Result<RevisionTicket, StoreError> {
        let op = "advance_revision";
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(op, e))?;
            let mut campaign = Self::lock_campaign(&mut tx, id, op).await?;
            reopen_for_revision(&mut campaign, Utc::now())?;
            let mut matrix = Self::load_matrix(&mut tx, id, op).await?;
            let ticket = matrix.advance_revision(tuple, fresh_seed)?;
            if let Some(progress) = matrix.progress(tuple) {
                Self::save_tuple(&mut tx, id, tuple, progress, op).await?;
            }
            Self::save_campaign(&mut tx, &campaign, op).await?;
            tx.commit().await.map_err(|e| map_sqlx_error(op, e))?;
            Ok(ticket)
        })
    }

    fn settle_campaign(&self, id: CampaignId) -> Result<Option<CampaignStatus>, StoreError> {
        let op = "settle_campaign";
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(op, e))?;
            let mut campaign = Self::lock_campaign(&mut tx, id, op).await?;
            if campaign.status != CampaignStatus::Processing {
                return Ok(None);
            }
            let matrix = Self::load_matrix(&mut tx, id, op).await?;
            let Some(status) = settled_status(&matrix) else {
                return Ok(None);
            };
            campaign.status = status;
            campaign.updated_at = Utc::now();
            Self::save_campaign(&mut tx, &campaign, op).await?;
            tx.commit().await.map_err(|e| map_sqlx_error(op, e))?;
            Ok(Some(status))
        })
    }

    fn begin_attempt(&self, unit: &WorkUnit) -> Result<AttemptStart, StoreError> {
        self.with_unit(unit, "begin_attempt", |record, now| Ok(record.begin_attempt(now)?))
    }

    fn fail_unit(&self, unit: &WorkUnit, error: &FailureDetail, permanent: bool) -> Result<(), StoreError> {
        self.with_unit(unit, "fail_unit", |record, now| {
            Ok(record.fail(error.clone(), permanent, now)?)
        })
    }

    fn work_unit(&self, key: IdempotencyKey) -> Result<Option<WorkUnitRecord>, StoreError> {
        let op = "work_unit";
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT record FROM work_units WHERE idempotency_key = $1")
                    .bind(key.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error(op, e))?;
        row.map(|r| unit_from_row(&r, op)).transpose()
    }

    fn unit_state_counts(&self, id: CampaignId) -> Result<UnitStateCounts, StoreError> {
        let op = "unit_state_counts";
        self.get_campaign(id)?;
        let rows = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT stage, state, COUNT(*) AS n
                    FROM work_units
                    WHERE campaign_id = $1
                    GROUP BY stage, state
                    "#,
                )
                .bind(id.as_uuid())
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error(op, e))?;

        let mut counts = UnitStateCounts::new();
        for row in rows {
            let stage: String = row.try_get("stage").map_err(|e| decode_error(op, e))?;
            let state: String = row.try_get("state").map_err(|e| decode_error(op, e))?;
            let n: i64 = row.try_get("n").map_err(|e| decode_error(op, e))?;
            let state = WorkUnitState::parse(&state)?;
            let entry = counts.entry(Stage::parse(&stage)?).or_default();
            for _ in 0..n {
                entry.add(state);
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self, result), fields(idempotency_key = %result.idempotency_key, stage = %result.stage), err)]
    fn record_stage_result(&self, result: &StageResult) -> Result<UpsertOutcome, StoreError> {
        let op = "record_stage_result";
        let json = serde_json::to_value(result).map_err(|e| decode_error(op, e))?;
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(op, e))?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO stage_results (idempotency_key, campaign_id, stage, revision, result, downstream_published, recorded_at)
                VALUES ($1, $2, $3, $4, $5, FALSE, $6)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(result.idempotency_key.as_uuid())
            .bind(result.campaign_id.as_uuid())
            .bind(result.stage.as_str())
            .bind(result.revision as i32)
            .bind(json)
            .bind(result.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(op, e))?;

            if inserted.rows_affected() == 0 {
                let row = sqlx::query(
                    "SELECT result, downstream_published FROM stage_results WHERE idempotency_key = $1",
                )
                .bind(result.idempotency_key.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(op, e))?;
                return Ok(UpsertOutcome::Existing(result_from_row(&row, op)?));
            }

            if let Some(mut record) =
                Self::load_unit_for_update(&mut tx, result.idempotency_key, op).await?
            {
                apply_result(&mut record, result, Utc::now())?;
                Self::save_unit(&mut tx, &record, op).await?;
            }
            tx.commit().await.map_err(|e| map_sqlx_error(op, e))?;
            Ok(UpsertOutcome::Inserted)
        })
    }

    fn get_stage_result(&self, key: IdempotencyKey) -> Result<Option<StageResult>, StoreError> {
        let op = "get_stage_result";
        let row = self
            .runtime
            .block_on(
                sqlx::query(
                    "SELECT result, downstream_published FROM stage_results WHERE idempotency_key = $1",
                )
                .bind(key.as_uuid())
                .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error(op, e))?;
        row.map(|r| result_from_row(&r, op)).transpose()
    }

    fn mark_downstream_published(&self, key: IdempotencyKey) -> Result<(), StoreError> {
        let op = "mark_downstream_published";
        let updated = self
            .runtime
            .block_on(
                sqlx::query(
                    "UPDATE stage_results SET downstream_published = TRUE WHERE idempotency_key = $1",
                )
                .bind(key.as_uuid())
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error(op, e))?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("no stage result for {key}")));
        }
        Ok(())
    }
}
