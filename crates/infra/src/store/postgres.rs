//! Postgres-backed session store.
//!
//! Schema: `crates/infra/migrations/0001_init.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation on `(campaign_id, tester_id)`) | `23505` | `DuplicateSession` | Tester applied twice concurrently |
//! | Database (other unique violation) | `23505` | `Concurrency` | Same session inserted twice |
//! | Database (check constraint violation) | `23514` | `Storage` | Counter would go negative (guarded earlier, should not occur) |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Sync bridge
//!
//! `SessionStore` is synchronous. The store keeps a handle to the Tokio runtime
//! it was built on and blocks on it, so callers must run on a blocking-capable
//! thread (the sweep worker thread, `spawn_blocking`), never on a runtime worker.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use tryout_campaigns::{Campaign, CampaignStatus, Distribution, Offer, Procedure};
use tryout_core::{AggregateRoot, CampaignId, ExpectedVersion, SessionId, StepId, UserId};
use tryout_sessions::{Session, SlotEffect, StepProgress};

use super::r#trait::{SessionChange, SessionStore, StoreError, UnsettledReward};
use crate::slot_ledger::{release_in_tx, reserve_in_tx};

const TESTER_UNIQUE_CONSTRAINT: &str = "sessions_campaign_id_tester_id_key";

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Postgres-backed session store.
///
/// Each commit is one SQL transaction: the versioned session write, the slot
/// counter update and the step-progress upserts. Dropping the transaction on an
/// early return rolls everything back.
#[derive(Debug, Clone)]
pub struct PostgresSessionStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Insert or replace a campaign row.
    #[instrument(skip(self, campaign), fields(campaign_id = %campaign.id), err)]
    pub async fn upsert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, owner_id, title, status, total_slots, available_slots,
                auto_accept_applications, distributions, procedures, offer, ends_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                status = EXCLUDED.status,
                total_slots = EXCLUDED.total_slots,
                available_slots = EXCLUDED.available_slots,
                auto_accept_applications = EXCLUDED.auto_accept_applications,
                distributions = EXCLUDED.distributions,
                procedures = EXCLUDED.procedures,
                offer = EXCLUDED.offer,
                ends_at = EXCLUDED.ends_at
            "#,
        )
        .bind(campaign.id.as_uuid())
        .bind(campaign.owner_id.as_uuid())
        .bind(&campaign.title)
        .bind(campaign_status_str(campaign.status))
        .bind(campaign.total_slots as i32)
        .bind(campaign.available_slots as i32)
        .bind(campaign.auto_accept_applications)
        .bind(Json(&campaign.distributions))
        .bind(Json(&campaign.procedures))
        .bind(Json(&campaign.offer))
        .bind(campaign.ends_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_campaign", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id), err)]
    pub async fn fetch_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, title, status, total_slots, available_slots,
                   auto_accept_applications, distributions, procedures, offer, ends_at
            FROM campaigns
            WHERE id = $1
            "#,
        )
        .bind(campaign_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_campaign", e))?;

        row.map(|r| campaign_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(session_id = %session_id), err)]
    pub async fn fetch_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT state FROM sessions WHERE id = $1")
            .bind(session_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_session", e))?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id, tester_id = %tester_id), err)]
    pub async fn fetch_session_for(
        &self,
        campaign_id: CampaignId,
        tester_id: UserId,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT state FROM sessions WHERE campaign_id = $1 AND tester_id = $2")
            .bind(campaign_id.as_uuid())
            .bind(tester_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_session_for", e))?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(session_id = %session_id, row_count = tracing::field::Empty), err)]
    pub async fn fetch_progress(&self, session_id: SessionId) -> Result<Vec<StepProgress>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, step_id, completed, completed_at, payload, validated_price
            FROM step_progress
            WHERE session_id = $1
            ORDER BY completed_at ASC NULLS LAST
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_progress", e))?;

        let progress = rows
            .iter()
            .map(progress_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("row_count", progress.len());
        Ok(progress)
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id, date = %date), err)]
    pub async fn fetch_scheduled_count(
        &self,
        campaign_id: CampaignId,
        date: NaiveDate,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS scheduled
            FROM sessions
            WHERE campaign_id = $1
              AND scheduled_purchase_date = $2
              AND status NOT IN ('CANCELLED', 'REJECTED')
            "#,
        )
        .bind(campaign_id.as_uuid())
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_scheduled_count", e))?;

        let scheduled: i64 = row
            .try_get("scheduled")
            .map_err(|e| map_sqlx_error("fetch_scheduled_count", e))?;
        Ok(u32::try_from(scheduled).unwrap_or(u32::MAX))
    }

    #[instrument(skip(self), fields(today = %today), err)]
    pub async fn fetch_expired_candidates(&self, today: NaiveDate) -> Result<Vec<SessionId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM sessions
            WHERE scheduled_purchase_date < $1
              AND status IN ('ACCEPTED', 'IN_PROGRESS', 'PROCEDURES_COMPLETED', 'PRICE_VALIDATED')
            ORDER BY id ASC
            "#,
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_expired_candidates", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("id")
                    .map(SessionId::from_uuid)
                    .map_err(|e| map_sqlx_error("fetch_expired_candidates", e))
            })
            .collect()
    }

    /// Persist a transition in one transaction.
    #[instrument(
        skip(self, change),
        fields(
            session_id = %change.session_id(),
            expected_version = ?change.expected_version,
            slot_effect = ?change.slot_effect,
            progress_rows = change.progress.len(),
            available_slots = tracing::field::Empty
        ),
        err
    )]
    pub async fn commit_change(&self, change: SessionChange) -> Result<(), StoreError> {
        let campaign_id = change.campaign_id()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        write_session(&mut tx, &change).await?;

        let remaining = match change.slot_effect {
            SlotEffect::None => None,
            SlotEffect::Reserve => Some(reserve_in_tx(&mut tx, campaign_id).await?),
            SlotEffect::Release => Some(release_in_tx(&mut tx, campaign_id).await?),
        };
        if let Some(remaining) = remaining {
            Span::current().record("available_slots", remaining);
        }

        for row in &change.progress {
            upsert_progress(&mut tx, row).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self, reward), fields(session_id = %reward.session_id, amount = reward.amount), err)]
    pub async fn insert_unsettled(&self, reward: &UnsettledReward) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO unsettled_rewards (session_id, tester_id, amount, memo, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(reward.session_id.as_uuid())
        .bind(reward.tester_id.as_uuid())
        .bind(reward.amount)
        .bind(&reward.memo)
        .bind(&reward.error)
        .bind(reward.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_unsettled", e))?;
        Ok(())
    }
}

async fn write_session(tx: &mut Transaction<'_, Postgres>, change: &SessionChange) -> Result<(), StoreError> {
    let session = &change.session;
    let session_id = change.session_id();
    let state = serde_json::to_value(session)
        .map_err(|e| StoreError::Storage(format!("session serialization failed: {e}")))?;
    let tester_id = session.tester_id().unwrap_or_default();
    let owner_id = session.owner_id().unwrap_or_default();

    match change.expected_version {
        ExpectedVersion(0) => {
            sqlx::query(
                r#"
                INSERT INTO sessions (
                    id, campaign_id, tester_id, owner_id, status,
                    scheduled_purchase_date, version, state
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(session_id.as_uuid())
            .bind(change.campaign_id()?.as_uuid())
            .bind(tester_id.as_uuid())
            .bind(owner_id.as_uuid())
            .bind(session.status().as_str())
            .bind(session.scheduled_purchase_date())
            .bind(session.version() as i64)
            .bind(&state)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if is_tester_unique_violation(&e) {
                    StoreError::DuplicateSession {
                        campaign_id: session.campaign_id().unwrap_or_default(),
                        tester_id,
                    }
                } else {
                    map_sqlx_error("insert_session", e)
                }
            })?;
        }
        ExpectedVersion(expected) => {
            let updated = sqlx::query(
                r#"
                UPDATE sessions
                SET status = $2,
                    scheduled_purchase_date = $3,
                    version = $4,
                    state = $5,
                    updated_at = NOW()
                WHERE id = $1 AND version = $6
                "#,
            )
            .bind(session_id.as_uuid())
            .bind(session.status().as_str())
            .bind(session.scheduled_purchase_date())
            .bind(session.version() as i64)
            .bind(&state)
            .bind(expected as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_session", e))?;

            if updated.rows_affected() == 0 {
                return Err(StoreError::Concurrency(format!(
                    "session {session_id} is no longer at version {expected}"
                )));
            }
        }
    }
    Ok(())
}

async fn upsert_progress(tx: &mut Transaction<'_, Postgres>, row: &StepProgress) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO step_progress (session_id, step_id, completed, completed_at, payload, validated_price)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (session_id, step_id) DO UPDATE SET
            completed = EXCLUDED.completed,
            completed_at = COALESCE(step_progress.completed_at, EXCLUDED.completed_at),
            payload = EXCLUDED.payload,
            validated_price = EXCLUDED.validated_price
        "#,
    )
    .bind(row.session_id.as_uuid())
    .bind(row.step_id.as_uuid())
    .bind(row.completed)
    .bind(row.completed_at)
    .bind(&row.payload)
    .bind(row.validated_price)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_progress", e))?;
    Ok(())
}

fn campaign_status_str(status: CampaignStatus) -> &'static str {
    match status {
        CampaignStatus::Draft => "DRAFT",
        CampaignStatus::Active => "ACTIVE",
        CampaignStatus::Paused => "PAUSED",
        CampaignStatus::Ended => "ENDED",
    }
}

fn parse_campaign_status(raw: &str) -> Result<CampaignStatus, StoreError> {
    match raw {
        "DRAFT" => Ok(CampaignStatus::Draft),
        "ACTIVE" => Ok(CampaignStatus::Active),
        "PAUSED" => Ok(CampaignStatus::Paused),
        "ENDED" => Ok(CampaignStatus::Ended),
        other => Err(StoreError::Storage(format!("unknown campaign status '{other}'"))),
    }
}

fn campaign_from_row(row: &sqlx::postgres::PgRow) -> Result<Campaign, StoreError> {
    let read = |e| map_sqlx_error("read_campaign", e);
    let status: String = row.try_get("status").map_err(read)?;
    let total_slots: i32 = row.try_get("total_slots").map_err(read)?;
    let available_slots: i32 = row.try_get("available_slots").map_err(read)?;
    let Json(distributions): Json<Vec<Distribution>> = row.try_get("distributions").map_err(read)?;
    let Json(procedures): Json<Vec<Procedure>> = row.try_get("procedures").map_err(read)?;
    let Json(offer): Json<Offer> = row.try_get("offer").map_err(read)?;
    let ends_at: Option<DateTime<Utc>> = row.try_get("ends_at").map_err(read)?;

    Ok(Campaign {
        id: CampaignId::from_uuid(row.try_get("id").map_err(read)?),
        owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(read)?),
        title: row.try_get("title").map_err(read)?,
        status: parse_campaign_status(&status)?,
        total_slots: total_slots.max(0) as u32,
        available_slots: available_slots.max(0) as u32,
        auto_accept_applications: row.try_get("auto_accept_applications").map_err(read)?,
        distributions,
        procedures,
        offer,
        ends_at,
    })
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<Session, StoreError> {
    let Json(session): Json<Session> = row
        .try_get("state")
        .map_err(|e| map_sqlx_error("read_session", e))?;
    Ok(session)
}

fn progress_from_row(row: &sqlx::postgres::PgRow) -> Result<StepProgress, StoreError> {
    let read = |e| map_sqlx_error("read_progress", e);
    Ok(StepProgress {
        session_id: SessionId::from_uuid(row.try_get("session_id").map_err(read)?),
        step_id: StepId::from_uuid(row.try_get("step_id").map_err(read)?),
        completed: row.try_get("completed").map_err(read)?,
        completed_at: row.try_get("completed_at").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
        validated_price: row.try_get("validated_price").map_err(read)?,
    })
}

fn is_tester_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
                && db_err.constraint() == Some(TESTER_UNIQUE_CONSTRAINT)
        }
        _ => false,
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Concurrency(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row in {operation}")),
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

impl SessionStore for PostgresSessionStore {
    fn load_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        self.block_on(self.fetch_campaign(campaign_id))
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        self.block_on(self.fetch_session(session_id))
    }

    fn find_session(
        &self,
        campaign_id: CampaignId,
        tester_id: UserId,
    ) -> Result<Option<Session>, StoreError> {
        self.block_on(self.fetch_session_for(campaign_id, tester_id))
    }

    fn load_progress(&self, session_id: SessionId) -> Result<Vec<StepProgress>, StoreError> {
        self.block_on(self.fetch_progress(session_id))
    }

    fn count_scheduled(&self, campaign_id: CampaignId, date: NaiveDate) -> Result<u32, StoreError> {
        self.block_on(self.fetch_scheduled_count(campaign_id, date))
    }

    fn expired_candidates(&self, today: NaiveDate) -> Result<Vec<SessionId>, StoreError> {
        self.block_on(self.fetch_expired_candidates(today))
    }

    fn commit(&self, change: SessionChange) -> Result<(), StoreError> {
        self.block_on(self.commit_change(change))
    }

    fn record_unsettled(&self, reward: UnsettledReward) -> Result<(), StoreError> {
        self.block_on(self.insert_unsettled(&reward))
    }
}
