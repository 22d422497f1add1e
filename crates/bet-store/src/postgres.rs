use async_trait::async_trait;
use bet_domain::{Amount, Bet, BetId, BetStatus, PayeeId, TraceId};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    BetRepository, BetStoreError, EventInsertOutcome, SettlementEventRecord,
    SettlementEventRepository,
};

/// Durable bet repository. The status-conditioned update is expressed directly
/// in SQL: `UPDATE ... WHERE bet_id = $1 AND status = $expected`, so stale
/// writers lose the race at the database, not in application code.
#[derive(Debug, Clone)]
pub struct PostgresBetRepository {
    pool: PgPool,
}

impl PostgresBetRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> BetStoreError {
    BetStoreError::Database(e.to_string())
}

fn parse_status(raw: &str) -> Result<BetStatus, BetStoreError> {
    match raw {
        "draft" => Ok(BetStatus::Draft),
        "pending" => Ok(BetStatus::Pending),
        "active" => Ok(BetStatus::Active),
        "won" => Ok(BetStatus::Won),
        "lost" => Ok(BetStatus::Lost),
        "payment_failed" => Ok(BetStatus::PaymentFailed),
        "cancelled" => Ok(BetStatus::Cancelled),
        other => Err(BetStoreError::Serialization(format!(
            "unknown bet status {other}"
        ))),
    }
}

fn amount_to_db(amount: Amount) -> Result<i64, BetStoreError> {
    i64::try_from(amount.as_minor())
        .map_err(|_| BetStoreError::Serialization("amount exceeds i64".to_string()))
}

fn amount_from_db(raw: i64) -> Result<Amount, BetStoreError> {
    u64::try_from(raw)
        .map(Amount)
        .map_err(|_| BetStoreError::Serialization("negative amount in storage".to_string()))
}

fn opt_amount_to_db(amount: Option<Amount>) -> Result<Option<i64>, BetStoreError> {
    amount.map(amount_to_db).transpose()
}

fn row_to_bet(row: &sqlx::postgres::PgRow) -> Result<Bet, BetStoreError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    Ok(Bet {
        bet_id: BetId(row.try_get::<Uuid, _>("bet_id").map_err(db_err)?),
        status: parse_status(&status_raw)?,
        stake_amount: amount_from_db(row.try_get("stake_amount").map_err(db_err)?)?,
        platform_fee_amount: row
            .try_get::<Option<i64>, _>("platform_fee_amount")
            .map_err(db_err)?
            .map(amount_from_db)
            .transpose()?,
        donation_amount: row
            .try_get::<Option<i64>, _>("donation_amount")
            .map_err(db_err)?
            .map(amount_from_db)
            .transpose()?,
        refund_amount: row
            .try_get::<Option<i64>, _>("refund_amount")
            .map_err(db_err)?
            .map(amount_from_db)
            .transpose()?,
        fee_rate_bps_applied: row
            .try_get::<Option<i16>, _>("fee_rate_bps_applied")
            .map_err(db_err)?
            .map(|v| {
                u16::try_from(v).map_err(|_| {
                    BetStoreError::Serialization("negative fee rate in storage".to_string())
                })
            })
            .transpose()?,
        payee_id: row
            .try_get::<Option<Uuid>, _>("payee_id")
            .map_err(db_err)?
            .map(PayeeId),
        payee_destination: row.try_get("payee_destination").map_err(db_err)?,
        hold_ref: row.try_get("hold_ref").map_err(db_err)?,
        capture_ref: row.try_get("capture_ref").map_err(db_err)?,
        transfer_ref: row.try_get("transfer_ref").map_err(db_err)?,
        refund_ref: row.try_get("refund_ref").map_err(db_err)?,
        release_ref: row.try_get("release_ref").map_err(db_err)?,
        transfer_pending: row.try_get("transfer_pending").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        escrow_captured_at: row.try_get("escrow_captured_at").map_err(db_err)?,
        resolved_at: row.try_get("resolved_at").map_err(db_err)?,
    })
}

const SELECT_BET_COLUMNS: &str = "SELECT bet_id, status, stake_amount, platform_fee_amount, \
     donation_amount, refund_amount, fee_rate_bps_applied, payee_id, payee_destination, \
     hold_ref, capture_ref, transfer_ref, refund_ref, release_ref, transfer_pending, \
     created_at, escrow_captured_at, resolved_at FROM bets";

#[async_trait]
impl BetRepository for PostgresBetRepository {
    async fn insert_bet(&self, bet: &Bet) -> Result<(), BetStoreError> {
        let result = sqlx::query(
            "INSERT INTO bets (bet_id, status, stake_amount, platform_fee_amount, \
             donation_amount, refund_amount, fee_rate_bps_applied, payee_id, \
             payee_destination, hold_ref, capture_ref, transfer_ref, refund_ref, \
             release_ref, transfer_pending, created_at, escrow_captured_at, resolved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             ON CONFLICT (bet_id) DO NOTHING",
        )
        .bind(bet.bet_id.0)
        .bind(bet.status.as_str())
        .bind(amount_to_db(bet.stake_amount)?)
        .bind(opt_amount_to_db(bet.platform_fee_amount)?)
        .bind(opt_amount_to_db(bet.donation_amount)?)
        .bind(opt_amount_to_db(bet.refund_amount)?)
        .bind(bet.fee_rate_bps_applied.map(i16::try_from).transpose().map_err(
            |_| BetStoreError::Serialization("fee rate exceeds i16".to_string()),
        )?)
        .bind(bet.payee_id.map(|p| p.0))
        .bind(bet.payee_destination.as_deref())
        .bind(bet.hold_ref.as_deref())
        .bind(bet.capture_ref.as_deref())
        .bind(bet.transfer_ref.as_deref())
        .bind(bet.refund_ref.as_deref())
        .bind(bet.release_ref.as_deref())
        .bind(bet.transfer_pending)
        .bind(bet.created_at)
        .bind(bet.escrow_captured_at)
        .bind(bet.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BetStoreError::DuplicateBet(bet.bet_id));
        }
        Ok(())
    }

    async fn get_bet(&self, bet_id: BetId) -> Result<Option<Bet>, BetStoreError> {
        let row = sqlx::query(&format!("{SELECT_BET_COLUMNS} WHERE bet_id = $1"))
            .bind(bet_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_bet).transpose()
    }

    async fn find_by_hold_ref(&self, hold_ref: &str) -> Result<Option<Bet>, BetStoreError> {
        let row = sqlx::query(&format!("{SELECT_BET_COLUMNS} WHERE hold_ref = $1"))
            .bind(hold_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_bet).transpose()
    }

    async fn find_by_charge_ref(&self, charge_ref: &str) -> Result<Option<Bet>, BetStoreError> {
        let row = sqlx::query(&format!("{SELECT_BET_COLUMNS} WHERE capture_ref = $1"))
            .bind(charge_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_bet).transpose()
    }

    async fn update_bet(&self, bet: &Bet, expected_status: BetStatus) -> Result<(), BetStoreError> {
        let result = sqlx::query(
            "UPDATE bets SET status = $1, platform_fee_amount = $2, donation_amount = $3, \
             refund_amount = $4, fee_rate_bps_applied = $5, hold_ref = $6, capture_ref = $7, \
             transfer_ref = $8, refund_ref = $9, release_ref = $10, transfer_pending = $11, \
             escrow_captured_at = $12, resolved_at = $13 \
             WHERE bet_id = $14 AND status = $15",
        )
        .bind(bet.status.as_str())
        .bind(opt_amount_to_db(bet.platform_fee_amount)?)
        .bind(opt_amount_to_db(bet.donation_amount)?)
        .bind(opt_amount_to_db(bet.refund_amount)?)
        .bind(bet.fee_rate_bps_applied.map(i16::try_from).transpose().map_err(
            |_| BetStoreError::Serialization("fee rate exceeds i16".to_string()),
        )?)
        .bind(bet.hold_ref.as_deref())
        .bind(bet.capture_ref.as_deref())
        .bind(bet.transfer_ref.as_deref())
        .bind(bet.refund_ref.as_deref())
        .bind(bet.release_ref.as_deref())
        .bind(bet.transfer_pending)
        .bind(bet.escrow_captured_at)
        .bind(bet.resolved_at)
        .bind(bet.bet_id.0)
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Distinguish a vanished row from a lost race.
            let current = self.get_bet(bet.bet_id).await?;
            return match current {
                None => Err(BetStoreError::BetNotFound(bet.bet_id)),
                Some(found) => Err(BetStoreError::StaleStatus {
                    bet_id: bet.bet_id,
                    expected: expected_status,
                    found: found.status,
                }),
            };
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresSettlementEventRepository {
    pool: PgPool,
}

impl PostgresSettlementEventRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<SettlementEventRecord, BetStoreError> {
    Ok(SettlementEventRecord {
        event_id: row.try_get("event_id").map_err(db_err)?,
        bet_id: BetId(row.try_get::<Uuid, _>("bet_id").map_err(db_err)?),
        event_kind: row.try_get("event_kind").map_err(db_err)?,
        event_source: row.try_get("event_source").map_err(db_err)?,
        related_ref: row.try_get("related_ref").map_err(db_err)?,
        amount: row
            .try_get::<Option<i64>, _>("amount")
            .map_err(db_err)?
            .map(amount_from_db)
            .transpose()?,
        payload_json: row.try_get("payload_json").map_err(db_err)?,
        occurred_at: row.try_get("occurred_at").map_err(db_err)?,
        recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at").map_err(db_err)?,
        trace_id: TraceId(row.try_get::<Uuid, _>("trace_id").map_err(db_err)?),
    })
}

#[async_trait]
impl SettlementEventRepository for PostgresSettlementEventRepository {
    async fn insert_event(
        &self,
        record: &SettlementEventRecord,
    ) -> Result<EventInsertOutcome, BetStoreError> {
        let result = sqlx::query(
            "INSERT INTO settlement_events (event_id, bet_id, event_kind, event_source, \
             related_ref, amount, payload_json, occurred_at, recorded_at, trace_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&record.event_id)
        .bind(record.bet_id.0)
        .bind(&record.event_kind)
        .bind(&record.event_source)
        .bind(record.related_ref.as_deref())
        .bind(opt_amount_to_db(record.amount)?)
        .bind(&record.payload_json)
        .bind(record.occurred_at)
        .bind(record.recorded_at)
        .bind(record.trace_id.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            Ok(EventInsertOutcome::Duplicate)
        } else {
            Ok(EventInsertOutcome::Recorded)
        }
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), BetStoreError> {
        sqlx::query("DELETE FROM settlement_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_events_for_bet(
        &self,
        bet_id: BetId,
    ) -> Result<Vec<SettlementEventRecord>, BetStoreError> {
        let rows = sqlx::query(
            "SELECT event_id, bet_id, event_kind, event_source, related_ref, amount, \
             payload_json, occurred_at, recorded_at, trace_id \
             FROM settlement_events WHERE bet_id = $1 ORDER BY recorded_at",
        )
        .bind(bet_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_event).collect()
    }
}
