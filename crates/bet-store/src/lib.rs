use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bet_domain::{Amount, Bet, BetId, BetStatus, TraceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod postgres;

pub use postgres::{PostgresBetRepository, PostgresSettlementEventRepository};

#[derive(Debug, Error)]
pub enum BetStoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("bet {0} already exists")]
    DuplicateBet(BetId),
    #[error("bet {0} not found")]
    BetNotFound(BetId),
    /// The status-conditioned commit found a different status than the writer
    /// read. The writer is stale and must re-read instead of overwriting.
    #[error("stale status for bet {bet_id}: expected {expected}, found {found}")]
    StaleStatus {
        bet_id: BetId,
        expected: BetStatus,
        found: BetStatus,
    },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Append-only record of one settlement-relevant occurrence, produced by both
/// explicit resolution calls and webhook notifications. `event_id` carries the
/// uniqueness constraint that enforces webhook dedup at the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEventRecord {
    pub event_id: String,
    pub bet_id: BetId,
    pub event_kind: String,
    pub event_source: String,
    pub related_ref: Option<String>,
    pub amount: Option<Amount>,
    pub payload_json: Value,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub trace_id: TraceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventInsertOutcome {
    Recorded,
    /// The event id was already present; the caller must treat the event as
    /// applied and do nothing.
    Duplicate,
}

#[async_trait]
pub trait BetRepository: Send + Sync {
    async fn insert_bet(&self, bet: &Bet) -> Result<(), BetStoreError>;

    async fn get_bet(&self, bet_id: BetId) -> Result<Option<Bet>, BetStoreError>;

    async fn find_by_hold_ref(&self, hold_ref: &str) -> Result<Option<Bet>, BetStoreError>;

    async fn find_by_charge_ref(&self, charge_ref: &str) -> Result<Option<Bet>, BetStoreError>;

    /// Commits `bet` only if the stored status still equals `expected_status`.
    /// This is the optimistic-concurrency point: a writer whose precondition
    /// no longer holds gets `StaleStatus` back, never a silent overwrite.
    async fn update_bet(&self, bet: &Bet, expected_status: BetStatus) -> Result<(), BetStoreError>;
}

#[async_trait]
pub trait SettlementEventRepository: Send + Sync {
    async fn insert_event(
        &self,
        record: &SettlementEventRecord,
    ) -> Result<EventInsertOutcome, BetStoreError>;

    /// Removes a claimed event id so a redelivery can claim it again. Used
    /// when the state change the claim was made for did not commit.
    async fn delete_event(&self, event_id: &str) -> Result<(), BetStoreError>;

    async fn list_events_for_bet(
        &self,
        bet_id: BetId,
    ) -> Result<Vec<SettlementEventRecord>, BetStoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryBetRepository {
    bets: Arc<Mutex<HashMap<BetId, Bet>>>,
}

impl InMemoryBetRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find_by<F: Fn(&Bet) -> bool>(&self, pred: F) -> Result<Option<Bet>, BetStoreError> {
        let bets = self.bets.lock().map_err(|_| BetStoreError::LockPoisoned)?;
        Ok(bets.values().find(|b| pred(b)).cloned())
    }
}

#[async_trait]
impl BetRepository for InMemoryBetRepository {
    async fn insert_bet(&self, bet: &Bet) -> Result<(), BetStoreError> {
        let mut bets = self.bets.lock().map_err(|_| BetStoreError::LockPoisoned)?;
        if bets.contains_key(&bet.bet_id) {
            return Err(BetStoreError::DuplicateBet(bet.bet_id));
        }
        bets.insert(bet.bet_id, bet.clone());
        Ok(())
    }

    async fn get_bet(&self, bet_id: BetId) -> Result<Option<Bet>, BetStoreError> {
        let bets = self.bets.lock().map_err(|_| BetStoreError::LockPoisoned)?;
        Ok(bets.get(&bet_id).cloned())
    }

    async fn find_by_hold_ref(&self, hold_ref: &str) -> Result<Option<Bet>, BetStoreError> {
        self.find_by(|b| b.hold_ref.as_deref() == Some(hold_ref))
    }

    async fn find_by_charge_ref(&self, charge_ref: &str) -> Result<Option<Bet>, BetStoreError> {
        self.find_by(|b| b.capture_ref.as_deref() == Some(charge_ref))
    }

    async fn update_bet(&self, bet: &Bet, expected_status: BetStatus) -> Result<(), BetStoreError> {
        let mut bets = self.bets.lock().map_err(|_| BetStoreError::LockPoisoned)?;
        let stored = bets
            .get_mut(&bet.bet_id)
            .ok_or(BetStoreError::BetNotFound(bet.bet_id))?;
        if stored.status != expected_status {
            return Err(BetStoreError::StaleStatus {
                bet_id: bet.bet_id,
                expected: expected_status,
                found: stored.status,
            });
        }
        *stored = bet.clone();
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemorySettlementEventRepository {
    events: Arc<Mutex<Vec<SettlementEventRecord>>>,
    seen_ids: Arc<Mutex<HashSet<String>>>,
}

impl InMemorySettlementEventRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_snapshot(&self) -> Vec<SettlementEventRecord> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SettlementEventRepository for InMemorySettlementEventRepository {
    async fn insert_event(
        &self,
        record: &SettlementEventRecord,
    ) -> Result<EventInsertOutcome, BetStoreError> {
        let mut seen = self
            .seen_ids
            .lock()
            .map_err(|_| BetStoreError::LockPoisoned)?;
        if !seen.insert(record.event_id.clone()) {
            return Ok(EventInsertOutcome::Duplicate);
        }
        self.events
            .lock()
            .map_err(|_| BetStoreError::LockPoisoned)?
            .push(record.clone());
        Ok(EventInsertOutcome::Recorded)
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), BetStoreError> {
        self.seen_ids
            .lock()
            .map_err(|_| BetStoreError::LockPoisoned)?
            .remove(event_id);
        self.events
            .lock()
            .map_err(|_| BetStoreError::LockPoisoned)?
            .retain(|e| e.event_id != event_id);
        Ok(())
    }

    async fn list_events_for_bet(
        &self,
        bet_id: BetId,
    ) -> Result<Vec<SettlementEventRecord>, BetStoreError> {
        let events = self
            .events
            .lock()
            .map_err(|_| BetStoreError::LockPoisoned)?;
        Ok(events
            .iter()
            .filter(|e| e.bet_id == bet_id)
            .cloned()
            .collect())
    }
}
