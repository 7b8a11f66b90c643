//! Escrow Ledger - durable escrows and their event history
//!
//! The store is the single source of truth for local state. Every mutation
//! goes through [`EscrowStore::commit`], which applies a list of operations
//! as one atomic unit. Transitions are conditional on the escrow still being
//! in the planned `from` state, so the API path and the reconciler can race
//! on the same escrow without losing or duplicating a transition.
//!
//! A funding transaction backs exactly one escrow: a transition or link that
//! would give a second escrow a hash another escrow already holds, or one
//! already recorded there as funding, is rejected inside the commit.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, StoreConfig};

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Escrow, EscrowEvent, EscrowFilter, EscrowState, NewEscrowEvent, Page, PageRequest};
use crate::state_machine::{StateChange, TransitionRecord};
use crate::{EscrowError, EscrowResult};

/// One mutation inside an atomic commit
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Conditional state change plus the event that records it
    Transition(TransitionRecord),
    /// Event without a state change
    Append(NewEscrowEvent),
    /// Link an on-chain trade to an escrow and record the creation event
    LinkTrade {
        escrow_id: Uuid,
        trade_id: u64,
        tx_hash: String,
        event: NewEscrowEvent,
    },
    /// Retry of a previously recorded, unprocessed ledger event
    Settle {
        event_id: i64,
        change: Option<StateChange>,
    },
    /// Record a failed retry attempt
    Fail { event_id: i64, error: String },
}

/// What a single operation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Applied,
    /// The same action already moved the escrow to the target state
    AlreadyApplied,
    /// The escrow was in neither the source nor the target state
    Conflict { actual: EscrowState, reason: String },
    /// The funding transaction is already bound to another escrow
    Rejected { reason: String },
    /// An event with the same idempotency key already exists
    Duplicate,
}

impl OpOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Decision for a conditional transition against the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionCheck {
    Apply,
    AlreadyApplied,
    Conflict,
}

pub(crate) fn check_transition(current: &Escrow, change: &StateChange) -> TransitionCheck {
    if current.state == change.from {
        TransitionCheck::Apply
    } else if current.reached_by(change.action) {
        TransitionCheck::AlreadyApplied
    } else {
        TransitionCheck::Conflict
    }
}

pub(crate) fn conflict_reason(current: EscrowState, change: &StateChange) -> String {
    EscrowError::state_conflict(current.as_str(), change.action.as_str()).to_string()
}

pub(crate) fn tx_taken_reason(tx_hash: &str) -> String {
    format!("Transaction {tx_hash} already funds another escrow")
}

/// Persistence interface shared by the API path and the reconciler
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Insert a new escrow; fails if one already exists for its contract
    async fn insert_escrow(&self, escrow: &Escrow) -> EscrowResult<()>;

    async fn escrow(&self, id: Uuid) -> EscrowResult<Option<Escrow>>;

    async fn escrow_by_trade_id(&self, trade_id: u64) -> EscrowResult<Option<Escrow>>;

    /// Newest first
    async fn list_escrows(&self, filter: &EscrowFilter, page: PageRequest) -> EscrowResult<Page<Escrow>>;

    /// Event history in insertion order
    async fn events(&self, escrow_id: Uuid) -> EscrowResult<Vec<EscrowEvent>>;

    async fn has_event(&self, tx_hash: &str, log_index: u64) -> EscrowResult<bool>;

    /// Highest block among processed ledger events
    async fn last_processed_block(&self) -> EscrowResult<Option<u64>>;

    /// Unprocessed ledger events still under the retry limit, in ledger order
    async fn pending_ledger_events(&self, max_retries: u32, limit: usize) -> EscrowResult<Vec<EscrowEvent>>;

    /// Raise the confirmation count for the escrow's linked transaction.
    /// Never lowers it, and ignores a hash that is not the linked one.
    async fn record_confirmations(
        &self,
        escrow_id: Uuid,
        tx_hash: &str,
        confirmations: u64,
        is_confirmed: bool,
    ) -> EscrowResult<Escrow>;

    /// Apply all operations atomically; outcomes are returned in order
    async fn commit(&self, ops: Vec<StoreOp>) -> EscrowResult<Vec<OpOutcome>>;
}
