//! Core data models for the settlement engine
//!
//! This module contains the persisted records (escrows and their event log),
//! the lifecycle enums, and the derived view that API callers see.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{EscrowError, EscrowResult};

/// Decimal places of the ledger's native unit
pub const LEDGER_DECIMALS: u32 = 18;

/// Serialize `u128` amounts as decimal strings
pub mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Escrow lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    /// Created, waiting for the buyer's deposit
    AwaitingFund,
    /// Deposit verified and held by the contract
    Funded,
    /// Reserved for shipping workflows; no transition leads here
    AwaitingDelivery,
    /// Funds released, refunded or settled by arbitration
    Complete,
    /// Under arbitration
    Disputed,
}

impl EscrowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingFund => "awaiting_fund",
            Self::Funded => "funded",
            Self::AwaitingDelivery => "awaiting_delivery",
            Self::Complete => "complete",
            Self::Disputed => "disputed",
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for EscrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowState {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_fund" => Ok(Self::AwaitingFund),
            "funded" => Ok(Self::Funded),
            "awaiting_delivery" => Ok(Self::AwaitingDelivery),
            "complete" => Ok(Self::Complete),
            "disputed" => Ok(Self::Disputed),
            other => Err(EscrowError::validation(format!("Unknown escrow state: {other}"))),
        }
    }
}

/// Actions that move an escrow between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowAction {
    Fund,
    ConfirmDelivery,
    RaiseDispute,
    TimeoutRefund,
    Resolve,
}

impl EscrowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fund => "fund",
            Self::ConfirmDelivery => "confirm_delivery",
            Self::RaiseDispute => "raise_dispute",
            Self::TimeoutRefund => "timeout_refund",
            Self::Resolve => "resolve",
        }
    }

    /// The only state this action may start from
    pub fn from_state(&self) -> EscrowState {
        match self {
            Self::Fund => EscrowState::AwaitingFund,
            Self::ConfirmDelivery | Self::RaiseDispute | Self::TimeoutRefund => EscrowState::Funded,
            Self::Resolve => EscrowState::Disputed,
        }
    }

    /// The state this action leads to
    pub fn target_state(&self) -> EscrowState {
        match self {
            Self::Fund => EscrowState::Funded,
            Self::RaiseDispute => EscrowState::Disputed,
            Self::ConfirmDelivery | Self::TimeoutRefund | Self::Resolve => EscrowState::Complete,
        }
    }

    /// Event kind recorded when this action succeeds
    pub fn event_kind(&self) -> EscrowEventKind {
        match self {
            Self::Fund => EscrowEventKind::Funded,
            Self::ConfirmDelivery => EscrowEventKind::DeliveryConfirmed,
            Self::RaiseDispute => EscrowEventKind::Disputed,
            Self::TimeoutRefund => EscrowEventKind::TimeoutRefund,
            Self::Resolve => EscrowEventKind::Resolved,
        }
    }
}

impl fmt::Display for EscrowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowAction {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fund" => Ok(Self::Fund),
            "confirm_delivery" => Ok(Self::ConfirmDelivery),
            "raise_dispute" => Ok(Self::RaiseDispute),
            "timeout_refund" => Ok(Self::TimeoutRefund),
            "resolve" => Ok(Self::Resolve),
            other => Err(EscrowError::validation(format!("Unknown escrow action: {other}"))),
        }
    }
}

/// Kinds of entries in the escrow event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowEventKind {
    Created,
    Funded,
    DeliveryConfirmed,
    Released,
    Disputed,
    Resolved,
    TimeoutRefund,
}

impl EscrowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::DeliveryConfirmed => "delivery_confirmed",
            Self::Released => "released",
            Self::Disputed => "disputed",
            Self::Resolved => "resolved",
            Self::TimeoutRefund => "timeout_refund",
        }
    }
}

impl fmt::Display for EscrowEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowEventKind {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "funded" => Ok(Self::Funded),
            "delivery_confirmed" => Ok(Self::DeliveryConfirmed),
            "released" => Ok(Self::Released),
            "disputed" => Ok(Self::Disputed),
            "resolved" => Ok(Self::Resolved),
            "timeout_refund" => Ok(Self::TimeoutRefund),
            other => Err(EscrowError::validation(format!("Unknown event kind: {other}"))),
        }
    }
}

/// Escrow record mirroring one on-chain trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,

    // Ledger linkage
    pub onchain_trade_id: Option<u64>,
    pub onchain_tx_hash: Option<String>,

    /// Amount in the smallest ledger unit
    #[serde(with = "amount_string")]
    pub amount: u128,

    pub state: EscrowState,
    /// Action that moved the escrow into `complete`
    pub completed_by: Option<EscrowAction>,
    pub confirmations: u64,
    pub is_confirmed: bool,
    pub timeout_at: DateTime<Utc>,

    // Narrative
    pub metadata: Option<serde_json::Value>,
    pub dispute_reason: Option<String>,
    pub resolution_notes: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
}

impl Escrow {
    /// Create a new escrow in `AwaitingFund`
    pub fn new(
        contract_id: Uuid,
        buyer_id: Uuid,
        seller_id: Uuid,
        amount: u128,
        timeout_at: DateTime<Utc>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contract_id,
            buyer_id,
            seller_id,
            onchain_trade_id: None,
            onchain_tx_hash: None,
            amount,
            state: EscrowState::AwaitingFund,
            completed_by: None,
            confirmations: 0,
            is_confirmed: false,
            timeout_at,
            metadata,
            dispute_reason: None,
            resolution_notes: None,
            created_at: now,
            updated_at: now,
            funded_at: None,
            completed_at: None,
            disputed_at: None,
        }
    }

    /// Whether `action` is what brought the escrow to its current state.
    /// Three actions end in `complete`, so only the one recorded in
    /// `completed_by` counts there.
    pub fn reached_by(&self, action: EscrowAction) -> bool {
        self.state == action.target_state()
            && (self.state != EscrowState::Complete || self.completed_by == Some(action))
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, EscrowState::AwaitingFund | EscrowState::Funded)
    }

    pub fn can_be_funded(&self) -> bool {
        self.state == EscrowState::AwaitingFund
    }

    pub fn can_confirm_delivery(&self) -> bool {
        self.state == EscrowState::Funded
    }

    pub fn can_raise_dispute(&self) -> bool {
        self.state == EscrowState::Funded
    }

    pub fn can_timeout_refund(&self, now: DateTime<Utc>) -> bool {
        self.state == EscrowState::Funded && now >= self.timeout_at
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    /// Amount in whole ledger units; `None` if it exceeds decimal precision
    pub fn display_amount(&self) -> Option<Decimal> {
        let raw = i128::try_from(self.amount).ok()?;
        Decimal::try_from_i128_with_scale(raw, LEDGER_DECIMALS).ok()
    }
}

/// Append-only log entry for an escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub id: i64,
    pub escrow_id: Uuid,
    pub kind: EscrowEventKind,
    pub payload: serde_json::Value,

    // Ledger position, present for observed contract events
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub log_index: Option<u64>,

    // Processing bookkeeping
    pub is_processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
}

impl EscrowEvent {
    pub fn idempotency_key(&self) -> Option<(String, u64)> {
        match (&self.tx_hash, self.log_index) {
            (Some(hash), Some(index)) => Some((hash.clone(), index)),
            _ => None,
        }
    }
}

/// Event to be appended; the store assigns id and creation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEscrowEvent {
    pub escrow_id: Uuid,
    pub kind: EscrowEventKind,
    pub payload: serde_json::Value,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub log_index: Option<u64>,
    pub is_processed: bool,
    pub error_message: Option<String>,
}

impl NewEscrowEvent {
    /// Locally originated event, processed on insert
    pub fn local(escrow_id: Uuid, kind: EscrowEventKind, payload: serde_json::Value) -> Self {
        Self {
            escrow_id,
            kind,
            payload,
            tx_hash: None,
            block_number: None,
            block_hash: None,
            log_index: None,
            is_processed: true,
            error_message: None,
        }
    }

    /// Attach a transaction hash without a log position
    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    /// Attach the full ledger position of an observed contract log
    pub fn at_position(
        mut self,
        tx_hash: impl Into<String>,
        block_number: u64,
        block_hash: impl Into<String>,
        log_index: u64,
    ) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self.block_number = Some(block_number);
        self.block_hash = Some(block_hash.into());
        self.log_index = Some(log_index);
        self
    }

    /// Mark as not yet applied, with the reason
    pub fn unprocessed(mut self, error: impl Into<String>) -> Self {
        self.is_processed = false;
        self.error_message = Some(error.into());
        self
    }

    pub fn idempotency_key(&self) -> Option<(String, u64)> {
        match (&self.tx_hash, self.log_index) {
            (Some(hash), Some(index)) => Some((hash.clone(), index)),
            _ => None,
        }
    }
}

/// Platform role of an authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// Authenticated identity passed in by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::User,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Dispute settlement outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// Full amount back to the buyer
    Refund,
    /// Full amount to the seller
    Payout,
    /// Admin-specified recipient and amount
    Partial,
}

impl ResolutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refund => "refund",
            Self::Payout => "payout",
            Self::Partial => "partial",
        }
    }
}

/// Listing filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowFilter {
    pub state: Option<EscrowState>,
    pub contract_id: Option<Uuid>,
    /// Restrict to escrows where this user is buyer or seller
    pub party_id: Option<Uuid>,
}

/// One-based pagination request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}

impl PageRequest {
    pub const MAX_LIMIT: u32 = 100;

    pub fn validate(&self) -> EscrowResult<()> {
        if self.page < 1 {
            return Err(EscrowError::validation("page must be at least 1"));
        }
        if self.limit < 1 || self.limit > Self::MAX_LIMIT {
            return Err(EscrowError::validation(format!(
                "limit must be between 1 and {}",
                Self::MAX_LIMIT
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.limit as u64
    }
}

/// A page of results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        let shown = request.offset() + items.len() as u64;
        Self {
            items,
            total,
            page: request.page,
            limit: request.limit,
            has_next: shown < total,
            has_prev: request.page > 1,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
            has_next: self.has_next,
            has_prev: self.has_prev,
        }
    }
}

/// Escrow plus the predicates derived from it at read time
#[derive(Debug, Clone, Serialize)]
pub struct EscrowView {
    #[serde(flatten)]
    pub escrow: Escrow,
    pub display_amount: Option<Decimal>,
    pub is_active: bool,
    pub can_be_funded: bool,
    pub can_confirm_delivery: bool,
    pub can_raise_dispute: bool,
    pub can_timeout_refund: bool,
}

impl EscrowView {
    pub fn new(escrow: Escrow, now: DateTime<Utc>) -> Self {
        Self {
            display_amount: escrow.display_amount(),
            is_active: escrow.is_active(),
            can_be_funded: escrow.can_be_funded(),
            can_confirm_delivery: escrow.can_confirm_delivery(),
            can_raise_dispute: escrow.can_raise_dispute(),
            can_timeout_refund: escrow.can_timeout_refund(now),
            escrow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn escrow(amount: u128) -> Escrow {
        Escrow::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            amount,
            Utc::now() + Duration::days(30),
            None,
        )
    }

    #[test]
    fn test_new_escrow_awaits_funding() {
        let e = escrow(5);
        assert_eq!(e.state, EscrowState::AwaitingFund);
        assert!(e.can_be_funded());
        assert!(e.is_active());
        assert!(!e.can_confirm_delivery());
        assert!(!e.can_raise_dispute());
    }

    #[test]
    fn test_display_amount() {
        let e = escrow(1_500_000_000_000_000_000);
        assert_eq!(e.display_amount().unwrap(), Decimal::new(15, 1));
        assert_eq!(escrow(1).display_amount().unwrap().to_string(), "0.000000000000000001");
    }

    #[test]
    fn test_timeout_predicate() {
        let mut e = escrow(5);
        e.state = EscrowState::Funded;
        assert!(!e.can_timeout_refund(Utc::now()));
        assert!(e.can_timeout_refund(e.timeout_at));
        assert!(e.can_timeout_refund(e.timeout_at + Duration::seconds(1)));

        e.state = EscrowState::Disputed;
        assert!(!e.can_timeout_refund(e.timeout_at + Duration::days(1)));
    }

    #[test]
    fn test_action_table() {
        assert_eq!(EscrowAction::Fund.from_state(), EscrowState::AwaitingFund);
        assert_eq!(EscrowAction::Resolve.from_state(), EscrowState::Disputed);
        assert_eq!(EscrowAction::RaiseDispute.target_state(), EscrowState::Disputed);
        assert_eq!(EscrowAction::TimeoutRefund.target_state(), EscrowState::Complete);
        assert_eq!(
            EscrowAction::ConfirmDelivery.event_kind(),
            EscrowEventKind::DeliveryConfirmed
        );
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            EscrowState::AwaitingFund,
            EscrowState::Funded,
            EscrowState::AwaitingDelivery,
            EscrowState::Complete,
            EscrowState::Disputed,
        ] {
            assert_eq!(state.as_str().parse::<EscrowState>().unwrap(), state);
        }
        assert!("pending".parse::<EscrowState>().is_err());
    }

    #[test]
    fn test_idempotency_key_requires_both_fields() {
        let id = Uuid::new_v4();
        let local = NewEscrowEvent::local(id, EscrowEventKind::Funded, serde_json::json!({}));
        assert!(local.idempotency_key().is_none());
        assert!(local.clone().with_tx_hash("0xabc").idempotency_key().is_none());

        let observed = local.at_position("0xabc", 10, "0xblock", 2);
        assert_eq!(observed.idempotency_key(), Some(("0xabc".to_string(), 2)));
    }

    #[test]
    fn test_pagination() {
        assert!(PageRequest { page: 0, limit: 10 }.validate().is_err());
        assert!(PageRequest { page: 1, limit: 0 }.validate().is_err());
        assert!(PageRequest { page: 1, limit: 101 }.validate().is_err());

        let request = PageRequest { page: 2, limit: 10 };
        assert_eq!(request.offset(), 10);
        let page = Page::new(vec![1; 10], 25, request);
        assert!(page.has_next);
        assert!(page.has_prev);

        let last = Page::new(vec![1; 5], 25, PageRequest { page: 3, limit: 10 });
        assert!(!last.has_next);
    }

    #[test]
    fn test_view_serializes_amount_as_string() {
        let view = EscrowView::new(escrow(42), Utc::now());
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["amount"], "42");
        assert_eq!(json["state"], "awaiting_fund");
        assert_eq!(json["can_be_funded"], true);
    }
}
