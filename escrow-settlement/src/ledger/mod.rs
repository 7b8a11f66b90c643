//! Ledger Gateway - access to the external escrow contract ledger
//!
//! The gateway is the only component that talks to the ledger node. It reads
//! transactions, receipts and blocks, queries the escrow contract's event
//! logs, and submits custodial transactions signed with a locally held key.
//! The engine and the reconciler receive it as an injected
//! `Arc<dyn LedgerGateway>` so tests can substitute a scripted fake.

pub mod contract;
pub mod rpc;

pub use alloy::primitives::{Address, TxHash};
pub use rpc::{LedgerConfig, RpcLedgerGateway};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the ledger gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transaction, receipt or block is unknown to the node (yet)
    #[error("not found: {0}")]
    NotFound(String),

    /// Call reverted or the transaction failed on-chain
    #[error("reverted: {0}")]
    Reverted(String),

    /// Node refused the request (bad nonce, insufficient funds, ...)
    #[error("rejected by node: {0}")]
    Rejected(String),

    /// Network, timeout or node availability problem
    #[error("transport error: {0}")]
    Transport(String),

    /// Node answered with data we could not decode
    #[error("decode error: {0}")]
    Decode(String),

    /// Local signing failure or missing custodial key
    #[error("signing error: {0}")]
    Signing(String),
}

impl LedgerError {
    /// Only transport failures are worth retrying unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result alias for gateway calls
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Transaction body as returned by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub value: u128,
    pub nonce: u64,
    pub block_number: Option<u64>,
    pub input: Vec<u8>,
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_hash: String,
    pub success: bool,
}

/// Combined live view of a transaction, used by status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub value: u128,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub success: Option<bool>,
    pub confirmations: u64,
}

/// Escrow contract functions the platform can call custodially
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractFunction {
    /// `createAndFundTrade(address seller, string metadata)`, payable
    CreateAndFundTrade { seller: Address, metadata: String },
    /// `confirmDelivery(uint256 tradeId)`
    ConfirmDelivery { trade_id: u64 },
    /// `raiseDispute(uint256 tradeId, string reason)`
    RaiseDispute { trade_id: u64, reason: String },
    /// `resolveDispute(uint256 tradeId, address to, uint256 amount, string resolution)`
    ResolveDispute {
        trade_id: u64,
        recipient: Address,
        amount: u128,
        resolution: String,
    },
}

/// A contract call plus the value attached to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCall {
    pub function: ContractFunction,
    pub value: u128,
}

impl ContractCall {
    pub fn new(function: ContractFunction) -> Self {
        Self { function, value: 0 }
    }

    pub fn with_value(function: ContractFunction, value: u128) -> Self {
        Self { function, value }
    }
}

/// Events emitted by the escrow contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    EscrowCreated,
    Funded,
    DeliveryConfirmed,
    Released,
    Disputed,
    Resolved,
    TimeoutRefund,
}

impl EventName {
    /// Every event the reconciler subscribes to
    pub const ALL: [EventName; 7] = [
        EventName::EscrowCreated,
        EventName::Funded,
        EventName::DeliveryConfirmed,
        EventName::Released,
        EventName::Disputed,
        EventName::Resolved,
        EventName::TimeoutRefund,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscrowCreated => "EscrowCreated",
            Self::Funded => "Funded",
            Self::DeliveryConfirmed => "DeliveryConfirmed",
            Self::Released => "Released",
            Self::Disputed => "Disputed",
            Self::Resolved => "Resolved",
            Self::TimeoutRefund => "TimeoutRefund",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded contract event arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractEvent {
    EscrowCreated {
        trade_id: u64,
        buyer: Address,
        seller: Address,
        #[serde(with = "crate::models::amount_string")]
        amount: u128,
        metadata: String,
    },
    Funded {
        trade_id: u64,
        payer: Address,
        #[serde(with = "crate::models::amount_string")]
        amount: u128,
    },
    DeliveryConfirmed {
        trade_id: u64,
        confirmer: Address,
    },
    Released {
        trade_id: u64,
        to: Address,
        #[serde(with = "crate::models::amount_string")]
        amount: u128,
        #[serde(with = "crate::models::amount_string")]
        fee: u128,
    },
    Disputed {
        trade_id: u64,
        by: Address,
        reason: String,
    },
    Resolved {
        trade_id: u64,
        to: Address,
        #[serde(with = "crate::models::amount_string")]
        amount: u128,
        resolution: String,
    },
    TimeoutRefund {
        trade_id: u64,
        buyer: Address,
        #[serde(with = "crate::models::amount_string")]
        amount: u128,
    },
    /// A log from the contract that does not decode as a known event
    Unrecognized { topic: String, reason: String },
}

impl ContractEvent {
    pub fn name(&self) -> Option<EventName> {
        match self {
            Self::EscrowCreated { .. } => Some(EventName::EscrowCreated),
            Self::Funded { .. } => Some(EventName::Funded),
            Self::DeliveryConfirmed { .. } => Some(EventName::DeliveryConfirmed),
            Self::Released { .. } => Some(EventName::Released),
            Self::Disputed { .. } => Some(EventName::Disputed),
            Self::Resolved { .. } => Some(EventName::Resolved),
            Self::TimeoutRefund { .. } => Some(EventName::TimeoutRefund),
            Self::Unrecognized { .. } => None,
        }
    }

    pub fn trade_id(&self) -> Option<u64> {
        match self {
            Self::EscrowCreated { trade_id, .. }
            | Self::Funded { trade_id, .. }
            | Self::DeliveryConfirmed { trade_id, .. }
            | Self::Released { trade_id, .. }
            | Self::Disputed { trade_id, .. }
            | Self::Resolved { trade_id, .. }
            | Self::TimeoutRefund { trade_id, .. } => Some(*trade_id),
            Self::Unrecognized { .. } => None,
        }
    }

    /// Arguments as a JSON payload for the event log. Amounts are decimal
    /// strings so they survive consumers with 53-bit numbers.
    pub fn args_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Self::EscrowCreated {
                trade_id,
                buyer,
                seller,
                amount,
                metadata,
            } => json!({
                "trade_id": trade_id,
                "buyer_address": buyer.to_string(),
                "seller_address": seller.to_string(),
                "amount": amount.to_string(),
                "metadata": metadata,
            }),
            Self::Funded {
                trade_id,
                payer,
                amount,
            } => json!({
                "trade_id": trade_id,
                "payer": payer.to_string(),
                "amount": amount.to_string(),
            }),
            Self::DeliveryConfirmed { trade_id, confirmer } => json!({
                "trade_id": trade_id,
                "confirmer": confirmer.to_string(),
            }),
            Self::Released {
                trade_id,
                to,
                amount,
                fee,
            } => json!({
                "trade_id": trade_id,
                "to_address": to.to_string(),
                "amount": amount.to_string(),
                "fee": fee.to_string(),
            }),
            Self::Disputed {
                trade_id,
                by,
                reason,
            } => json!({
                "trade_id": trade_id,
                "by_address": by.to_string(),
                "reason": reason,
            }),
            Self::Resolved {
                trade_id,
                to,
                amount,
                resolution,
            } => json!({
                "trade_id": trade_id,
                "to_address": to.to_string(),
                "amount": amount.to_string(),
                "resolution": resolution,
            }),
            Self::TimeoutRefund {
                trade_id,
                buyer,
                amount,
            } => json!({
                "trade_id": trade_id,
                "buyer_address": buyer.to_string(),
                "amount": amount.to_string(),
            }),
            Self::Unrecognized { topic, reason } => json!({
                "topic": topic,
                "reason": reason,
            }),
        }
    }
}

/// Trade record as held by the escrow contract (`getTrade`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainTrade {
    pub trade_id: u64,
    pub buyer: Address,
    pub seller: Address,
    #[serde(with = "crate::models::amount_string")]
    pub amount: u128,
    /// Contract-side state code
    pub state: u8,
    /// Unix seconds
    pub created_at: u64,
    pub timeout_at: u64,
    pub metadata: String,
}

/// One decoded contract log with its ledger position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLog {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: u64,
    pub event: ContractEvent,
}

/// Client-side protocol for the external ledger
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Escrow contract address; the expected recipient of funding transactions
    fn contract_address(&self) -> &Address;

    /// Whether a custodial key is configured for `submit`
    fn can_submit(&self) -> bool;

    /// Address of the custodial account, if configured
    fn custodial_address(&self) -> Option<Address>;

    async fn get_transaction(&self, hash: &TxHash) -> LedgerResult<LedgerTransaction>;

    async fn get_receipt(&self, hash: &TxHash) -> LedgerResult<LedgerReceipt>;

    async fn current_block(&self) -> LedgerResult<u64>;

    async fn get_balance(&self, address: &Address) -> LedgerResult<u128>;

    /// Trade record stored by the contract for `trade_id`
    async fn get_trade(&self, trade_id: u64) -> LedgerResult<OnChainTrade>;

    /// Build, sign with the custodial key, and broadcast a contract call
    async fn submit(&self, call: ContractCall) -> LedgerResult<TxHash>;

    /// Logs for the named events in `[from_block, to_block]`, sorted ascending
    /// by (block number, log index)
    async fn query_events(
        &self,
        names: &[EventName],
        from_block: u64,
        to_block: u64,
    ) -> LedgerResult<Vec<LedgerLog>>;

    /// Transaction body, receipt (if mined) and confirmation depth
    async fn transaction_status(&self, hash: &TxHash) -> LedgerResult<TransactionStatus> {
        let tx = self.get_transaction(hash).await?;
        let receipt = match self.get_receipt(hash).await {
            Ok(receipt) => Some(receipt),
            Err(LedgerError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let confirmations = match &receipt {
            Some(r) => self.current_block().await?.saturating_sub(r.block_number),
            None => 0,
        };

        Ok(TransactionStatus {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            block_number: receipt.as_ref().map(|r| r.block_number).or(tx.block_number),
            block_hash: receipt.as_ref().map(|r| r.block_hash.clone()),
            success: receipt.as_ref().map(|r| r.success),
            confirmations,
        })
    }
}
