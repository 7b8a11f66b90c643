//! Escrow contract bindings
//!
//! Calldata is built from the `sol!`-generated call types and logs are
//! decoded with [`SolEvent::decode_log`], matched on topic 0. A log that
//! fails to decode becomes [`ContractEvent::Unrecognized`] instead of an
//! error, so one bad log never blocks a reconciliation window.

use alloy::primitives::{Bytes, Log, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};

use super::{ContractEvent, ContractFunction, EventName, LedgerError, LedgerResult, OnChainTrade};

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    contract EscrowContract {
        event EscrowCreated(
            uint256 indexed tradeId,
            address indexed buyer,
            address indexed seller,
            uint256 amount,
            string metadata
        );
        event Funded(uint256 indexed tradeId, address indexed payer, uint256 amount);
        event DeliveryConfirmed(uint256 indexed tradeId, address indexed confirmer);
        event Released(uint256 indexed tradeId, address indexed to, uint256 amount, uint256 fee);
        event Disputed(uint256 indexed tradeId, address indexed by, string reason);
        event Resolved(uint256 indexed tradeId, address indexed to, uint256 amount, string resolution);
        event TimeoutRefund(uint256 indexed tradeId, address indexed buyer, uint256 amount);

        function createAndFundTrade(address seller, string metadata) external payable returns (uint256 tradeId);
        function confirmDelivery(uint256 tradeId) external;
        function raiseDispute(uint256 tradeId, string reason) external;
        function resolveDispute(uint256 tradeId, address to, uint256 amount, string resolution) external;
        function getTrade(uint256 tradeId) external view returns (
            address buyer,
            address seller,
            uint256 amount,
            uint8 state,
            uint256 createdAt,
            uint256 timeoutAt,
            string metadata
        );
    }
}

use EscrowContract::{
    confirmDeliveryCall, createAndFundTradeCall, getTradeCall, raiseDisputeCall, resolveDisputeCall,
    DeliveryConfirmed, Disputed, EscrowCreated, Funded, Released, Resolved, TimeoutRefund,
};

impl ContractFunction {
    /// Solidity signature of the function
    pub fn signature(&self) -> &'static str {
        match self {
            Self::CreateAndFundTrade { .. } => createAndFundTradeCall::SIGNATURE,
            Self::ConfirmDelivery { .. } => confirmDeliveryCall::SIGNATURE,
            Self::RaiseDispute { .. } => raiseDisputeCall::SIGNATURE,
            Self::ResolveDispute { .. } => resolveDisputeCall::SIGNATURE,
        }
    }

    /// ABI-encoded calldata, selector first
    pub fn calldata(&self) -> Bytes {
        let encoded = match self {
            Self::CreateAndFundTrade { seller, metadata } => createAndFundTradeCall {
                seller: *seller,
                metadata: metadata.clone(),
            }
            .abi_encode(),
            Self::ConfirmDelivery { trade_id } => confirmDeliveryCall {
                tradeId: U256::from(*trade_id),
            }
            .abi_encode(),
            Self::RaiseDispute { trade_id, reason } => raiseDisputeCall {
                tradeId: U256::from(*trade_id),
                reason: reason.clone(),
            }
            .abi_encode(),
            Self::ResolveDispute {
                trade_id,
                recipient,
                amount,
                resolution,
            } => resolveDisputeCall {
                tradeId: U256::from(*trade_id),
                to: *recipient,
                amount: U256::from(*amount),
                resolution: resolution.clone(),
            }
            .abi_encode(),
        };
        Bytes::from(encoded)
    }
}

impl EventName {
    /// Canonical Solidity event signature (topic 0 preimage)
    pub fn signature(&self) -> &'static str {
        match self {
            Self::EscrowCreated => EscrowCreated::SIGNATURE,
            Self::Funded => Funded::SIGNATURE,
            Self::DeliveryConfirmed => DeliveryConfirmed::SIGNATURE,
            Self::Released => Released::SIGNATURE,
            Self::Disputed => Disputed::SIGNATURE,
            Self::Resolved => Resolved::SIGNATURE,
            Self::TimeoutRefund => TimeoutRefund::SIGNATURE,
        }
    }

    pub fn topic(&self) -> B256 {
        match self {
            Self::EscrowCreated => EscrowCreated::SIGNATURE_HASH,
            Self::Funded => Funded::SIGNATURE_HASH,
            Self::DeliveryConfirmed => DeliveryConfirmed::SIGNATURE_HASH,
            Self::Released => Released::SIGNATURE_HASH,
            Self::Disputed => Disputed::SIGNATURE_HASH,
            Self::Resolved => Resolved::SIGNATURE_HASH,
            Self::TimeoutRefund => TimeoutRefund::SIGNATURE_HASH,
        }
    }

    /// Reverse lookup of topic 0
    pub fn from_topic(topic: &B256) -> Option<Self> {
        Self::ALL.iter().copied().find(|name| name.topic() == *topic)
    }
}

/// Calldata for `getTrade(tradeId)`
pub(crate) fn get_trade_calldata(trade_id: u64) -> Bytes {
    Bytes::from(
        getTradeCall {
            tradeId: U256::from(trade_id),
        }
        .abi_encode(),
    )
}

/// Decode the `getTrade` return data
pub(crate) fn decode_trade(trade_id: u64, data: &[u8]) -> LedgerResult<OnChainTrade> {
    let trade = getTradeCall::abi_decode_returns(data)
        .map_err(|e| LedgerError::Decode(format!("getTrade({trade_id}): {e}")))?;
    let field = |name: &str, e: String| LedgerError::Decode(format!("getTrade({trade_id}).{name}: {e}"));

    Ok(OnChainTrade {
        trade_id,
        buyer: trade.buyer,
        seller: trade.seller,
        amount: amount(trade.amount).map_err(|e| field("amount", e))?,
        state: trade.state,
        created_at: word_u64(trade.createdAt).map_err(|e| field("createdAt", e))?,
        timeout_at: word_u64(trade.timeoutAt).map_err(|e| field("timeoutAt", e))?,
        metadata: trade.metadata,
    })
}

fn amount(value: U256) -> Result<u128, String> {
    u128::try_from(value).map_err(|_| format!("{value} exceeds u128"))
}

fn word_u64(value: U256) -> Result<u64, String> {
    u64::try_from(value).map_err(|_| format!("{value} exceeds u64"))
}

fn decode<E: SolEvent>(log: &Log) -> Result<E, String> {
    E::decode_log(log)
        .map(|decoded| decoded.data)
        .map_err(|e| format!("malformed {}: {e}", E::SIGNATURE))
}

/// Decode a contract log; anything unknown or malformed is `Unrecognized`
pub fn decode_event(log: &Log) -> ContractEvent {
    let Some(topic) = log.topics().first() else {
        return ContractEvent::Unrecognized {
            topic: String::new(),
            reason: "log has no topics".to_string(),
        };
    };
    let Some(name) = EventName::from_topic(topic) else {
        return ContractEvent::Unrecognized {
            topic: topic.to_string(),
            reason: "unknown event topic".to_string(),
        };
    };

    decode_known(name, log).unwrap_or_else(|reason| ContractEvent::Unrecognized {
        topic: topic.to_string(),
        reason,
    })
}

fn decode_known(name: EventName, log: &Log) -> Result<ContractEvent, String> {
    let event = match name {
        EventName::EscrowCreated => {
            let e: EscrowCreated = decode(log)?;
            ContractEvent::EscrowCreated {
                trade_id: word_u64(e.tradeId)?,
                buyer: e.buyer,
                seller: e.seller,
                amount: amount(e.amount)?,
                metadata: e.metadata,
            }
        }
        EventName::Funded => {
            let e: Funded = decode(log)?;
            ContractEvent::Funded {
                trade_id: word_u64(e.tradeId)?,
                payer: e.payer,
                amount: amount(e.amount)?,
            }
        }
        EventName::DeliveryConfirmed => {
            let e: DeliveryConfirmed = decode(log)?;
            ContractEvent::DeliveryConfirmed {
                trade_id: word_u64(e.tradeId)?,
                confirmer: e.confirmer,
            }
        }
        EventName::Released => {
            let e: Released = decode(log)?;
            ContractEvent::Released {
                trade_id: word_u64(e.tradeId)?,
                to: e.to,
                amount: amount(e.amount)?,
                fee: amount(e.fee)?,
            }
        }
        EventName::Disputed => {
            let e: Disputed = decode(log)?;
            ContractEvent::Disputed {
                trade_id: word_u64(e.tradeId)?,
                by: e.by,
                reason: e.reason,
            }
        }
        EventName::Resolved => {
            let e: Resolved = decode(log)?;
            ContractEvent::Resolved {
                trade_id: word_u64(e.tradeId)?,
                to: e.to,
                amount: amount(e.amount)?,
                resolution: e.resolution,
            }
        }
        EventName::TimeoutRefund => {
            let e: TimeoutRefund = decode(log)?;
            ContractEvent::TimeoutRefund {
                trade_id: word_u64(e.tradeId)?,
                buyer: e.buyer,
                amount: amount(e.amount)?,
            }
        }
    };
    Ok(event)
}
