//! JSON-RPC ledger gateway
//!
//! Talks to an EVM-compatible node through an alloy provider. Every request
//! carries its own timeout. When a custodial key is configured the provider
//! holds it as a local wallet and fills nonce, gas and chain id before
//! broadcasting; submissions are serialized so the nonce filler never races.

use alloy::consensus::Transaction;
use alloy::network::{EthereumWallet, TransactionBuilder, TransactionResponse};
use alloy::primitives::U256;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log as RpcLog, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use alloy::transports::TransportResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::contract::{decode_event, decode_trade, get_trade_calldata};
use super::{
    Address, ContractCall, EventName, LedgerError, LedgerGateway, LedgerLog, LedgerReceipt,
    LedgerResult, LedgerTransaction, OnChainTrade, TxHash,
};
use crate::config::SecretString;

/// Ledger connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// HTTP JSON-RPC endpoint of the ledger node
    pub rpc_url: String,
    /// Deployed escrow contract address
    pub contract_address: String,
    /// Custodial signing key; submissions are disabled without it
    pub custodial_private_key: Option<SecretString>,
    /// Chain id; queried from the node when unset
    pub chain_id: Option<u64>,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Headroom added on top of the node's gas estimate, in percent
    pub gas_buffer_percent: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            contract_address: "0x0000000000000000000000000000000000000000".to_string(),
            custodial_private_key: None,
            chain_id: None,
            request_timeout_secs: 15,
            gas_buffer_percent: 20,
        }
    }
}

/// Map a node error response onto the gateway taxonomy
fn classify_error(code: i64, message: &str) -> LedgerError {
    let lower = message.to_lowercase();
    if lower.contains("revert") {
        LedgerError::Reverted(message.to_string())
    } else if code == -32603 || code == -32005 || lower.contains("timeout") {
        LedgerError::Transport(format!("node error {code}: {message}"))
    } else {
        LedgerError::Rejected(format!("node error {code}: {message}"))
    }
}

fn classify_transport(method: &str, err: alloy::transports::TransportError) -> LedgerError {
    if let Some(payload) = err.as_error_resp() {
        return classify_error(payload.code, &payload.message);
    }
    if err.is_ser_error() || err.is_deser_error() {
        LedgerError::Decode(format!("{method}: {err}"))
    } else {
        LedgerError::Transport(format!("{method}: {err}"))
    }
}

async fn timed<T>(
    timeout: Duration,
    method: &str,
    call: impl IntoFuture<Output = TransportResult<T>>,
) -> LedgerResult<T> {
    debug!("RPC {}", method);
    tokio::time::timeout(timeout, call.into_future())
        .await
        .map_err(|_| LedgerError::Transport(format!("{method} timed out after {timeout:?}")))?
        .map_err(|e| classify_transport(method, e))
}

fn wei(method: &str, value: U256) -> LedgerResult<u128> {
    u128::try_from(value).map_err(|_| LedgerError::Decode(format!("{method}: {value} exceeds u128")))
}

/// Position a contract log; pending and removed logs yield `None`
fn position_log(log: RpcLog) -> Option<LedgerLog> {
    if log.removed {
        return None;
    }
    let (Some(tx_hash), Some(block_number), Some(block_hash), Some(log_index)) = (
        log.transaction_hash,
        log.block_number,
        log.block_hash,
        log.log_index,
    ) else {
        return None;
    };

    Some(LedgerLog {
        tx_hash,
        block_number,
        block_hash: block_hash.to_string(),
        log_index,
        event: decode_event(&log.inner),
    })
}

/// Ledger gateway backed by a JSON-RPC node
pub struct RpcLedgerGateway {
    config: LedgerConfig,
    provider: DynProvider,
    contract: Address,
    custodian: Option<Address>,
    submissions: Mutex<()>,
}

impl RpcLedgerGateway {
    /// Create a gateway. Fails on a malformed URL, contract address or key.
    pub fn new(config: LedgerConfig) -> LedgerResult<Self> {
        let contract = Address::from_str(&config.contract_address).map_err(|e| {
            LedgerError::Decode(format!("invalid contract address {}: {e}", config.contract_address))
        })?;
        let url: Url = config
            .rpc_url
            .parse()
            .map_err(|e| LedgerError::Transport(format!("invalid rpc_url {}: {e}", config.rpc_url)))?;

        let (provider, custodian) = match &config.custodial_private_key {
            Some(key) => {
                let signer = PrivateKeySigner::from_str(key.expose())
                    .map_err(|e| LedgerError::Signing(format!("invalid custodial key: {e}")))?;
                let custodian = signer.address();
                let provider = ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer))
                    .connect_http(url)
                    .erased();
                (provider, Some(custodian))
            }
            None => (ProviderBuilder::new().connect_http(url).erased(), None),
        };

        info!(
            "Ledger gateway configured for contract {} via {}",
            contract, config.rpc_url
        );
        match custodian {
            Some(address) => info!("Custodial account: {}", address),
            None => warn!("No custodial key configured; ledger submissions are disabled"),
        }

        Ok(Self {
            config,
            provider,
            contract,
            custodian,
            submissions: Mutex::new(()),
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }
}

#[async_trait]
impl LedgerGateway for RpcLedgerGateway {
    fn contract_address(&self) -> &Address {
        &self.contract
    }

    fn can_submit(&self) -> bool {
        self.custodian.is_some()
    }

    fn custodial_address(&self) -> Option<Address> {
        self.custodian
    }

    async fn get_transaction(&self, hash: &TxHash) -> LedgerResult<LedgerTransaction> {
        let tx = timed(
            self.timeout(),
            "eth_getTransactionByHash",
            self.provider.get_transaction_by_hash(*hash),
        )
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("transaction {hash}")))?;

        Ok(LedgerTransaction {
            hash: TransactionResponse::tx_hash(&tx),
            from: TransactionResponse::from(&tx),
            to: Transaction::to(&tx),
            value: wei("eth_getTransactionByHash", Transaction::value(&tx))?,
            nonce: Transaction::nonce(&tx),
            block_number: tx.block_number,
            input: Transaction::input(&tx).to_vec(),
        })
    }

    async fn get_receipt(&self, hash: &TxHash) -> LedgerResult<LedgerReceipt> {
        let receipt = timed(
            self.timeout(),
            "eth_getTransactionReceipt",
            self.provider.get_transaction_receipt(*hash),
        )
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("receipt for {hash}")))?;

        let (Some(block_number), Some(block_hash)) = (receipt.block_number, receipt.block_hash) else {
            return Err(LedgerError::Decode(format!("receipt for {hash} has no block")));
        };

        Ok(LedgerReceipt {
            tx_hash: receipt.transaction_hash,
            block_number,
            block_hash: block_hash.to_string(),
            success: receipt.status(),
        })
    }

    async fn current_block(&self) -> LedgerResult<u64> {
        timed(self.timeout(), "eth_blockNumber", self.provider.get_block_number()).await
    }

    async fn get_balance(&self, address: &Address) -> LedgerResult<u128> {
        let balance = timed(self.timeout(), "eth_getBalance", self.provider.get_balance(*address)).await?;
        wei("eth_getBalance", balance)
    }

    async fn get_trade(&self, trade_id: u64) -> LedgerResult<OnChainTrade> {
        let request = TransactionRequest::default()
            .with_to(self.contract)
            .with_input(get_trade_calldata(trade_id));
        let data = timed(self.timeout(), "eth_call", self.provider.call(request)).await?;

        let trade = decode_trade(trade_id, &data)?;
        // Unset storage reads back as zeroes
        if trade.buyer == Address::ZERO {
            return Err(LedgerError::NotFound(format!("trade {trade_id}")));
        }
        Ok(trade)
    }

    async fn submit(&self, call: ContractCall) -> LedgerResult<TxHash> {
        let from = self
            .custodian
            .ok_or_else(|| LedgerError::Signing("no custodial key configured".to_string()))?;

        let mut request = TransactionRequest::default()
            .with_from(from)
            .with_to(self.contract)
            .with_input(call.function.calldata())
            .with_value(U256::from(call.value));
        if let Some(chain_id) = self.config.chain_id {
            request = request.with_chain_id(chain_id);
        }

        // Held from estimate to broadcast
        let _submission = self.submissions.lock().await;

        let estimate = timed(
            self.timeout(),
            "eth_estimateGas",
            self.provider.estimate_gas(request.clone()),
        )
        .await?;
        let gas_limit = estimate.saturating_mul(100 + self.config.gas_buffer_percent) / 100;

        let pending = timed(
            self.timeout(),
            "eth_sendRawTransaction",
            self.provider.send_transaction(request.with_gas_limit(gas_limit)),
        )
        .await?;
        let hash = *pending.tx_hash();

        info!(
            "Submitted {} (gas {}): {}",
            call.function.signature(),
            gas_limit,
            hash
        );
        Ok(hash)
    }

    async fn query_events(
        &self,
        names: &[EventName],
        from_block: u64,
        to_block: u64,
    ) -> LedgerResult<Vec<LedgerLog>> {
        if names.is_empty() || from_block > to_block {
            return Ok(Vec::new());
        }
        let filter = Filter::new()
            .address(self.contract)
            .from_block(from_block)
            .to_block(to_block)
            .event_signature(names.iter().map(|name| name.topic()).collect::<Vec<_>>());

        let logs = timed(self.timeout(), "eth_getLogs", self.provider.get_logs(&filter)).await?;

        let mut decoded: Vec<LedgerLog> = logs.into_iter().filter_map(position_log).collect();
        decoded.sort_by_key(|log| (log.block_number, log.log_index));

        debug!(
            "Fetched {} contract logs in blocks {}..={}",
            decoded.len(),
            from_block,
            to_block
        );
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::contract::EscrowContract;
    use crate::ledger::ContractEvent;
    use alloy::primitives::{Log as PrimitiveLog, B256};
    use alloy::sol_types::SolEvent;

    #[test]
    fn test_rpc_error_classification() {
        let revert = classify_error(3, "execution reverted: not buyer");
        assert!(matches!(revert, LedgerError::Reverted(_)));

        let nonce = classify_error(-32000, "nonce too low");
        assert!(matches!(nonce, LedgerError::Rejected(_)));

        let internal = classify_error(-32603, "internal error");
        assert!(internal.is_retryable());

        let slow = classify_error(-32000, "request timeout");
        assert!(slow.is_retryable());
    }

    #[test]
    fn test_new_validates_config() {
        let bad = LedgerConfig {
            contract_address: "not-an-address".into(),
            ..Default::default()
        };
        assert!(RpcLedgerGateway::new(bad).is_err());

        let bad_key = LedgerConfig {
            custodial_private_key: Some(SecretString::new("0x1234")),
            ..Default::default()
        };
        assert!(matches!(
            RpcLedgerGateway::new(bad_key),
            Err(LedgerError::Signing(_))
        ));

        let gateway = RpcLedgerGateway::new(LedgerConfig::default()).unwrap();
        assert!(!gateway.can_submit());
        assert!(gateway.custodial_address().is_none());
    }

    #[test]
    fn test_custodial_key_enables_submission() {
        let config = LedgerConfig {
            custodial_private_key: Some(SecretString::new(&"01".repeat(32))),
            ..Default::default()
        };
        let gateway = RpcLedgerGateway::new(config).unwrap();
        assert!(gateway.can_submit());
        assert!(gateway.custodial_address().is_some());
    }

    #[test]
    fn test_position_log_skips_pending_and_removed() {
        assert!(position_log(RpcLog::default()).is_none());

        let event = EscrowContract::Funded {
            tradeId: U256::from(3u64),
            payer: Address::repeat_byte(0x0b),
            amount: U256::from(10u64),
        };
        let mut log = RpcLog {
            inner: PrimitiveLog {
                address: Address::repeat_byte(0xcc),
                data: event.encode_log_data(),
            },
            block_hash: Some(B256::repeat_byte(0xab)),
            block_number: Some(7),
            transaction_hash: Some(B256::repeat_byte(0x11)),
            log_index: Some(2),
            ..Default::default()
        };
        log.removed = true;
        assert!(position_log(log.clone()).is_none());

        log.removed = false;
        let positioned = position_log(log).unwrap();
        assert_eq!(positioned.block_number, 7);
        assert_eq!(positioned.log_index, 2);
        assert_eq!(positioned.tx_hash, B256::repeat_byte(0x11));
        assert!(matches!(
            positioned.event,
            ContractEvent::Funded { trade_id: 3, amount: 10, .. }
        ));
    }
}
