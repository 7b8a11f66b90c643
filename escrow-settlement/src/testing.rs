//! Scriptable collaborators for unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::directory::{ContractParties, PartyDirectory, UserProfile};
use crate::ledger::{
    Address, ContractCall, ContractEvent, EventName, LedgerError, LedgerGateway, LedgerLog,
    LedgerReceipt, LedgerResult, LedgerTransaction, OnChainTrade, TxHash,
};
use crate::models::Role;
use crate::EscrowResult;

pub const CONTRACT: &str = "0xcccccccccccccccccccccccccccccccccccccccc";
pub const CUSTODIAN: &str = "0xdddddddddddddddddddddddddddddddddddddddd";

pub fn address(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn hash_of(seed: &[u8]) -> TxHash {
    alloy::primitives::keccak256(seed)
}

fn block_hash(block: u64) -> String {
    format!("0x{:064x}", block)
}

/// A transaction the fake ledger knows about
#[derive(Debug, Clone)]
pub struct ScriptedTx {
    pub from: Address,
    pub to: Option<Address>,
    pub value: u128,
    pub block: Option<u64>,
    pub success: bool,
}

impl ScriptedTx {
    pub fn to(to: Address, value: u128) -> Self {
        Self {
            from: address(0xbb),
            to: Some(to),
            value,
            block: None,
            success: true,
        }
    }

    pub fn mined_at(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

#[derive(Default)]
struct LedgerState {
    height: u64,
    txs: HashMap<TxHash, ScriptedTx>,
    logs: Vec<LedgerLog>,
    trades: HashMap<u64, OnChainTrade>,
    fail_next: Option<LedgerError>,
    fail_submissions: Option<LedgerError>,
    submissions: Vec<ContractCall>,
    queried: Vec<(u64, u64)>,
    counter: u64,
}

/// In-memory [`LedgerGateway`] driven by the test
pub struct FakeLedger {
    contract: Address,
    custodian: Option<Address>,
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    /// Read-only ledger without a custodial key
    pub fn new() -> Self {
        Self {
            contract: CONTRACT.parse().unwrap(),
            custodian: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Ledger that accepts custodial submissions
    pub fn custodial() -> Self {
        Self {
            custodian: Some(CUSTODIAN.parse().unwrap()),
            ..Self::new()
        }
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn add_transaction(&self, tx: ScriptedTx) -> TxHash {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let hash = hash_of(&state.counter.to_be_bytes());
        state.txs.insert(hash, tx);
        hash
    }

    /// Contract-side record returned by `get_trade`
    pub fn set_trade(&self, trade: OnChainTrade) {
        self.state.lock().unwrap().trades.insert(trade.trade_id, trade);
    }

    pub fn push_log(&self, log: LedgerLog) {
        self.state.lock().unwrap().logs.push(log);
    }

    /// The next ledger call of any kind fails with `error`
    pub fn fail_next(&self, error: LedgerError) {
        self.state.lock().unwrap().fail_next = Some(error);
    }

    /// Every submission fails with `error` from now on
    pub fn fail_submissions(&self, error: LedgerError) {
        self.state.lock().unwrap().fail_submissions = Some(error);
    }

    pub fn submissions(&self) -> Vec<ContractCall> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Block ranges passed to `query_events`, in call order
    pub fn queried_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().queried.clone()
    }

    fn take_failure(&self) -> LedgerResult<()> {
        match self.state.lock().unwrap().fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A log for `event` at the given position with a deterministic tx hash
pub fn log_at(block: u64, log_index: u64, event: ContractEvent) -> LedgerLog {
    let mut seed = block.to_be_bytes().to_vec();
    seed.extend_from_slice(&log_index.to_be_bytes());
    LedgerLog {
        tx_hash: hash_of(&seed),
        block_number: block,
        block_hash: block_hash(block),
        log_index,
        event,
    }
}

/// Metadata the platform embeds in `createAndFundTrade`
pub fn trade_metadata(escrow_id: Uuid) -> String {
    serde_json::json!({ "escrow_id": escrow_id.to_string() }).to_string()
}

#[async_trait]
impl LedgerGateway for FakeLedger {
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
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        let tx = state
            .txs
            .get(hash)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {hash}")))?;
        Ok(LedgerTransaction {
            hash: *hash,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            nonce: 0,
            block_number: tx.block,
            input: Vec::new(),
        })
    }

    async fn get_receipt(&self, hash: &TxHash) -> LedgerResult<LedgerReceipt> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        match state.txs.get(hash) {
            Some(ScriptedTx {
                block: Some(block),
                success,
                ..
            }) => Ok(LedgerReceipt {
                tx_hash: *hash,
                block_number: *block,
                block_hash: block_hash(*block),
                success: *success,
            }),
            _ => Err(LedgerError::NotFound(format!("receipt {hash}"))),
        }
    }

    async fn current_block(&self) -> LedgerResult<u64> {
        self.take_failure()?;
        Ok(self.state.lock().unwrap().height)
    }

    async fn get_balance(&self, address: &Address) -> LedgerResult<u128> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .txs
            .values()
            .filter(|tx| tx.success && tx.block.is_some() && tx.to.as_ref() == Some(address))
            .map(|tx| tx.value)
            .sum())
    }

    async fn get_trade(&self, trade_id: u64) -> LedgerResult<OnChainTrade> {
        self.take_failure()?;
        self.state
            .lock()
            .unwrap()
            .trades
            .get(&trade_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("trade {trade_id}")))
    }

    async fn submit(&self, call: ContractCall) -> LedgerResult<TxHash> {
        self.take_failure()?;
        let custodian = self
            .custodian
            .ok_or_else(|| LedgerError::Signing("no custodial key configured".into()))?;
        if let Some(error) = self.state.lock().unwrap().fail_submissions.clone() {
            return Err(error);
        }

        let value = call.value;
        self.state.lock().unwrap().submissions.push(call);
        let hash = self.add_transaction(ScriptedTx {
            from: custodian,
            to: Some(self.contract),
            value,
            block: None,
            success: true,
        });
        Ok(hash)
    }

    async fn query_events(
        &self,
        names: &[EventName],
        from_block: u64,
        to_block: u64,
    ) -> LedgerResult<Vec<LedgerLog>> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.queried.push((from_block, to_block));
        let mut logs: Vec<LedgerLog> = state
            .logs
            .iter()
            .filter(|log| log.block_number >= from_block && log.block_number <= to_block)
            .filter(|log| match log.event.name() {
                Some(name) => names.contains(&name),
                None => true,
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }
}

/// Party directory backed by two maps
#[derive(Default)]
pub struct FakeDirectory {
    contracts: Mutex<HashMap<Uuid, ContractParties>>,
    users: Mutex<HashMap<Uuid, UserProfile>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, role: Role, wallet: Option<Address>) -> Uuid {
        let id = Uuid::new_v4();
        self.users.lock().unwrap().insert(
            id,
            UserProfile {
                id,
                role,
                wallet_address: wallet,
            },
        );
        id
    }

    pub fn add_contract(&self, buyer_id: Uuid, seller_id: Uuid) -> Uuid {
        let contract_id = Uuid::new_v4();
        self.contracts.lock().unwrap().insert(
            contract_id,
            ContractParties {
                contract_id,
                buyer_id,
                seller_id,
            },
        );
        contract_id
    }
}

#[async_trait]
impl PartyDirectory for FakeDirectory {
    async fn contract(&self, contract_id: Uuid) -> EscrowResult<Option<ContractParties>> {
        Ok(self.contracts.lock().unwrap().get(&contract_id).copied())
    }

    async fn user(&self, user_id: Uuid) -> EscrowResult<Option<UserProfile>> {
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }
}

