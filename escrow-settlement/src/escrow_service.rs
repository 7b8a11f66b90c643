//! Escrow Service - the API-facing escrow operations
//!
//! Each operation takes the authenticated [`Caller`], validates input, runs
//! the state machine guards before touching the ledger, and commits the
//! resulting transition through the store. A request either commits in full
//! or fails without any local mutation.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::PartyDirectory;
use crate::dispute_resolver::{DisputeResolver, ResolveDisputeRequest};
use crate::error::EscrowError;
use crate::funding_verifier::FundingVerifier;
use crate::ledger::{
    ContractCall, ContractFunction, LedgerError, LedgerGateway, OnChainTrade, TransactionStatus,
    TxHash,
};
use crate::models::{
    amount_string, Caller, Escrow, EscrowAction, EscrowEvent, EscrowFilter, EscrowState,
    EscrowView, Page, PageRequest,
};
use crate::state_machine::{self, Actor, Command, FundingEvidence, Plan};
use crate::store::{EscrowStore, OpOutcome, StoreOp};
use crate::EscrowResult;

/// Dispute reason length bounds, in characters
pub const MIN_REASON_LEN: usize = 10;
pub const MAX_REASON_LEN: usize = 1000;

/// Configuration for the escrow service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowServiceConfig {
    /// Days after creation at which the buyer may claim a refund
    pub escrow_timeout_days: u32,
    /// Largest accepted escrow amount, in the smallest ledger unit
    #[serde(with = "amount_string")]
    pub max_escrow_amount: u128,
}

impl Default for EscrowServiceConfig {
    fn default() -> Self {
        Self {
            escrow_timeout_days: 30,
            max_escrow_amount: 1_000 * 10u128.pow(18), // 1000 whole units
        }
    }
}

/// Escrow creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrowRequest {
    pub contract_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    #[serde(with = "amount_string")]
    pub expected_amount: u128,
    pub metadata: Option<Value>,
    /// Create and fund the trade with the custodial key right away
    #[serde(default)]
    pub create_on_chain: bool,
}

/// Funding request; exactly one of `tx_hash` and `use_custodial`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundEscrowRequest {
    pub escrow_id: Uuid,
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub use_custodial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmDeliveryRequest {
    pub escrow_id: Uuid,
    #[serde(default)]
    pub use_custodial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseDisputeRequest {
    pub escrow_id: Uuid,
    pub reason: String,
    #[serde(default)]
    pub evidence_urls: Vec<String>,
    #[serde(default)]
    pub use_custodial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEscrowResponse {
    pub escrow_id: Uuid,
    pub state: EscrowState,
    pub onchain_tx_hash: Option<String>,
    /// Why the requested on-chain creation did not happen
    pub ledger_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundEscrowResponse {
    pub escrow_id: Uuid,
    pub state: EscrowState,
    pub confirmations: u64,
    pub is_confirmed: bool,
    pub tx_hash: Option<String>,
    /// False when the escrow was already funded
    pub applied: bool,
}

/// Result of confirm, dispute, timeout refund and resolve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub escrow_id: Uuid,
    pub action: EscrowAction,
    pub state: EscrowState,
    pub tx_hash: Option<String>,
    pub ledger_error: Option<String>,
    pub applied: bool,
}

/// Live view of the escrow's linked transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTxStatus {
    pub tx_hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub block_number: Option<u64>,
    /// `pending`, `success` or `failed`
    pub status: String,
    pub confirmations: u64,
    pub is_confirmed: bool,
}

impl LedgerTxStatus {
    fn new(status: TransactionStatus, confirmations_required: u64) -> Self {
        let label = match status.success {
            None => "pending",
            Some(true) => "success",
            Some(false) => "failed",
        };
        Self {
            tx_hash: status.hash.to_string(),
            from: status.from.to_string(),
            to: status.to.map(|a| a.to_string()),
            value: status.value.to_string(),
            block_number: status.block_number,
            status: label.to_string(),
            is_confirmed: status.success == Some(true)
                && status.confirmations >= confirmations_required,
            confirmations: status.confirmations,
        }
    }
}

/// Escrow, its history and the live ledger view
#[derive(Debug, Clone, Serialize)]
pub struct EscrowStatus {
    pub escrow: EscrowView,
    pub events: Vec<EscrowEvent>,
    pub ledger_status: Option<LedgerTxStatus>,
    /// Contract-side record of the linked trade
    pub onchain_trade: Option<OnChainTrade>,
}

struct Transitioned {
    escrow: Escrow,
    applied: bool,
}

/// Main escrow service
pub struct EscrowService {
    config: EscrowServiceConfig,
    store: Arc<dyn EscrowStore>,
    ledger: Arc<dyn LedgerGateway>,
    verifier: Arc<FundingVerifier>,
    directory: Arc<dyn PartyDirectory>,
    resolver: DisputeResolver,
}

impl EscrowService {
    pub fn new(
        config: EscrowServiceConfig,
        store: Arc<dyn EscrowStore>,
        ledger: Arc<dyn LedgerGateway>,
        verifier: Arc<FundingVerifier>,
        directory: Arc<dyn PartyDirectory>,
    ) -> Self {
        Self {
            resolver: DisputeResolver::new(ledger.clone(), directory.clone()),
            config,
            store,
            ledger,
            verifier,
            directory,
        }
    }

    /// Create an escrow for a catalog contract
    pub async fn create_escrow(
        &self,
        caller: &Caller,
        request: CreateEscrowRequest,
    ) -> EscrowResult<CreateEscrowResponse> {
        self.validate_amount(request.expected_amount)?;

        let contract = self
            .directory
            .contract(request.contract_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("Contract {}", request.contract_id)))?;

        let is_party = caller.user_id == contract.buyer_id || caller.user_id == contract.seller_id;
        if !is_party && !caller.is_admin() {
            return Err(EscrowError::authorization(format!(
                "User {} is not a party to contract {}",
                caller.user_id, contract.contract_id
            )));
        }
        if request.buyer_id != contract.buyer_id || request.seller_id != contract.seller_id {
            return Err(EscrowError::validation(
                "Buyer and seller must match the contract parties",
            ));
        }
        for user_id in [request.buyer_id, request.seller_id] {
            if self.directory.user(user_id).await?.is_none() {
                return Err(EscrowError::not_found(format!("User {}", user_id)));
            }
        }
        if request.create_on_chain && caller.user_id != request.buyer_id {
            return Err(EscrowError::authorization(
                "Only the buyer can create the trade on-chain",
            ));
        }

        let timeout_at = Utc::now() + Duration::days(i64::from(self.config.escrow_timeout_days));
        let escrow = Escrow::new(
            request.contract_id,
            request.buyer_id,
            request.seller_id,
            request.expected_amount,
            timeout_at,
            request.metadata,
        );
        self.store.insert_escrow(&escrow).await?;
        info!(
            "Created escrow {} for contract {} ({} wei)",
            escrow.id, escrow.contract_id, escrow.amount
        );

        let mut response = CreateEscrowResponse {
            escrow_id: escrow.id,
            state: escrow.state,
            onchain_tx_hash: None,
            ledger_error: None,
        };

        if request.create_on_chain {
            match self.fund_custodially(&escrow, caller).await {
                Ok(funded) => {
                    response.state = funded.escrow.state;
                    response.onchain_tx_hash = funded.escrow.onchain_tx_hash;
                }
                Err(e) => {
                    warn!("On-chain creation for escrow {} failed: {}", escrow.id, e);
                    response.ledger_error = Some(e.to_string());
                }
            }
        }

        Ok(response)
    }

    /// Fund with a verified transaction hash or through the custodial key
    pub async fn fund_escrow(
        &self,
        caller: &Caller,
        request: FundEscrowRequest,
    ) -> EscrowResult<FundEscrowResponse> {
        let tx_hash = match (&request.tx_hash, request.use_custodial) {
            (Some(hash), false) => Some(parse_tx_hash(hash)?),
            (None, true) => None,
            _ => {
                return Err(EscrowError::validation(
                    "Provide either tx_hash or use_custodial, not both",
                ))
            }
        };

        let escrow = self.require_escrow(request.escrow_id).await?;
        let actor = Actor::User(*caller);
        if state_machine::precheck(&escrow, EscrowAction::Fund, &actor, Utc::now())?.is_some() {
            debug!("Escrow {} already funded", escrow.id);
            return Ok(fund_response(escrow, false));
        }

        let funded = match tx_hash {
            Some(hash) => {
                let verified = self
                    .verifier
                    .require(&hash, escrow.amount, self.ledger.contract_address())
                    .await?;
                self.transition(&escrow, Command::Fund(FundingEvidence::Verified(verified)), actor)
                    .await?
            }
            None => self.fund_custodially(&escrow, caller).await?,
        };

        Ok(fund_response(funded.escrow, funded.applied))
    }

    /// Release to the seller
    pub async fn confirm_delivery(
        &self,
        caller: &Caller,
        request: ConfirmDeliveryRequest,
    ) -> EscrowResult<ActionResponse> {
        let escrow = self.require_escrow(request.escrow_id).await?;
        let actor = Actor::User(*caller);
        let action = EscrowAction::ConfirmDelivery;
        if state_machine::precheck(&escrow, action, &actor, Utc::now())?.is_some() {
            return Ok(action_response(action, escrow, false));
        }

        let (tx_hash, ledger_error) = if request.use_custodial {
            self.submit_linked(&escrow, |trade_id| ContractFunction::ConfirmDelivery { trade_id })
                .await
        } else {
            (None, None)
        };

        let done = self
            .transition(&escrow, Command::ConfirmDelivery { tx_hash: tx_hash.clone() }, actor)
            .await?;
        Ok(ActionResponse {
            tx_hash,
            ledger_error,
            ..action_response(action, done.escrow, done.applied)
        })
    }

    /// Freeze the escrow for arbitration
    pub async fn raise_dispute(
        &self,
        caller: &Caller,
        request: RaiseDisputeRequest,
    ) -> EscrowResult<ActionResponse> {
        self.validate_dispute(&request)?;

        let escrow = self.require_escrow(request.escrow_id).await?;
        let actor = Actor::User(*caller);
        let action = EscrowAction::RaiseDispute;
        if state_machine::precheck(&escrow, action, &actor, Utc::now())?.is_some() {
            return Ok(action_response(action, escrow, false));
        }

        let reason = request.reason.trim().to_string();
        let (tx_hash, ledger_error) = if request.use_custodial {
            let on_chain_reason = reason.clone();
            self.submit_linked(&escrow, move |trade_id| ContractFunction::RaiseDispute {
                trade_id,
                reason: on_chain_reason,
            })
            .await
        } else {
            (None, None)
        };

        let command = Command::RaiseDispute {
            reason,
            evidence_urls: request.evidence_urls,
        };
        let done = self.transition(&escrow, command, actor).await?;
        info!("Escrow {} disputed by {}", escrow.id, caller.user_id);
        Ok(ActionResponse {
            tx_hash,
            ledger_error,
            ..action_response(action, done.escrow, done.applied)
        })
    }

    /// Refund a funded escrow to the buyer once it has timed out
    pub async fn claim_timeout_refund(
        &self,
        caller: &Caller,
        escrow_id: Uuid,
    ) -> EscrowResult<ActionResponse> {
        let escrow = self.require_escrow(escrow_id).await?;
        let done = self
            .transition(
                &escrow,
                Command::TimeoutRefund { tx_hash: None },
                Actor::User(*caller),
            )
            .await?;
        Ok(action_response(EscrowAction::TimeoutRefund, done.escrow, done.applied))
    }

    /// Settle a disputed escrow (admin only)
    pub async fn resolve_dispute(
        &self,
        caller: &Caller,
        request: ResolveDisputeRequest,
    ) -> EscrowResult<ActionResponse> {
        self.resolver.validate_request(&request)?;

        let escrow = self.require_escrow(request.escrow_id).await?;
        let actor = Actor::User(*caller);
        let action = EscrowAction::Resolve;
        if state_machine::precheck(&escrow, action, &actor, Utc::now())?.is_some() {
            return Ok(action_response(action, escrow, false));
        }

        let resolution = self.resolver.resolve(&escrow, &request).await?;
        let tx_hash = resolution.settlement_tx.clone();
        let ledger_error = resolution.settlement_error.clone();

        let done = self
            .transition(&escrow, Command::Resolve(resolution), actor)
            .await?;
        info!(
            "Escrow {} resolved by {} with outcome {}",
            escrow.id,
            caller.user_id,
            request.outcome.as_str()
        );
        Ok(ActionResponse {
            tx_hash,
            ledger_error,
            ..action_response(action, done.escrow, done.applied)
        })
    }

    /// Escrow, event history and live ledger status of the linked transaction
    pub async fn get_status(&self, caller: &Caller, escrow_id: Uuid) -> EscrowResult<EscrowStatus> {
        let mut escrow = self.require_escrow(escrow_id).await?;
        if !escrow.is_party(caller.user_id) && !caller.is_admin() {
            return Err(EscrowError::authorization(format!(
                "User {} may not view escrow {}",
                caller.user_id, escrow.id
            )));
        }

        let mut ledger_status = None;
        if let Some(linked) = escrow.onchain_tx_hash.clone() {
            if let Some(status) = self.live_status(&linked).await {
                if status.confirmations > escrow.confirmations {
                    escrow = self
                        .store
                        .record_confirmations(
                            escrow.id,
                            &linked,
                            status.confirmations,
                            status.is_confirmed,
                        )
                        .await?;
                }
                ledger_status = Some(status);
            }
        }

        let onchain_trade = match escrow.onchain_trade_id {
            Some(trade_id) => self.live_trade(trade_id).await,
            None => None,
        };

        let events = self.store.events(escrow.id).await?;
        Ok(EscrowStatus {
            escrow: EscrowView::new(escrow, Utc::now()),
            events,
            ledger_status,
            onchain_trade,
        })
    }

    /// Newest first; non-admins only see escrows they are party to
    pub async fn list_escrows(
        &self,
        caller: &Caller,
        mut filter: EscrowFilter,
        page: PageRequest,
    ) -> EscrowResult<Page<EscrowView>> {
        page.validate()?;
        if !caller.is_admin() {
            filter.party_id = Some(caller.user_id);
        }
        let now = Utc::now();
        Ok(self
            .store
            .list_escrows(&filter, page)
            .await?
            .map(|escrow| EscrowView::new(escrow, now)))
    }

    /// Disputed escrows awaiting arbitration (admin only)
    pub async fn list_disputes(
        &self,
        caller: &Caller,
        page: PageRequest,
    ) -> EscrowResult<Page<EscrowView>> {
        if !caller.is_admin() {
            return Err(EscrowError::authorization("Only admins can list disputes"));
        }
        let filter = EscrowFilter {
            state: Some(EscrowState::Disputed),
            ..Default::default()
        };
        self.list_escrows(caller, filter, page).await
    }

    async fn require_escrow(&self, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.store
            .escrow(escrow_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("Escrow {}", escrow_id)))
    }

    /// Plan and commit one transition; a lost race to the same target is a no-op
    async fn transition(
        &self,
        escrow: &Escrow,
        command: Command,
        actor: Actor,
    ) -> EscrowResult<Transitioned> {
        let record = match state_machine::plan(escrow, command, &actor, Utc::now())? {
            Plan::NoOp(_) => {
                return Ok(Transitioned {
                    escrow: escrow.clone(),
                    applied: false,
                })
            }
            Plan::Apply(record) => record,
        };
        let action = record.change.action;
        let to = record.change.to;

        let outcome = self
            .store
            .commit(vec![StoreOp::Transition(record)])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EscrowError::internal("Store returned no outcome"))?;

        let applied = match outcome {
            OpOutcome::Applied => {
                info!("Escrow {}: {} -> {} ({})", escrow.id, escrow.state, to, action);
                true
            }
            OpOutcome::AlreadyApplied | OpOutcome::Duplicate => {
                debug!("Escrow {} already {}", escrow.id, to);
                false
            }
            OpOutcome::Conflict { actual, .. } => {
                return Err(EscrowError::state_conflict(actual.as_str(), action.as_str()));
            }
            OpOutcome::Rejected { reason } => {
                warn!("Escrow {}: {} rejected: {}", escrow.id, action, reason);
                return Err(EscrowError::funding_verification(reason));
            }
        };

        Ok(Transitioned {
            escrow: self.require_escrow(escrow.id).await?,
            applied,
        })
    }

    /// Broadcast `createAndFundTrade` for the full amount and mark the escrow funded
    async fn fund_custodially(&self, escrow: &Escrow, caller: &Caller) -> EscrowResult<Transitioned> {
        let actor = Actor::User(*caller);
        if state_machine::precheck(escrow, EscrowAction::Fund, &actor, Utc::now())?.is_some() {
            return Ok(Transitioned {
                escrow: escrow.clone(),
                applied: false,
            });
        }
        if !self.ledger.can_submit() {
            return Err(EscrowError::ledger_submission(
                "Custodial signing is not configured",
            ));
        }

        let seller = self
            .directory
            .user(escrow.seller_id)
            .await?
            .and_then(|profile| profile.wallet_address)
            .ok_or_else(|| EscrowError::validation("Seller has no wallet address"))?;

        let function = ContractFunction::CreateAndFundTrade {
            seller,
            metadata: trade_metadata(escrow).to_string(),
        };
        let hash = self
            .ledger
            .submit(ContractCall::with_value(function, escrow.amount))
            .await
            .map_err(|e| EscrowError::ledger_submission(e.to_string()))?;
        info!("Submitted createAndFundTrade for escrow {}: {}", escrow.id, hash);

        self.transition(
            escrow,
            Command::Fund(FundingEvidence::Custodial { tx_hash: hash }),
            actor,
        )
        .await
    }

    /// Submit a call that needs the linked trade id. Failures are reported,
    /// not raised; the local transition goes ahead either way.
    async fn submit_linked<F>(&self, escrow: &Escrow, function: F) -> (Option<String>, Option<String>)
    where
        F: FnOnce(u64) -> ContractFunction,
    {
        let Some(trade_id) = escrow.onchain_trade_id else {
            debug!("Escrow {} has no on-chain trade; skipping submission", escrow.id);
            return (None, None);
        };
        if !self.ledger.can_submit() {
            warn!("Custodial signing is not configured; escrow {} updated locally only", escrow.id);
            return (None, Some("Custodial signing is not configured".to_string()));
        }

        match self.ledger.submit(ContractCall::new(function(trade_id))).await {
            Ok(hash) => {
                info!("Submitted transaction {} for trade {}", hash, trade_id);
                (Some(hash.to_string()), None)
            }
            Err(e) => {
                warn!(
                    "Ledger submission for escrow {} failed, continuing locally: {}",
                    escrow.id, e
                );
                (None, Some(e.to_string()))
            }
        }
    }

    async fn live_status(&self, linked: &str) -> Option<LedgerTxStatus> {
        let hash: TxHash = match linked.parse() {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Stored transaction hash {} is malformed: {}", linked, e);
                return None;
            }
        };
        match self.ledger.transaction_status(&hash).await {
            Ok(status) => Some(LedgerTxStatus::new(
                status,
                self.verifier.confirmations_required(),
            )),
            Err(LedgerError::NotFound(_)) => {
                debug!("Transaction {} not known to the ledger yet", hash);
                None
            }
            Err(e) => {
                warn!("Could not fetch ledger status for {}: {}", hash, e);
                None
            }
        }
    }

    async fn live_trade(&self, trade_id: u64) -> Option<OnChainTrade> {
        match self.ledger.get_trade(trade_id).await {
            Ok(trade) => Some(trade),
            Err(e) => {
                warn!("Could not read trade {} from the contract: {}", trade_id, e);
                None
            }
        }
    }

    /// Validate an escrow amount
    fn validate_amount(&self, amount: u128) -> EscrowResult<()> {
        if amount == 0 {
            return Err(EscrowError::validation("Amount must be greater than 0"));
        }
        if amount > self.config.max_escrow_amount {
            return Err(EscrowError::validation(format!(
                "Amount {} exceeds maximum {}",
                amount, self.config.max_escrow_amount
            )));
        }
        Ok(())
    }

    /// Validate a dispute request
    fn validate_dispute(&self, request: &RaiseDisputeRequest) -> EscrowResult<()> {
        let len = request.reason.trim().chars().count();
        if !(MIN_REASON_LEN..=MAX_REASON_LEN).contains(&len) {
            return Err(EscrowError::validation(format!(
                "Dispute reason must be between {} and {} characters",
                MIN_REASON_LEN, MAX_REASON_LEN
            )));
        }
        if let Some(url) = request
            .evidence_urls
            .iter()
            .find(|url| !(url.starts_with("http://") || url.starts_with("https://")))
        {
            return Err(EscrowError::validation(format!("Invalid evidence URL: {}", url)));
        }
        Ok(())
    }
}

/// `0x` followed by 64 hex digits
fn parse_tx_hash(hash: &str) -> EscrowResult<TxHash> {
    let invalid = || EscrowError::validation(format!("Invalid transaction hash: {}", hash));
    if hash.len() != 66 || !hash.starts_with("0x") {
        return Err(invalid());
    }
    hash.parse().map_err(|_| invalid())
}

/// Metadata embedded in `createAndFundTrade`; the reconciler reads `escrow_id` back
fn trade_metadata(escrow: &Escrow) -> Value {
    let mut metadata = match &escrow.metadata {
        Some(Value::Object(fields)) => Value::Object(fields.clone()),
        _ => json!({}),
    };
    metadata["escrow_id"] = json!(escrow.id.to_string());
    metadata["contract_id"] = json!(escrow.contract_id.to_string());
    metadata
}

fn fund_response(escrow: Escrow, applied: bool) -> FundEscrowResponse {
    FundEscrowResponse {
        escrow_id: escrow.id,
        state: escrow.state,
        confirmations: escrow.confirmations,
        is_confirmed: escrow.is_confirmed,
        tx_hash: escrow.onchain_tx_hash,
        applied,
    }
}

fn action_response(action: EscrowAction, escrow: Escrow, applied: bool) -> ActionResponse {
    ActionResponse {
        escrow_id: escrow.id,
        action,
        state: escrow.state,
        tx_hash: None,
        ledger_error: None,
        applied,
    }
}
