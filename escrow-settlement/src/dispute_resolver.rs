//! Dispute Resolver - admin settlement of disputed escrows
//!
//! Computes who receives how much for a resolution outcome and, when the
//! escrow is linked to an on-chain trade and a custodial key is configured,
//! broadcasts `resolveDispute`. A failed broadcast does not block the local
//! resolution; the failure travels with the [`Resolution`] into the event log.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::directory::PartyDirectory;
use crate::error::EscrowError;
use crate::ledger::{Address, ContractCall, ContractFunction, LedgerGateway};
use crate::models::{Escrow, ResolutionOutcome};
use crate::state_machine::Resolution;
use crate::EscrowResult;

/// Minimum length of the admin's resolution narrative
pub const MIN_NOTES_LEN: usize = 10;

/// Dispute resolution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDisputeRequest {
    pub escrow_id: Uuid,
    pub outcome: ResolutionOutcome,
    pub resolution_notes: String,
    /// Recipient for `partial`; defaults to the seller's wallet
    pub payout_address: Option<String>,
    /// Amount for `partial`; ignored for `refund` and `payout`
    #[serde(default, with = "optional_amount")]
    pub payout_amount: Option<u128>,
}

mod optional_amount {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u128>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Computes settlements and submits them to the ledger
pub struct DisputeResolver {
    ledger: Arc<dyn LedgerGateway>,
    directory: Arc<dyn PartyDirectory>,
}

impl DisputeResolver {
    pub fn new(ledger: Arc<dyn LedgerGateway>, directory: Arc<dyn PartyDirectory>) -> Self {
        Self { ledger, directory }
    }

    /// Checks that do not depend on the escrow
    pub fn validate_request(&self, request: &ResolveDisputeRequest) -> EscrowResult<()> {
        if request.resolution_notes.trim().chars().count() < MIN_NOTES_LEN {
            return Err(EscrowError::validation(format!(
                "Resolution notes must be at least {} characters",
                MIN_NOTES_LEN
            )));
        }

        if let Some(address) = &request.payout_address {
            parse_payout_address(address)?;
        }

        if request.outcome == ResolutionOutcome::Partial && request.payout_amount.is_none() {
            return Err(EscrowError::validation(
                "Partial resolution requires a payout amount",
            ));
        }

        Ok(())
    }

    /// Compute the settlement for `escrow` and broadcast it when possible
    pub async fn resolve(
        &self,
        escrow: &Escrow,
        request: &ResolveDisputeRequest,
    ) -> EscrowResult<Resolution> {
        self.validate_request(request)?;

        let (recipient_id, explicit_recipient, amount) = match request.outcome {
            ResolutionOutcome::Refund => (Some(escrow.buyer_id), None, escrow.amount),
            ResolutionOutcome::Payout => (Some(escrow.seller_id), None, escrow.amount),
            ResolutionOutcome::Partial => {
                let amount = request.payout_amount.unwrap_or_default();
                if amount == 0 || amount > escrow.amount {
                    return Err(EscrowError::validation(format!(
                        "Partial amount must be between 1 and {}",
                        escrow.amount
                    )));
                }
                match &request.payout_address {
                    Some(address) => (None, Some(parse_payout_address(address)?), amount),
                    None => (Some(escrow.seller_id), None, amount),
                }
            }
        };

        let recipient = match explicit_recipient {
            Some(address) => Some(address),
            None => self.wallet_of(recipient_id).await?,
        };

        let mut resolution = Resolution {
            outcome: Some(request.outcome),
            recipient_id,
            recipient,
            amount,
            notes: request.resolution_notes.trim().to_string(),
            settlement_tx: None,
            settlement_error: None,
        };

        let Some(trade_id) = escrow.onchain_trade_id else {
            return Ok(resolution);
        };
        if !self.ledger.can_submit() {
            return Ok(resolution);
        }

        let Some(to) = recipient else {
            warn!(
                "Escrow {} resolved without on-chain settlement: recipient has no wallet address",
                escrow.id
            );
            resolution.settlement_error = Some("Recipient has no wallet address".to_string());
            return Ok(resolution);
        };

        let call = ContractCall::new(ContractFunction::ResolveDispute {
            trade_id,
            recipient: to,
            amount,
            resolution: resolution.notes.clone(),
        });
        match self.ledger.submit(call).await {
            Ok(hash) => {
                info!(
                    "Submitted resolveDispute for trade {} (escrow {}): {}",
                    trade_id, escrow.id, hash
                );
                resolution.settlement_tx = Some(hash.to_string());
            }
            Err(e) => {
                warn!(
                    "On-chain settlement for escrow {} failed, resolving locally: {}",
                    escrow.id, e
                );
                resolution.settlement_error = Some(e.to_string());
            }
        }

        Ok(resolution)
    }

    async fn wallet_of(&self, user_id: Option<Uuid>) -> EscrowResult<Option<Address>> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        Ok(self
            .directory
            .user(user_id)
            .await?
            .and_then(|profile| profile.wallet_address))
    }
}

fn parse_payout_address(address: &str) -> EscrowResult<Address> {
    address
        .parse()
        .map_err(|_| EscrowError::validation(format!("Invalid payout address: {address}")))
}
