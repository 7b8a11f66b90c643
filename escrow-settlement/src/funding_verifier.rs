//! Funding Verifier - validates caller-supplied funding transactions
//!
//! A funding proof is a transaction hash the buyer claims moved the escrow
//! amount into the contract. The verifier accepts it only when the receipt
//! exists and succeeded, the transaction is buried deep enough, it was sent
//! to the expected address, and it carried exactly the expected value. The
//! only way to obtain a [`VerifiedFunding`] is through this check.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::EscrowError;
use crate::ledger::{Address, LedgerError, LedgerGateway, TxHash};
use crate::EscrowResult;

/// Configuration for the funding verifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingVerifierConfig {
    /// Blocks that must sit on top of the funding transaction's block
    pub confirmations_required: u64,
}

impl Default for FundingVerifierConfig {
    fn default() -> Self {
        Self {
            confirmations_required: 3,
        }
    }
}

/// Why a funding proof was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FundingRejection {
    #[error("Transaction not found")]
    TransactionNotFound,

    #[error("Transaction receipt not found")]
    ReceiptNotFound,

    #[error("Transaction failed")]
    TransactionFailed,

    #[error("Insufficient confirmations: {actual}/{required}")]
    InsufficientConfirmations { actual: u64, required: u64 },

    #[error("Transaction has no recipient")]
    MissingRecipient,

    #[error("Transaction recipient mismatch: {actual} != {expected}")]
    RecipientMismatch { actual: String, expected: String },

    #[error("Amount mismatch: {actual} != {expected}")]
    AmountMismatch { actual: u128, expected: u128 },
}

impl From<FundingRejection> for EscrowError {
    fn from(rejection: FundingRejection) -> Self {
        EscrowError::funding_verification(rejection.to_string())
    }
}

/// Proof that a transaction passed every funding check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedFunding {
    tx_hash: TxHash,
    block_number: u64,
    confirmations: u64,
}

impl VerifiedFunding {
    pub fn tx_hash(&self) -> &TxHash {
        &self.tx_hash
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }
}

/// Outcome of a verification attempt
pub type Verification = Result<VerifiedFunding, FundingRejection>;

/// Main funding verifier
pub struct FundingVerifier {
    config: FundingVerifierConfig,
    ledger: Arc<dyn LedgerGateway>,
}

impl FundingVerifier {
    /// Create a new funding verifier
    pub fn new(config: FundingVerifierConfig, ledger: Arc<dyn LedgerGateway>) -> Self {
        Self { config, ledger }
    }

    pub fn confirmations_required(&self) -> u64 {
        self.config.confirmations_required
    }

    /// Check `tx_hash` against the expected amount and recipient.
    ///
    /// The outer error is reserved for ledger failures that leave the answer
    /// unknown (transport, decode); those are never treated as acceptance.
    pub async fn verify(
        &self,
        tx_hash: &TxHash,
        expected_amount: u128,
        expected_to: &Address,
    ) -> EscrowResult<Verification> {
        debug!("Verifying funding transaction {}", tx_hash);

        let receipt = match self.ledger.get_receipt(tx_hash).await {
            Ok(receipt) => receipt,
            Err(LedgerError::NotFound(_)) => return Ok(Err(FundingRejection::ReceiptNotFound)),
            Err(e) => return Err(e.into()),
        };

        if !receipt.success {
            return Ok(Err(FundingRejection::TransactionFailed));
        }

        let height = self.ledger.current_block().await?;
        let confirmations = height.saturating_sub(receipt.block_number);
        if confirmations < self.config.confirmations_required {
            return Ok(Err(FundingRejection::InsufficientConfirmations {
                actual: confirmations,
                required: self.config.confirmations_required,
            }));
        }

        let tx = match self.ledger.get_transaction(tx_hash).await {
            Ok(tx) => tx,
            Err(LedgerError::NotFound(_)) => {
                return Ok(Err(FundingRejection::TransactionNotFound))
            }
            Err(e) => return Err(e.into()),
        };

        let Some(to) = tx.to else {
            return Ok(Err(FundingRejection::MissingRecipient));
        };
        if &to != expected_to {
            return Ok(Err(FundingRejection::RecipientMismatch {
                actual: to.to_checksum(None),
                expected: expected_to.to_checksum(None),
            }));
        }

        if tx.value != expected_amount {
            return Ok(Err(FundingRejection::AmountMismatch {
                actual: tx.value,
                expected: expected_amount,
            }));
        }

        info!(
            "Funding transaction {} verified with {} confirmations",
            tx_hash, confirmations
        );
        Ok(Ok(VerifiedFunding {
            tx_hash: *tx_hash,
            block_number: receipt.block_number,
            confirmations,
        }))
    }

    /// Like [`verify`](Self::verify) but folds a rejection into the error
    pub async fn require(
        &self,
        tx_hash: &TxHash,
        expected_amount: u128,
        expected_to: &Address,
    ) -> EscrowResult<VerifiedFunding> {
        match self.verify(tx_hash, expected_amount, expected_to).await? {
            Ok(verified) => Ok(verified),
            Err(rejection) => {
                warn!("Funding transaction {} rejected: {}", tx_hash, rejection);
                Err(rejection.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLedger, ScriptedTx};

    const AMOUNT: u128 = 1_000_000_000_000_000_000;

    fn setup(confirmations_required: u64) -> (Arc<FakeLedger>, FundingVerifier) {
        let ledger = Arc::new(FakeLedger::new());
        let verifier = FundingVerifier::new(
            FundingVerifierConfig {
                confirmations_required,
            },
            ledger.clone(),
        );
        (ledger, verifier)
    }

    #[tokio::test]
    async fn test_accepts_exact_funding() {
        let (ledger, verifier) = setup(3);
        let contract = *ledger.contract_address();
        let hash = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT).mined_at(10));
        ledger.set_height(13);

        let verified = verifier.require(&hash, AMOUNT, &contract).await.unwrap();
        assert_eq!(verified.tx_hash(), &hash);
        assert_eq!(verified.confirmations(), 3);
        assert_eq!(verified.block_number(), 10);
    }

    #[tokio::test]
    async fn test_rejects_amount_off_by_one() {
        let (ledger, verifier) = setup(3);
        let contract = *ledger.contract_address();
        let hash = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT - 1).mined_at(1));
        ledger.set_height(100);

        let outcome = verifier.verify(&hash, AMOUNT, &contract).await.unwrap();
        assert_eq!(
            outcome,
            Err(FundingRejection::AmountMismatch {
                actual: AMOUNT - 1,
                expected: AMOUNT
            })
        );

        let hash = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT + 1).mined_at(1));
        assert!(verifier.verify(&hash, AMOUNT, &contract).await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_confirmation_threshold() {
        let (ledger, verifier) = setup(3);
        let contract = *ledger.contract_address();
        let hash = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT).mined_at(10));

        ledger.set_height(12);
        match verifier.verify(&hash, AMOUNT, &contract).await.unwrap() {
            Err(FundingRejection::InsufficientConfirmations { actual, required }) => {
                assert_eq!(actual, 2);
                assert_eq!(required, 3);
            }
            other => panic!("Expected InsufficientConfirmations, got {:?}", other),
        }

        ledger.set_height(13);
        assert!(verifier.verify(&hash, AMOUNT, &contract).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_recipient_comparison_ignores_case() {
        let (ledger, verifier) = setup(0);
        let contract = *ledger.contract_address();
        let hash = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT).mined_at(1));
        ledger.set_height(1);

        let checksummed: Address = contract.to_checksum(None).parse().unwrap();
        assert!(verifier.verify(&hash, AMOUNT, &checksummed).await.unwrap().is_ok());

        let other: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        match verifier.verify(&hash, AMOUNT, &other).await.unwrap() {
            Err(FundingRejection::RecipientMismatch { .. }) => {}
            other => panic!("Expected RecipientMismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_and_unknown_transactions() {
        let (ledger, verifier) = setup(0);
        let contract = *ledger.contract_address();
        ledger.set_height(50);

        let failed = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT).mined_at(1).failed());
        assert_eq!(
            verifier.verify(&failed, AMOUNT, &contract).await.unwrap(),
            Err(FundingRejection::TransactionFailed)
        );

        let pending = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT));
        assert_eq!(
            verifier.verify(&pending, AMOUNT, &contract).await.unwrap(),
            Err(FundingRejection::ReceiptNotFound)
        );

        let unknown: TxHash = format!("0x{}", "ab".repeat(32)).parse().unwrap();
        let err = verifier.require(&unknown, AMOUNT, &contract).await.unwrap_err();
        assert_eq!(err.kind(), "funding_verification");
    }

    #[tokio::test]
    async fn test_transport_error_is_not_a_rejection() {
        let (ledger, verifier) = setup(0);
        let contract = *ledger.contract_address();
        let hash = ledger.add_transaction(ScriptedTx::to(contract, AMOUNT).mined_at(1));
        ledger.fail_next(LedgerError::Transport("connection reset".into()));

        let err = verifier.verify(&hash, AMOUNT, &contract).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
