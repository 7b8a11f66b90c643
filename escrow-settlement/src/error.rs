//! Error types for the settlement engine
//!
//! One variant per failure category surfaced to callers, plus the
//! infrastructure failures (ledger transport, storage, configuration)
//! that operations propagate unchanged.

use crate::ledger::LedgerError;
use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed or out-of-range input, rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown escrow, contract or user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller lacks the relationship or role the operation requires
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Requested transition is not legal from the current state
    #[error("Invalid state transition: cannot {action} from {from_state}")]
    StateConflict { from_state: String, action: String },

    /// Funding proof failed one of the verifier's checks
    #[error("Funding verification failed: {0}")]
    FundingVerification(String),

    /// Signing or broadcast of a custodial transaction failed
    #[error("Ledger submission failed: {0}")]
    LedgerSubmission(String),

    /// A ledger event could not be mapped onto a local escrow
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// Ledger reads that failed in transport or returned nothing
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Persistence failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// UUID parsing errors
    #[error("UUID parsing error: {0}")]
    Uuid(#[from] uuid::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a state conflict error
    pub fn state_conflict<S: Into<String>, A: Into<String>>(from_state: S, action: A) -> Self {
        Self::StateConflict {
            from_state: from_state.into(),
            action: action.into(),
        }
    }

    /// Create a funding verification error
    pub fn funding_verification<S: Into<String>>(msg: S) -> Self {
        Self::FundingVerification(msg.into())
    }

    /// Create a ledger submission error
    pub fn ledger_submission<S: Into<String>>(msg: S) -> Self {
        Self::LedgerSubmission(msg.into())
    }

    /// Create a reconciliation error
    pub fn reconciliation<S: Into<String>>(msg: S) -> Self {
        Self::Reconciliation(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable category name for the transport layer to map onto status codes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Authorization(_) => "authorization",
            Self::StateConflict { .. } => "state_conflict",
            Self::FundingVerification(_) => "funding_verification",
            Self::LedgerSubmission(_) => "ledger_submission",
            Self::Reconciliation(_) => "reconciliation",
            Self::Ledger(_) => "ledger",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Uuid(_) => "uuid",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ledger(e) => e.is_retryable(),
            Self::Storage(_) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for EscrowError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EscrowError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(format!("migration failed: {err}"))
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(EscrowError::validation("x").kind(), "validation");
        assert_eq!(
            EscrowError::state_conflict("complete", "fund").kind(),
            "state_conflict"
        );
        assert_eq!(
            EscrowError::from(LedgerError::Transport("timeout".into())).kind(),
            "ledger"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EscrowError::from(LedgerError::Transport("reset".into())).is_retryable());
        assert!(!EscrowError::from(LedgerError::Reverted("nope".into())).is_retryable());
        assert!(!EscrowError::validation("bad").is_retryable());
    }

    #[test]
    fn test_state_conflict_message() {
        let err = EscrowError::state_conflict("disputed", "confirm_delivery");
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot confirm_delivery from disputed"
        );
    }
}
