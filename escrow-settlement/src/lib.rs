//! Escrow settlement engine for a contract-work marketplace
//!
//! Funds for a contract are held by an on-chain escrow contract; this crate
//! keeps the off-chain mirror of every escrow consistent with it:
//! - A guarded state machine with an append-only, deduplicated event log
//! - Funding verification against ledger transactions and confirmations
//! - A ledger gateway speaking JSON-RPC with a custodial signing key
//! - A reconciler that polls contract events and applies them idempotently
//! - Admin dispute resolution with optional on-chain settlement
//! - PostgreSQL for state management

pub mod config;
pub mod directory;
pub mod dispute_resolver;
pub mod error;
pub mod escrow_service;
pub mod funding_verifier;
pub mod ledger;
pub mod models;
pub mod node;
pub mod reconciler;
pub mod state_machine;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
