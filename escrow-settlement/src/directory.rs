//! Party directory - the catalog and user lookups this engine depends on
//!
//! Contracts and user profiles are owned by the surrounding platform. The
//! engine only needs to know who the parties to a contract are and which
//! wallet address each user settles to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::Address;
use crate::models::Role;
use crate::EscrowResult;

/// Buyer and seller of a catalog contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractParties {
    pub contract_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
}

/// User profile as far as settlement is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub role: Role,
    pub wallet_address: Option<Address>,
}

/// Lookup interface supplied by the catalog and auth layer
#[async_trait]
pub trait PartyDirectory: Send + Sync {
    async fn contract(&self, contract_id: Uuid) -> EscrowResult<Option<ContractParties>>;

    async fn user(&self, user_id: Uuid) -> EscrowResult<Option<UserProfile>>;
}
