//! Escrow Node - wires the settlement components together
//!
//! The node owns one ledger gateway and one store and hands them to both the
//! API-facing [`EscrowService`] and the [`Reconciler`], so the two paths share
//! a single source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::directory::PartyDirectory;
use crate::escrow_service::{EscrowService, EscrowServiceConfig};
use crate::funding_verifier::{FundingVerifier, FundingVerifierConfig};
use crate::ledger::{LedgerConfig, LedgerGateway, RpcLedgerGateway};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::store::{EscrowStore, MemoryStore, PgStore, StoreConfig};
use crate::EscrowResult;

/// Configuration for the escrow node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ledger: LedgerConfig,
    pub funding: FundingVerifierConfig,
    pub service: EscrowServiceConfig,
    pub reconciler: ReconcilerConfig,
    pub store: StoreConfig,
}

impl NodeConfig {
    /// Defaults, then `path` if given, then `ESCROW__*` environment variables
    pub fn load(path: Option<&Path>) -> EscrowResult<Self> {
        crate::config::load(path)
    }
}

/// Postgres when a database URL is configured, otherwise in-memory
pub async fn open_store(config: &StoreConfig) -> EscrowResult<Arc<dyn EscrowStore>> {
    if config.database_url.is_some() {
        Ok(Arc::new(PgStore::connect(config).await?))
    } else {
        warn!("No database_url configured; escrows are kept in memory only");
        Ok(Arc::new(MemoryStore::new()))
    }
}

/// Main escrow node
pub struct EscrowNode {
    store: Arc<dyn EscrowStore>,
    ledger: Arc<dyn LedgerGateway>,
    service: Arc<EscrowService>,
    reconciler: Arc<Reconciler>,
}

impl EscrowNode {
    /// Connect to the ledger node and the database described by `config`
    pub async fn new(config: NodeConfig, directory: Arc<dyn PartyDirectory>) -> EscrowResult<Self> {
        info!("Initializing escrow node");

        let ledger: Arc<dyn LedgerGateway> = Arc::new(RpcLedgerGateway::new(config.ledger.clone())?);
        let store = open_store(&config.store).await?;

        let node = Self::with_components(config, store, ledger, directory);
        info!("Escrow node initialized successfully");
        Ok(node)
    }

    /// Assemble a node from already constructed collaborators
    pub fn with_components(
        config: NodeConfig,
        store: Arc<dyn EscrowStore>,
        ledger: Arc<dyn LedgerGateway>,
        directory: Arc<dyn PartyDirectory>,
    ) -> Self {
        let verifier = Arc::new(FundingVerifier::new(config.funding, ledger.clone()));
        let service = Arc::new(EscrowService::new(
            config.service,
            store.clone(),
            ledger.clone(),
            verifier,
            directory,
        ));
        let reconciler = Arc::new(Reconciler::new(config.reconciler, store.clone(), ledger.clone()));

        Self {
            store,
            ledger,
            service,
            reconciler,
        }
    }

    pub fn service(&self) -> &Arc<EscrowService> {
        &self.service
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn store(&self) -> &Arc<dyn EscrowStore> {
        &self.store
    }

    /// Check the ledger node and the store
    pub async fn health_check(&self) -> NodeHealth {
        let mut issues = Vec::new();

        let block_height = match self.ledger.current_block().await {
            Ok(height) => Some(height),
            Err(e) => {
                issues.push(format!("Ledger error: {}", e));
                None
            }
        };

        if let Err(e) = self.store.last_processed_block().await {
            issues.push(format!("Store error: {}", e));
        }

        NodeHealth {
            healthy: issues.is_empty(),
            block_height,
            custodial_address: self.ledger.custodial_address().map(|a| a.to_checksum(None)),
            issues,
            timestamp: Utc::now(),
        }
    }
}

/// Node health status
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub block_height: Option<u64>,
    pub custodial_address: Option<String>,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
