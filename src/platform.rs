// Platform - wires the ledger, escrow and marketplace services together
//
// Leaf first: the ledger is opened, the escrow service gets a custodial
// port onto it, and the marketplace gets an operator port onto escrow.
// Both service identities are registered as operators.

use crate::access::{AllowAll, Capabilities, IdentityVerifier};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, PlatformConfig};
use crate::escrow::{AutoReleaseSweeper, EscrowError, EscrowService, OperatorEscrow};
use crate::identity::{Caller, Keypair};
use crate::ledger::{CustodialLedger, LedgerError, LedgerService};
use crate::marketplace::{MarketError, MarketplaceService};
use crate::storage::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const CUSTODIAN_LABEL: &str = "escrow-custodian";
pub const OPERATOR_LABEL: &str = "marketplace-operator";

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Marketplace(#[from] MarketError),
}

/// The three services sharing one store
pub struct Platform {
    config: PlatformConfig,
    store: Store,
    capabilities: Arc<Capabilities>,
    custodian: Keypair,
    operator: Keypair,
    ledger: Arc<LedgerService>,
    escrow: Arc<EscrowService>,
    marketplace: Arc<MarketplaceService>,
}

impl Platform {
    /// Open the platform on the configured data directory
    pub fn open(config: PlatformConfig) -> Result<Self, PlatformError> {
        let store = Store::open(&config.data_dir)?;
        Self::builder(config, store).build()
    }

    /// Open on a throwaway store
    pub fn open_temporary(config: PlatformConfig) -> Result<Self, PlatformError> {
        Self::builder(config, Store::temporary()?).build()
    }

    pub fn builder(config: PlatformConfig, store: Store) -> PlatformBuilder {
        PlatformBuilder {
            config,
            store,
            capabilities: None,
            verifier: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn ledger(&self) -> &Arc<LedgerService> {
        &self.ledger
    }

    pub fn escrow(&self) -> &Arc<EscrowService> {
        &self.escrow
    }

    pub fn marketplace(&self) -> &Arc<MarketplaceService> {
        &self.marketplace
    }

    /// The identity the escrow service moves funds as
    pub fn custodian(&self) -> Caller {
        Caller::local(&self.custodian)
    }

    /// The identity the marketplace drives escrows as
    pub fn operator(&self) -> Caller {
        Caller::local(&self.operator)
    }

    /// Start the auto-release sweeper at the configured interval
    pub fn spawn_sweeper(&self) -> AutoReleaseSweeper {
        self.spawn_sweeper_every(Duration::from_secs(self.config.escrow.sweep_interval_secs))
    }

    pub fn spawn_sweeper_every(&self, interval: Duration) -> AutoReleaseSweeper {
        AutoReleaseSweeper::start(Arc::clone(&self.escrow), interval)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }
}

pub struct PlatformBuilder {
    config: PlatformConfig,
    store: Store,
    capabilities: Option<Capabilities>,
    verifier: Arc<dyn IdentityVerifier>,
    clock: Arc<dyn Clock>,
}

impl PlatformBuilder {
    /// Use these roles instead of the ones in the config
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Platform, PlatformError> {
        let PlatformBuilder {
            config,
            store,
            capabilities,
            verifier,
            clock,
        } = self;
        config.validate()?;

        let custodian = store.get_or_create_keypair(CUSTODIAN_LABEL)?;
        let operator = store.get_or_create_keypair(OPERATOR_LABEL)?;

        let capabilities = match capabilities {
            Some(caps) => caps,
            None => config.roles.to_capabilities()?,
        };
        let capabilities = Arc::new(
            capabilities
                .with_operator(custodian.did())
                .with_operator(operator.did()),
        );

        let ledger = Arc::new(LedgerService::open(
            &store,
            config.ledger.clone(),
            Arc::clone(&capabilities),
            Arc::clone(&clock),
        )?);

        let ledger_port = Arc::new(CustodialLedger::new(
            Arc::clone(&ledger),
            Caller::local(&custodian),
            config.relay.clone(),
        ));
        let escrow = Arc::new(EscrowService::open(
            &store,
            config.escrow.clone(),
            Arc::clone(&capabilities),
            ledger_port,
            Arc::clone(&clock),
        )?);

        let escrow_port = Arc::new(OperatorEscrow::new(
            Arc::clone(&escrow),
            Caller::local(&operator),
            config.relay.clone(),
        ));
        let marketplace = Arc::new(MarketplaceService::open(
            &store,
            config.marketplace.clone(),
            Arc::clone(&capabilities),
            verifier,
            escrow_port,
            clock,
        )?);

        tracing::info!(
            data_dir = %config.data_dir.display(),
            custodian = %custodian.did(),
            operator = %operator.did(),
            "platform opened"
        );

        Ok(Platform {
            config,
            store,
            capabilities,
            custodian,
            operator,
            ledger,
            escrow,
            marketplace,
        })
    }
}
