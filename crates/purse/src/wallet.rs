//! Wallet facade
//!
//! Wires the engine together: database, gateway, signer, transports,
//! subscription manager and the melt service, behind one struct with
//! the high-level calls.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use purse_core::mint_url::MintUrl;
use purse_core::quote::{MintInfo, MintQuoteRequest};
use purse_core::Amount;

use crate::database::WalletDatabase;
use crate::error::Error;
use crate::events::WalletEvent;
use crate::gateway::{MintConnector, MintGateway};
use crate::melt::{MeltHandler, MeltOperationService};
use crate::operation::MeltOperation;
use crate::proofs::total_amount;
use crate::signer::EcashSigner;
use crate::subscription::SubscriptionManager;
use crate::transport::{
    HybridConfig, HybridTransport, PollingConfig, PollingTransport, RealtimeTransport, WsConfig,
    WsTransport,
};
use crate::types::{MintQuote, ProofState, Transaction, TransactionDirection};

/// Builder for [`Wallet`]
pub struct WalletBuilder {
    database: Option<Arc<dyn WalletDatabase>>,
    connector: Option<Arc<dyn MintConnector>>,
    signer: Option<Arc<dyn EcashSigner>>,
    polling_interval: Duration,
    fast_polling_interval: Duration,
    request_interval: Duration,
}

impl std::fmt::Debug for WalletBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletBuilder")
            .field("polling_interval", &self.polling_interval)
            .field("fast_polling_interval", &self.fast_polling_interval)
            .field("request_interval", &self.request_interval)
            .finish_non_exhaustive()
    }
}

impl Default for WalletBuilder {
    fn default() -> Self {
        Self {
            database: None,
            connector: None,
            signer: None,
            polling_interval: PollingConfig::default().interval,
            fast_polling_interval: HybridConfig::default().fast_interval,
            request_interval: Duration::from_millis(100),
        }
    }
}

impl WalletBuilder {
    /// Create a builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database
    pub fn database(mut self, database: Arc<dyn WalletDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    /// Set the mint connector
    pub fn connector(mut self, connector: Arc<dyn MintConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the signer capability
    pub fn signer(mut self, signer: Arc<dyn EcashSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Slow polling interval used while the websocket is healthy
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Fast polling interval used once a websocket has failed
    pub fn fast_polling_interval(mut self, interval: Duration) -> Self {
        self.fast_polling_interval = interval;
        self
    }

    /// Minimum spacing between requests to one mint
    pub fn request_interval(mut self, interval: Duration) -> Self {
        self.request_interval = interval;
        self
    }

    /// Build the wallet
    pub fn build(self) -> Result<Wallet, Error> {
        let database = self
            .database
            .ok_or_else(|| Error::Custom("wallet requires a database".to_string()))?;
        let connector = self
            .connector
            .ok_or_else(|| Error::Custom("wallet requires a connector".to_string()))?;
        let signer = self
            .signer
            .ok_or_else(|| Error::Custom("wallet requires a signer".to_string()))?;

        let gateway = MintGateway::with_min_interval(connector, self.request_interval);

        let ws = Arc::new(WsTransport::new(WsConfig { reconnect: false }));
        let polling = Arc::new(PollingTransport::new(
            gateway.clone(),
            PollingConfig {
                interval: self.polling_interval,
            },
        ));
        let transport = Arc::new(HybridTransport::new(
            ws,
            polling,
            HybridConfig {
                fast_interval: self.fast_polling_interval,
            },
        ));
        let subscriptions =
            SubscriptionManager::new(Arc::clone(&transport) as Arc<dyn RealtimeTransport>);

        let handler = MeltHandler::new(Arc::clone(&database), gateway.clone(), Arc::clone(&signer));
        let melt = MeltOperationService::new(Arc::clone(&database), handler);

        Ok(Wallet {
            db: database,
            gateway,
            transport,
            subscriptions,
            melt,
        })
    }
}

/// The wallet engine
#[derive(Debug)]
pub struct Wallet {
    db: Arc<dyn WalletDatabase>,
    gateway: MintGateway,
    transport: Arc<HybridTransport>,
    subscriptions: Arc<SubscriptionManager>,
    melt: Arc<MeltOperationService>,
}

impl Wallet {
    /// Start building a wallet
    pub fn builder() -> WalletBuilder {
        WalletBuilder::new()
    }

    /// Trust a mint: fetch and persist its info and keysets.
    /// Operations only run against trusted mints.
    #[instrument(skip(self))]
    pub async fn add_mint(&self, mint_url: MintUrl) -> Result<MintInfo, Error> {
        let info = self.gateway.get_mint_info(&mint_url).await?;
        let keysets = self.gateway.get_keysets(&mint_url).await?;

        self.db
            .add_mint(mint_url.clone(), Some(info.clone()))
            .await?;
        self.db.add_keysets(mint_url, keysets.keysets).await?;

        Ok(info)
    }

    /// Forget a mint
    pub async fn remove_mint(&self, mint_url: MintUrl) -> Result<(), Error> {
        self.transport.close_mint(&mint_url).await;
        self.db.remove_mint(mint_url).await?;
        Ok(())
    }

    /// Spendable balance for a mint and unit
    pub async fn balance(&self, mint_url: MintUrl, unit: impl Into<String>) -> Result<Amount, Error> {
        self.balance_in_state(mint_url, unit, ProofState::Ready).await
    }

    /// Balance committed to operations that have reached the mint
    pub async fn inflight_balance(
        &self,
        mint_url: MintUrl,
        unit: impl Into<String>,
    ) -> Result<Amount, Error> {
        self.balance_in_state(mint_url, unit, ProofState::Inflight)
            .await
    }

    async fn balance_in_state(
        &self,
        mint_url: MintUrl,
        unit: impl Into<String>,
        state: ProofState,
    ) -> Result<Amount, Error> {
        let proofs = self
            .db
            .get_proofs(Some(mint_url), Some(unit.into()), Some(vec![state]))
            .await?;
        Ok(total_amount(&proofs))
    }

    /// Request a bolt11 mint quote and persist it
    #[instrument(skip(self))]
    pub async fn mint_quote(
        &self,
        mint_url: MintUrl,
        amount: Amount,
        unit: impl Into<String> + std::fmt::Debug,
    ) -> Result<MintQuote, Error> {
        let unit = unit.into();

        if !self.db.get_mints().await?.contains_key(&mint_url) {
            return Err(Error::UnknownMint(mint_url));
        }

        let response = self
            .gateway
            .create_mint_quote(
                &mint_url,
                MintQuoteRequest {
                    amount,
                    unit: unit.clone(),
                    description: None,
                },
            )
            .await?;

        let quote = MintQuote {
            id: response.quote,
            mint_url,
            amount,
            unit,
            request: response.request,
            state: response.state,
            expiry: response.expiry,
        };
        self.db.add_mint_quote(quote.clone()).await?;

        Ok(quote)
    }

    /// Re-check a stored mint quote against the mint
    pub async fn check_mint_quote(&self, quote_id: &str) -> Result<MintQuote, Error> {
        let mut quote = self
            .db
            .get_mint_quote(quote_id)
            .await?
            .ok_or(Error::QuoteUnknown)?;

        let response = self
            .gateway
            .check_mint_quote(&quote.mint_url, quote_id)
            .await?;

        quote.state = response.state;
        self.db.add_mint_quote(quote.clone()).await?;

        Ok(quote)
    }

    /// Melt: settle a bolt11 invoice with ecash held against the mint.
    ///
    /// Drives init, prepare and execute; the returned operation is
    /// `finalized`, `pending` or `rolled_back`. A pending operation can
    /// be driven further with [`Wallet::watch_melt`] or the service's
    /// pending checks.
    #[instrument(skip(self, invoice))]
    pub async fn melt(
        &self,
        mint_url: MintUrl,
        unit: impl Into<String> + std::fmt::Debug,
        invoice: impl Into<String> + std::fmt::Debug,
    ) -> Result<MeltOperation, Error> {
        let operation = self.melt.init(mint_url, unit, invoice).await?;
        self.melt.prepare(operation.id).await?;
        self.melt.execute(operation.id).await
    }

    /// Watch a pending melt over the realtime channel
    pub async fn watch_melt(
        &self,
        operation_id: uuid::Uuid,
    ) -> Result<crate::subscription::SubscriptionHandle, Error> {
        self.melt
            .watch_pending(operation_id, &self.subscriptions)
            .await
    }

    /// Run the startup recovery pass
    pub async fn recover(&self) -> Result<crate::melt::RecoveryReport, Error> {
        self.melt.recover_pending_operations().await
    }

    /// Subscribe to wallet events
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<WalletEvent> {
        self.melt.events()
    }

    /// Transaction history
    pub async fn transactions(
        &self,
        mint_url: Option<MintUrl>,
        direction: Option<TransactionDirection>,
        unit: Option<String>,
    ) -> Result<Vec<Transaction>, Error> {
        Ok(self.db.list_transactions(mint_url, direction, unit).await?)
    }

    /// Suspend realtime delivery (e.g. when the app goes to the
    /// background); subscriptions survive and are re-sent on resume
    pub async fn pause(&self) {
        self.subscriptions.pause().await;
    }

    /// Resume realtime delivery
    pub async fn resume(&self) {
        self.subscriptions.resume().await;
    }

    /// The melt operation service
    pub fn melt_service(&self) -> &Arc<MeltOperationService> {
        &self.melt
    }

    /// The subscription manager
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }
}
