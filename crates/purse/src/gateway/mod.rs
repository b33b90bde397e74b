//! Mint gateway
//!
//! The [`MintConnector`] trait is the engine's view of a mint's HTTP
//! surface; [`HttpClient`] is the production implementation and tests
//! substitute their own. [`MintGateway`] wraps a connector with the
//! shared per-mint rate limiter and request batching, and is what the
//! rest of the engine calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use purse_core::mint_url::MintUrl;
use purse_core::quote::{
    CheckStateRequest, CheckStateResponse, KeysetResponse, MeltQuoteRequest, MeltQuoteResponse,
    MeltRequest, MintInfo, MintQuoteRequest, MintQuoteResponse, MintRequest, MintResponse,
    ProofStateInfo, RestoreRequest, RestoreResponse, SwapRequest, SwapResponse,
};
use purse_core::{KeySet, KeysetId, PublicKey};

use crate::error::Error;

mod http;
mod rate_limit;

pub use http::HttpClient;
pub use rate_limit::RateLimiter;

/// Connector to a mint
#[async_trait]
pub trait MintConnector: std::fmt::Debug + Send + Sync {
    /// Get mint info
    async fn get_mint_info(&self, mint_url: &MintUrl) -> Result<MintInfo, Error>;

    /// Get mint keysets
    async fn get_keysets(&self, mint_url: &MintUrl) -> Result<KeysetResponse, Error>;

    /// Get keys of a keyset
    async fn get_keyset_keys(
        &self,
        mint_url: &MintUrl,
        keyset_id: KeysetId,
    ) -> Result<KeySet, Error>;

    /// Create a bolt11 mint quote
    async fn post_mint_quote(
        &self,
        mint_url: &MintUrl,
        request: MintQuoteRequest,
    ) -> Result<MintQuoteResponse, Error>;

    /// Check a bolt11 mint quote
    async fn get_mint_quote_status(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MintQuoteResponse, Error>;

    /// Mint tokens against a paid quote
    async fn post_mint(
        &self,
        mint_url: &MintUrl,
        request: MintRequest,
    ) -> Result<MintResponse, Error>;

    /// Create a bolt11 melt quote
    async fn post_melt_quote(
        &self,
        mint_url: &MintUrl,
        request: MeltQuoteRequest,
    ) -> Result<MeltQuoteResponse, Error>;

    /// Check a bolt11 melt quote
    async fn get_melt_quote_status(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MeltQuoteResponse, Error>;

    /// Submit a melt
    async fn post_melt(
        &self,
        mint_url: &MintUrl,
        request: MeltRequest,
    ) -> Result<MeltQuoteResponse, Error>;

    /// Swap proofs for new proofs
    async fn post_swap(
        &self,
        mint_url: &MintUrl,
        request: SwapRequest,
    ) -> Result<SwapResponse, Error>;

    /// Check proof spend states; at most
    /// [`CheckStateRequest::MAX_YS`] values per call
    async fn post_check_state(
        &self,
        mint_url: &MintUrl,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error>;

    /// Re-request signatures for previously submitted outputs
    async fn post_restore(
        &self,
        mint_url: &MintUrl,
        request: RestoreRequest,
    ) -> Result<RestoreResponse, Error>;
}

/// Rate-limited request surface to mints
#[derive(Debug, Clone)]
pub struct MintGateway {
    connector: Arc<dyn MintConnector>,
    limiter: Arc<RateLimiter>,
}

impl MintGateway {
    /// Create a gateway over a connector with default pacing
    pub fn new(connector: Arc<dyn MintConnector>) -> Self {
        Self {
            connector,
            limiter: Arc::new(RateLimiter::default()),
        }
    }

    /// Create a gateway with explicit pacing
    pub fn with_min_interval(connector: Arc<dyn MintConnector>, min_interval: Duration) -> Self {
        Self {
            connector,
            limiter: Arc::new(RateLimiter::new(min_interval)),
        }
    }

    /// Get mint info
    pub async fn get_mint_info(&self, mint_url: &MintUrl) -> Result<MintInfo, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.get_mint_info(mint_url).await
    }

    /// Get mint keysets
    pub async fn get_keysets(&self, mint_url: &MintUrl) -> Result<KeysetResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.get_keysets(mint_url).await
    }

    /// Get keys of a keyset
    pub async fn get_keyset_keys(
        &self,
        mint_url: &MintUrl,
        keyset_id: KeysetId,
    ) -> Result<KeySet, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.get_keyset_keys(mint_url, keyset_id).await
    }

    /// Create a bolt11 mint quote
    pub async fn create_mint_quote(
        &self,
        mint_url: &MintUrl,
        request: MintQuoteRequest,
    ) -> Result<MintQuoteResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.post_mint_quote(mint_url, request).await
    }

    /// Check a bolt11 mint quote
    pub async fn check_mint_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MintQuoteResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.get_mint_quote_status(mint_url, quote_id).await
    }

    /// Mint tokens against a paid quote
    pub async fn mint(
        &self,
        mint_url: &MintUrl,
        request: MintRequest,
    ) -> Result<MintResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.post_mint(mint_url, request).await
    }

    /// Create a bolt11 melt quote
    pub async fn create_melt_quote(
        &self,
        mint_url: &MintUrl,
        request: MeltQuoteRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.post_melt_quote(mint_url, request).await
    }

    /// Check a bolt11 melt quote
    pub async fn check_melt_quote(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MeltQuoteResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.get_melt_quote_status(mint_url, quote_id).await
    }

    /// Submit a melt
    pub async fn melt_bolt11(
        &self,
        mint_url: &MintUrl,
        request: MeltRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.post_melt(mint_url, request).await
    }

    /// Swap proofs for new proofs
    pub async fn swap(
        &self,
        mint_url: &MintUrl,
        request: SwapRequest,
    ) -> Result<SwapResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.post_swap(mint_url, request).await
    }

    /// Check proof spend states, batching into chunks the mint accepts
    pub async fn check_proof_states(
        &self,
        mint_url: &MintUrl,
        ys: Vec<PublicKey>,
    ) -> Result<Vec<ProofStateInfo>, Error> {
        let mut states = Vec::with_capacity(ys.len());

        for chunk in ys.chunks(CheckStateRequest::MAX_YS) {
            self.limiter.acquire(mint_url).await;
            let response = self
                .connector
                .post_check_state(
                    mint_url,
                    CheckStateRequest {
                        ys: chunk.to_vec(),
                    },
                )
                .await?;
            states.extend(response.states);
        }

        Ok(states)
    }

    /// Re-request signatures for previously submitted outputs
    pub async fn restore(
        &self,
        mint_url: &MintUrl,
        request: RestoreRequest,
    ) -> Result<RestoreResponse, Error> {
        self.limiter.acquire(mint_url).await;
        self.connector.post_restore(mint_url, request).await
    }
}
