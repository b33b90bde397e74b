//! HTTP mint connector

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::instrument;

use purse_core::mint_url::MintUrl;
use purse_core::quote::{
    CheckStateRequest, CheckStateResponse, KeysResponse, KeysetResponse, MeltQuoteRequest,
    MeltQuoteResponse, MeltRequest, MintInfo, MintQuoteRequest, MintQuoteResponse, MintRequest,
    MintResponse, RestoreRequest, RestoreResponse, SwapRequest, SwapResponse,
};
use purse_core::{KeySet, KeysetId};

use super::MintConnector;
use crate::error::{Error, ErrorResponse};

/// Http Client
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Create new [`HttpClient`]
    pub fn new() -> Self {
        Self {
            inner: Client::new(),
        }
    }

    async fn get_json(&self, url: url::Url) -> Result<Value, Error> {
        Ok(self.inner.get(url).send().await?.json::<Value>().await?)
    }

    async fn post_json<B>(&self, url: url::Url, body: &B) -> Result<Value, Error>
    where
        B: serde::Serialize + Sync,
    {
        Ok(self
            .inner
            .post(url)
            .json(body)
            .send()
            .await?
            .json::<Value>()
            .await?)
    }
}

fn decode<T>(value: Value) -> Result<T, Error>
where
    T: serde::de::DeserializeOwned,
{
    match serde_json::from_value::<T>(value.clone()) {
        Ok(decoded) => Ok(decoded),
        Err(err) => {
            tracing::warn!("Failed to decode mint response: {}", err);
            Err(ErrorResponse::from_value(value)?.into())
        }
    }
}

#[async_trait]
impl MintConnector for HttpClient {
    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_mint_info(&self, mint_url: &MintUrl) -> Result<MintInfo, Error> {
        let url = mint_url.join_paths(&["v1", "info"])?;
        decode(self.get_json(url).await?)
    }

    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_keysets(&self, mint_url: &MintUrl) -> Result<KeysetResponse, Error> {
        let url = mint_url.join_paths(&["v1", "keysets"])?;
        decode(self.get_json(url).await?)
    }

    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_keyset_keys(
        &self,
        mint_url: &MintUrl,
        keyset_id: KeysetId,
    ) -> Result<KeySet, Error> {
        let url = mint_url.join_paths(&["v1", "keys", &keyset_id.to_string()])?;
        let response: KeysResponse = decode(self.get_json(url).await?)?;
        response
            .keysets
            .into_iter()
            .find(|keyset| keyset.id == keyset_id)
            .ok_or(Error::KeysetNotFound)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn post_mint_quote(
        &self,
        mint_url: &MintUrl,
        request: MintQuoteRequest,
    ) -> Result<MintQuoteResponse, Error> {
        let url = mint_url.join_paths(&["v1", "mint", "quote", "bolt11"])?;
        decode(self.post_json(url, &request).await?)
    }

    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_mint_quote_status(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MintQuoteResponse, Error> {
        let url = mint_url.join_paths(&["v1", "mint", "quote", "bolt11", quote_id])?;
        decode(self.get_json(url).await?)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn post_mint(
        &self,
        mint_url: &MintUrl,
        request: MintRequest,
    ) -> Result<MintResponse, Error> {
        let url = mint_url.join_paths(&["v1", "mint", "bolt11"])?;
        decode(self.post_json(url, &request).await?)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn post_melt_quote(
        &self,
        mint_url: &MintUrl,
        request: MeltQuoteRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        let url = mint_url.join_paths(&["v1", "melt", "quote", "bolt11"])?;
        decode(self.post_json(url, &request).await?)
    }

    #[instrument(skip(self), fields(mint_url = %mint_url))]
    async fn get_melt_quote_status(
        &self,
        mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MeltQuoteResponse, Error> {
        let url = mint_url.join_paths(&["v1", "melt", "quote", "bolt11", quote_id])?;
        decode(self.get_json(url).await?)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn post_melt(
        &self,
        mint_url: &MintUrl,
        request: MeltRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        let url = mint_url.join_paths(&["v1", "melt", "bolt11"])?;
        decode(self.post_json(url, &request).await?)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn post_swap(
        &self,
        mint_url: &MintUrl,
        request: SwapRequest,
    ) -> Result<SwapResponse, Error> {
        let url = mint_url.join_paths(&["v1", "swap"])?;
        decode(self.post_json(url, &request).await?)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn post_check_state(
        &self,
        mint_url: &MintUrl,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error> {
        let url = mint_url.join_paths(&["v1", "checkstate"])?;
        decode(self.post_json(url, &request).await?)
    }

    #[instrument(skip(self, request), fields(mint_url = %mint_url))]
    async fn post_restore(
        &self,
        mint_url: &MintUrl,
        request: RestoreRequest,
    ) -> Result<RestoreResponse, Error> {
        let url = mint_url.join_paths(&["v1", "restore"])?;
        decode(self.post_json(url, &request).await?)
    }
}
