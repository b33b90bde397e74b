//! Test doubles: a programmable in-memory mint, a deterministic fake
//! signer and a controllable realtime transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use purse::database::{WalletDatabase, WalletMemoryDatabase};
use purse::gateway::{MintConnector, MintGateway};
use purse::melt::{MeltHandler, MeltOperationService};
use purse::signer::EcashSigner;
use purse::transport::{RealtimeTransport, TransportEvent, TransportNotice};
use purse::types::{ProofInfo, ProofState};
use purse::Error;
use purse_core::mint_url::MintUrl;
use purse_core::quote::{
    CheckStateRequest, CheckStateResponse, KeysetResponse, MeltQuoteRequest, MeltQuoteResponse,
    MeltQuoteState, MeltRequest, MintInfo, MintQuoteRequest, MintQuoteResponse, MintQuoteState,
    MintRequest, MintResponse, ProofStateInfo, RestoreRequest, RestoreResponse, SpendState,
    SwapRequest, SwapResponse,
};
use purse_core::ws::WsRequest;
use purse_core::{
    Amount, BlindSignature, KeySet, KeySetInfo, Keys, KeysetId, PreMint, PreMintSecrets, Proof,
    Proofs, PublicKey, Secret,
};

pub const KEYSET_ID: &str = "00deadbeef123456";

pub fn mint_url() -> MintUrl {
    MintUrl::from_str("https://mint.example.com").unwrap()
}

pub fn keyset_id() -> KeysetId {
    KeysetId::from_str(KEYSET_ID).unwrap()
}

/// Deterministic pseudo-point for a label
pub fn fake_point(label: &str) -> PublicKey {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    label.hash(&mut hasher);
    PublicKey::from_hex(format!("02{:064x}", hasher.finish())).unwrap()
}

/// Y value the fake signer derives for a secret
pub fn fake_y(secret: &Secret) -> PublicKey {
    fake_point(&format!("y/{}", secret))
}

/// Deterministic stand-in for the blind-signature library
#[derive(Debug, Default)]
pub struct FakeSigner;

impl EcashSigner for FakeSigner {
    fn y_for_secret(&self, secret: &Secret) -> Result<PublicKey, Error> {
        Ok(fake_y(secret))
    }

    fn premint_secrets(
        &self,
        keyset_id: KeysetId,
        counter_start: u32,
        amounts: &[Amount],
    ) -> Result<PreMintSecrets, Error> {
        let mut premint = PreMintSecrets::new(keyset_id, counter_start);
        for (index, amount) in amounts.iter().enumerate() {
            let counter = counter_start + index as u32;
            let secret = Secret::new(format!("det/{keyset_id}/{counter}"));
            let blinded_secret = fake_point(&format!("blind/{keyset_id}/{counter}"));
            premint.secrets.push(PreMint {
                blinded_message: purse_core::BlindedMessage::new(
                    *amount,
                    keyset_id,
                    blinded_secret,
                ),
                secret,
                r: format!("{counter:064x}"),
                amount: *amount,
            });
        }
        Ok(premint)
    }

    fn unblind_signatures(
        &self,
        signatures: &[BlindSignature],
        premint: &PreMintSecrets,
        _keys: &Keys,
    ) -> Result<Proofs, Error> {
        if signatures.len() > premint.len() {
            return Err(Error::MintProtocol(
                "more signatures than outputs".to_string(),
            ));
        }
        Ok(signatures
            .iter()
            .zip(premint.secrets.iter())
            .map(|(signature, pre)| {
                Proof::new(
                    signature.amount,
                    signature.keyset_id,
                    pre.secret.clone(),
                    signature.c.clone(),
                )
            })
            .collect())
    }
}

/// What the fake mint does with a melt submission
#[derive(Debug, Clone)]
pub enum MeltReply {
    /// Settle immediately, returning change of the given amounts
    Paid(Vec<Amount>),
    /// Report the lightning payment in flight
    Pending,
    /// Reject as unpaid
    Unpaid,
    /// Fail the request at the transport level
    TransportError,
}

#[derive(Debug)]
pub struct FakeMintState {
    pub quote_amount: Amount,
    pub quote_fee_reserve: Amount,
    pub melt_reply: MeltReply,
    pub next_quote: u64,
    pub melt_quotes: HashMap<String, MeltQuoteResponse>,
    pub mint_quotes: HashMap<String, MintQuoteResponse>,
    pub proof_states: HashMap<PublicKey, SpendState>,
    pub signatures_by_output: HashMap<PublicKey, BlindSignature>,
    pub melt_requests: Vec<MeltRequest>,
    pub swap_calls: usize,
    pub check_state_calls: Vec<usize>,
    pub quote_status_delay: Option<Duration>,
    pub input_fee_ppk: u64,
}

/// Programmable in-memory mint
#[derive(Debug)]
pub struct FakeMint {
    pub state: Mutex<FakeMintState>,
}

impl FakeMint {
    pub fn new(quote_amount: u64, quote_fee_reserve: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeMintState {
                quote_amount: Amount::from(quote_amount),
                quote_fee_reserve: Amount::from(quote_fee_reserve),
                melt_reply: MeltReply::Paid(Vec::new()),
                next_quote: 0,
                melt_quotes: HashMap::new(),
                mint_quotes: HashMap::new(),
                proof_states: HashMap::new(),
                signatures_by_output: HashMap::new(),
                melt_requests: Vec::new(),
                swap_calls: 0,
                check_state_calls: Vec::new(),
                quote_status_delay: None,
                input_fee_ppk: 0,
            }),
        })
    }

    pub fn set_melt_reply(&self, reply: MeltReply) {
        self.state.lock().melt_reply = reply;
    }

    pub fn set_quote_state(&self, quote_id: &str, state: MeltQuoteState) {
        let mut inner = self.state.lock();
        if let Some(quote) = inner.melt_quotes.get_mut(quote_id) {
            quote.state = state;
            if state == MeltQuoteState::Paid {
                quote.payment_preimage = Some("preimage".to_string());
            }
        }
    }

    pub fn set_proof_state(&self, y: PublicKey, state: SpendState) {
        self.state.lock().proof_states.insert(y, state);
    }

    pub fn set_quote_status_delay(&self, delay: Duration) {
        self.state.lock().quote_status_delay = Some(delay);
    }

    pub fn swap_calls(&self) -> usize {
        self.state.lock().swap_calls
    }

    pub fn melt_requests(&self) -> Vec<MeltRequest> {
        self.state.lock().melt_requests.clone()
    }

    pub fn check_state_calls(&self) -> Vec<usize> {
        self.state.lock().check_state_calls.clone()
    }

    fn keysets(&self) -> Vec<KeySetInfo> {
        vec![KeySetInfo {
            id: keyset_id(),
            unit: "sat".to_string(),
            active: true,
            input_fee_ppk: self.state.lock().input_fee_ppk,
        }]
    }

    fn keys(&self) -> Keys {
        let mut map = std::collections::BTreeMap::new();
        for power in 0..12u64 {
            let amount = Amount::from(1 << power);
            map.insert(amount, fake_point(&format!("mintkey/{amount}")));
        }
        Keys::new(map)
    }

    fn sign(output: &purse_core::BlindedMessage) -> BlindSignature {
        BlindSignature {
            amount: output.amount,
            keyset_id: output.keyset_id,
            c: fake_point(&format!("sig/{}", output.blinded_secret)),
        }
    }
}

#[async_trait]
impl MintConnector for FakeMint {
    async fn get_mint_info(&self, _mint_url: &MintUrl) -> Result<MintInfo, Error> {
        Ok(MintInfo {
            name: Some("fake mint".to_string()),
            ..Default::default()
        })
    }

    async fn get_keysets(&self, _mint_url: &MintUrl) -> Result<KeysetResponse, Error> {
        Ok(KeysetResponse {
            keysets: self.keysets(),
        })
    }

    async fn get_keyset_keys(
        &self,
        _mint_url: &MintUrl,
        keyset_id: KeysetId,
    ) -> Result<KeySet, Error> {
        Ok(KeySet {
            id: keyset_id,
            unit: "sat".to_string(),
            keys: self.keys(),
        })
    }

    async fn post_mint_quote(
        &self,
        _mint_url: &MintUrl,
        _request: MintQuoteRequest,
    ) -> Result<MintQuoteResponse, Error> {
        let mut inner = self.state.lock();
        inner.next_quote += 1;
        let quote = format!("mint-quote-{}", inner.next_quote);
        let response = MintQuoteResponse {
            quote: quote.clone(),
            request: "lnbc-fake-invoice".to_string(),
            state: MintQuoteState::Unpaid,
            expiry: u64::MAX,
        };
        inner.mint_quotes.insert(quote, response.clone());
        Ok(response)
    }

    async fn get_mint_quote_status(
        &self,
        _mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MintQuoteResponse, Error> {
        self.state
            .lock()
            .mint_quotes
            .get(quote_id)
            .cloned()
            .ok_or(Error::QuoteUnknown)
    }

    async fn post_mint(
        &self,
        _mint_url: &MintUrl,
        request: MintRequest,
    ) -> Result<MintResponse, Error> {
        Ok(MintResponse {
            signatures: request.outputs.iter().map(Self::sign).collect(),
        })
    }

    async fn post_melt_quote(
        &self,
        _mint_url: &MintUrl,
        _request: MeltQuoteRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        let mut inner = self.state.lock();
        inner.next_quote += 1;
        let quote = format!("melt-quote-{}", inner.next_quote);
        let response = MeltQuoteResponse {
            quote: quote.clone(),
            amount: inner.quote_amount,
            fee_reserve: inner.quote_fee_reserve,
            state: MeltQuoteState::Unpaid,
            expiry: u64::MAX,
            payment_preimage: None,
            change: None,
        };
        inner.melt_quotes.insert(quote, response.clone());
        Ok(response)
    }

    async fn get_melt_quote_status(
        &self,
        _mint_url: &MintUrl,
        quote_id: &str,
    ) -> Result<MeltQuoteResponse, Error> {
        let delay = self.state.lock().quote_status_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .melt_quotes
            .get(quote_id)
            .cloned()
            .ok_or(Error::QuoteUnknown)
    }

    async fn post_melt(
        &self,
        _mint_url: &MintUrl,
        request: MeltRequest,
    ) -> Result<MeltQuoteResponse, Error> {
        let mut inner = self.state.lock();
        inner.melt_requests.push(request.clone());

        let reply = inner.melt_reply.clone();
        let mut response = inner
            .melt_quotes
            .get(&request.quote)
            .cloned()
            .ok_or(Error::QuoteUnknown)?;

        match reply {
            MeltReply::Paid(change_amounts) => {
                for input in &request.inputs {
                    inner
                        .proof_states
                        .insert(fake_y(&input.secret), SpendState::Spent);
                }

                let blank = request.outputs.clone().unwrap_or_default();
                let change: Vec<BlindSignature> = blank
                    .iter()
                    .zip(change_amounts.iter())
                    .map(|(output, amount)| BlindSignature {
                        amount: *amount,
                        keyset_id: output.keyset_id,
                        c: fake_point(&format!("sig/{}", output.blinded_secret)),
                    })
                    .collect();

                response.state = MeltQuoteState::Paid;
                response.payment_preimage = Some("preimage".to_string());
                response.change = (!change.is_empty()).then_some(change);
                inner
                    .melt_quotes
                    .insert(request.quote.clone(), response.clone());
                Ok(response)
            }
            MeltReply::Pending => {
                for input in &request.inputs {
                    inner
                        .proof_states
                        .insert(fake_y(&input.secret), SpendState::Pending);
                }
                response.state = MeltQuoteState::Pending;
                inner
                    .melt_quotes
                    .insert(request.quote.clone(), response.clone());
                Ok(response)
            }
            MeltReply::Unpaid => {
                response.state = MeltQuoteState::Unpaid;
                Ok(response)
            }
            MeltReply::TransportError => Err(Error::Transport("connection reset".to_string())),
        }
    }

    async fn post_swap(
        &self,
        _mint_url: &MintUrl,
        request: SwapRequest,
    ) -> Result<SwapResponse, Error> {
        let mut inner = self.state.lock();
        inner.swap_calls += 1;

        for input in &request.inputs {
            inner
                .proof_states
                .insert(fake_y(&input.secret), SpendState::Spent);
        }

        let signatures: Vec<BlindSignature> = request
            .outputs
            .iter()
            .map(|output| {
                let signature = Self::sign(output);
                inner
                    .signatures_by_output
                    .insert(output.blinded_secret.clone(), signature.clone());
                signature
            })
            .collect();

        Ok(SwapResponse { signatures })
    }

    async fn post_check_state(
        &self,
        _mint_url: &MintUrl,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error> {
        let mut inner = self.state.lock();
        inner.check_state_calls.push(request.ys.len());

        let states = request
            .ys
            .into_iter()
            .map(|y| {
                let state = inner
                    .proof_states
                    .get(&y)
                    .copied()
                    .unwrap_or(SpendState::Unspent);
                ProofStateInfo {
                    y,
                    state,
                    witness: None,
                }
            })
            .collect();

        Ok(CheckStateResponse { states })
    }

    async fn post_restore(
        &self,
        _mint_url: &MintUrl,
        request: RestoreRequest,
    ) -> Result<RestoreResponse, Error> {
        let inner = self.state.lock();

        let mut outputs = Vec::new();
        let mut signatures = Vec::new();
        for output in request.outputs {
            if let Some(signature) = inner.signatures_by_output.get(&output.blinded_secret) {
                outputs.push(output);
                signatures.push(signature.clone());
            }
        }

        Ok(RestoreResponse {
            outputs,
            signatures,
        })
    }
}

/// Controllable transport double, standing in for the websocket side
#[derive(Debug)]
pub struct FakeTransport {
    pub events: broadcast::Sender<TransportNotice>,
    pub sent: Mutex<Vec<(MintUrl, WsRequest)>>,
    pub paused: Mutex<bool>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            sent: Mutex::new(Vec::new()),
            paused: Mutex::new(false),
        })
    }

    pub fn emit(&self, mint_url: &MintUrl, event: TransportEvent) {
        let _ = self
            .events
            .send(TransportNotice::new(mint_url.clone(), event));
    }

    pub fn sent(&self) -> Vec<(MintUrl, WsRequest)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    fn events(&self) -> broadcast::Receiver<TransportNotice> {
        self.events.subscribe()
    }

    async fn send(&self, mint_url: &MintUrl, request: WsRequest) -> Result<(), Error> {
        self.sent.lock().push((mint_url.clone(), request));
        Ok(())
    }

    async fn close_mint(&self, _mint_url: &MintUrl) {}

    async fn close_all(&self) {}

    async fn pause(&self) {
        *self.paused.lock() = true;
    }

    async fn resume(&self) {
        *self.paused.lock() = false;
    }
}

/// Assembled engine over the fakes
pub struct TestWallet {
    pub db: Arc<WalletMemoryDatabase>,
    pub mint: Arc<FakeMint>,
    pub gateway: MintGateway,
    pub service: Arc<MeltOperationService>,
}

/// Build an engine against a fake mint quoting `amount`/`fee_reserve`,
/// holding `denominations` as ready proofs
pub async fn setup(quote_amount: u64, fee_reserve: u64, denominations: &[u64]) -> TestWallet {
    let db = Arc::new(WalletMemoryDatabase::new());
    let mint = FakeMint::new(quote_amount, fee_reserve);

    let gateway = MintGateway::with_min_interval(
        mint.clone() as Arc<dyn MintConnector>,
        Duration::ZERO,
    );

    let db_dyn: Arc<dyn WalletDatabase> = db.clone();
    db_dyn.add_mint(mint_url(), None).await.unwrap();
    db_dyn
        .add_keysets(
            mint_url(),
            vec![KeySetInfo {
                id: keyset_id(),
                unit: "sat".to_string(),
                active: true,
                input_fee_ppk: 0,
            }],
        )
        .await
        .unwrap();

    seed_proofs(&db_dyn, denominations).await;

    let handler = MeltHandler::new(db_dyn.clone(), gateway.clone(), Arc::new(FakeSigner));
    let service = MeltOperationService::new(db_dyn, handler);

    TestWallet {
        db,
        mint,
        gateway,
        service,
    }
}

/// Seed ready proofs with the given denominations
pub async fn seed_proofs(db: &Arc<dyn WalletDatabase>, denominations: &[u64]) {
    for (index, amount) in denominations.iter().enumerate() {
        let secret = Secret::new(format!("seed/{index}/{amount}"));
        let proof = Proof::new(
            Amount::from(*amount),
            keyset_id(),
            secret.clone(),
            fake_point(&format!("c/{index}")),
        );
        let info = ProofInfo::new(proof, fake_y(&secret), mint_url(), ProofState::Ready, "sat");
        db.add_proofs(vec![info]).await.unwrap();
    }
}

/// Sum of ready proofs in the store
pub async fn ready_balance(db: &Arc<WalletMemoryDatabase>) -> u64 {
    let db: Arc<dyn WalletDatabase> = db.clone();
    db.get_proofs(Some(mint_url()), None, Some(vec![ProofState::Ready]))
        .await
        .unwrap()
        .iter()
        .map(|info| u64::from(info.proof.amount))
        .sum()
}

/// Wait until `probe` returns true or the timeout elapses
pub async fn wait_for<F>(mut probe: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    probe()
}
