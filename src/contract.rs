//! Minting through the EveryFirst ERC-721 contract.
//!
//! [`ContractClient`] has two implementations, picked once by
//! [`select_client`]: [`SimulatedClient`] when no contract address is
//! configured, and [`OnChainClient`] which talks JSON-RPC to a node whose
//! account signs the transactions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::errors::{ContractError, RpcError};
use crate::eth::{self, RpcTransport};

/// Delay before a simulated mint reports its `NoteMinted` event.
pub const SIMULATED_EVENT_DELAY: Duration = Duration::from_millis(500);
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Payload of the contract's `NoteMinted(tokenId, owner, digest, date)` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMinted {
    pub token_id: u64,
    pub owner: String,
    pub digest: String,
    pub date: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintReceipt {
    pub status: u8,
    pub transaction_hash: String,
    pub token_id: Option<u64>,
}

/// A submitted mint. `wait` resolves once the transaction is final.
pub struct PendingMint {
    pub hash: String,
    receipt: BoxFuture<'static, Result<MintReceipt, ContractError>>,
}

impl PendingMint {
    pub async fn wait(self) -> Result<MintReceipt, ContractError> {
        self.receipt.await
    }
}

impl fmt::Debug for PendingMint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMint").field("hash", &self.hash).finish()
    }
}

#[async_trait]
pub trait ContractClient: Send + Sync {
    fn is_simulated(&self) -> bool;

    async fn estimate_gas_mint(
        &self,
        to: &str,
        token_uri: &str,
        digest: &str,
        date: u64,
    ) -> Result<u64, ContractError>;

    async fn mint_with_uri(
        &self,
        to: &str,
        token_uri: &str,
        digest: &str,
        date: u64,
    ) -> Result<PendingMint, ContractError>;

    async fn metadata_digest(&self, token_id: u64) -> Result<String, ContractError>;

    /// Receives every `NoteMinted` event this client observes from now on.
    fn subscribe(&self) -> broadcast::Receiver<NoteMinted>;
}

fn require_token_uri(token_uri: &str) -> Result<(), ContractError> {
    if token_uri.is_empty() {
        Err(ContractError::InvalidArgument("tokenURI is missing".to_string()))
    } else {
        Ok(())
    }
}

/// Stand-in used when no contract is deployed. Always reports token id 1.
pub struct SimulatedClient {
    events: broadcast::Sender<NoteMinted>,
    event_delay: Duration,
    nonce: AtomicU64,
    digests: Mutex<HashMap<u64, String>>,
}

impl SimulatedClient {
    pub const TOKEN_ID: u64 = 1;

    pub fn new() -> Self {
        Self::with_event_delay(SIMULATED_EVENT_DELAY)
    }

    pub fn with_event_delay(event_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            event_delay,
            nonce: AtomicU64::new(0),
            digests: Mutex::new(HashMap::new()),
        }
    }

    fn mock_hash(&self, to: &str, token_uri: &str, digest: &str, date: u64) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let input = format!("{}|{}|{}|{}|{}", to, token_uri, digest, date, nonce);
        format!("0x{}", hex::encode(Sha256::digest(input.as_bytes())))
    }
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContractClient for SimulatedClient {
    fn is_simulated(&self) -> bool {
        true
    }

    async fn estimate_gas_mint(
        &self,
        _to: &str,
        _token_uri: &str,
        _digest: &str,
        _date: u64,
    ) -> Result<u64, ContractError> {
        Err(ContractError::GasEstimateUnavailable)
    }

    async fn mint_with_uri(
        &self,
        to: &str,
        token_uri: &str,
        digest: &str,
        date: u64,
    ) -> Result<PendingMint, ContractError> {
        require_token_uri(token_uri)?;

        let hash = self.mock_hash(to, token_uri, digest, date);
        info!("Simulated mint of {} to {} as {}", token_uri, to, hash);

        if let Ok(mut digests) = self.digests.lock() {
            digests.insert(Self::TOKEN_ID, digest.to_string());
        }

        let event = NoteMinted {
            token_id: Self::TOKEN_ID,
            owner: to.to_string(),
            digest: digest.to_string(),
            date,
        };
        let events = self.events.clone();
        let delay = self.event_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.send(event).is_err() {
                debug!("Simulated NoteMinted had no listeners");
            }
        });

        let receipt = MintReceipt {
            status: 1,
            transaction_hash: hash.clone(),
            token_id: Some(Self::TOKEN_ID),
        };

        Ok(PendingMint {
            hash,
            receipt: async move { Ok(receipt) }.boxed(),
        })
    }

    async fn metadata_digest(&self, token_id: u64) -> Result<String, ContractError> {
        self.digests
            .lock()
            .ok()
            .and_then(|d| d.get(&token_id).cloned())
            .ok_or_else(|| ContractError::InvalidArgument(format!("unknown token {}", token_id)))
    }

    fn subscribe(&self) -> broadcast::Receiver<NoteMinted> {
        self.events.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiptPolling {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(180),
        }
    }
}

/// Client for a deployed contract. Transactions are sent from `from` and
/// signed by the node or wallet behind the transport.
pub struct OnChainClient {
    transport: Arc<dyn RpcTransport>,
    contract: String,
    from: String,
    events: broadcast::Sender<NoteMinted>,
    polling: ReceiptPolling,
}

impl OnChainClient {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        contract: &str,
        from: &str,
        polling: ReceiptPolling,
    ) -> Result<Self, ContractError> {
        eth::parse_address(contract).map_err(ContractError::InvalidArgument)?;
        eth::parse_address(from).map_err(ContractError::InvalidArgument)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            transport,
            contract: contract.to_lowercase(),
            from: from.to_lowercase(),
            events,
            polling,
        })
    }

    pub fn from_address(&self) -> &str {
        &self.from
    }

    async fn call(&self, data: Vec<u8>) -> Result<Value, RpcError> {
        self.transport
            .request(
                "eth_call",
                json!([{ "to": self.contract, "data": eth::to_hex(&data) }, "latest"]),
            )
            .await
    }

    pub async fn has_minter_role(&self, account: &str) -> Result<bool, ContractError> {
        let account = eth::parse_address(account).map_err(ContractError::InvalidArgument)?;
        let result = self.call(eth::encode_has_role(eth::minter_role(), account)).await?;
        Ok(eth::decode_has_role(&result)?)
    }

    fn mint_call_data(
        &self,
        to: &str,
        token_uri: &str,
        digest: &str,
        date: u64,
    ) -> Result<Vec<u8>, ContractError> {
        require_token_uri(token_uri)?;
        let to = eth::parse_address(to).map_err(ContractError::InvalidArgument)?;
        let digest = eth::parse_bytes32(digest).map_err(ContractError::InvalidArgument)?;
        Ok(eth::encode_mint_with_uri(to, token_uri, digest, date))
    }
}

#[async_trait]
impl ContractClient for OnChainClient {
    fn is_simulated(&self) -> bool {
        false
    }

    async fn estimate_gas_mint(
        &self,
        to: &str,
        token_uri: &str,
        digest: &str,
        date: u64,
    ) -> Result<u64, ContractError> {
        let data = self.mint_call_data(to, token_uri, digest, date)?;
        let gas = self
            .transport
            .request(
                "eth_estimateGas",
                json!([{ "from": self.from, "to": self.contract, "data": eth::to_hex(&data) }]),
            )
            .await?;
        Ok(eth::parse_quantity(&gas)?)
    }

    async fn mint_with_uri(
        &self,
        to: &str,
        token_uri: &str,
        digest: &str,
        date: u64,
    ) -> Result<PendingMint, ContractError> {
        let data = self.mint_call_data(to, token_uri, digest, date)?;

        if !self.has_minter_role(&self.from).await? {
            return Err(ContractError::MissingMinterRole(self.from.clone()));
        }

        info!("Minting {} to {} from {}", token_uri, to, self.from);
        let sent = self
            .transport
            .request(
                "eth_sendTransaction",
                json!([{
                    "from": self.from,
                    "to": self.contract,
                    "data": eth::to_hex(&data),
                    "value": "0x0",
                }]),
            )
            .await?;

        let hash = sent
            .as_str()
            .ok_or_else(|| RpcError::Malformed(format!("expected transaction hash, got {}", sent)))?
            .to_string();
        info!("Mint transaction sent: {}", hash);

        let receipt = wait_for_receipt(
            Arc::clone(&self.transport),
            hash.clone(),
            self.events.clone(),
            self.polling,
        )
        .boxed();

        Ok(PendingMint { hash, receipt })
    }

    async fn metadata_digest(&self, token_id: u64) -> Result<String, ContractError> {
        let result = self.call(eth::encode_get_metadata_digest(token_id)).await?;
        let digest = eth::decode_metadata_digest(&result)?;
        Ok(eth::to_hex(digest.as_slice()))
    }

    fn subscribe(&self) -> broadcast::Receiver<NoteMinted> {
        self.events.subscribe()
    }
}

async fn wait_for_receipt(
    transport: Arc<dyn RpcTransport>,
    hash: String,
    events: broadcast::Sender<NoteMinted>,
    polling: ReceiptPolling,
) -> Result<MintReceipt, ContractError> {
    let started = Instant::now();

    loop {
        let receipt = transport
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;

        if !receipt.is_null() {
            let status = receipt
                .get("status")
                .map(eth::parse_quantity)
                .transpose()?
                .unwrap_or(0);
            if status != 1 {
                warn!("Mint transaction {} reverted", hash);
                return Err(ContractError::Reverted(hash));
            }

            let minted: Vec<NoteMinted> = receipt
                .get("logs")
                .and_then(Value::as_array)
                .map(|logs| {
                    logs.iter()
                        .filter_map(eth::decode_note_minted)
                        .map(|e| NoteMinted {
                            token_id: e.token_id,
                            owner: e.owner,
                            digest: e.digest,
                            date: e.date,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let token_id = minted.first().map(|e| e.token_id);
            for event in minted {
                info!("NoteMinted token {} for {}", event.token_id, event.owner);
                if events.send(event).is_err() {
                    debug!("NoteMinted had no listeners");
                }
            }

            return Ok(MintReceipt {
                status: 1,
                transaction_hash: hash,
                token_id,
            });
        }

        if started.elapsed() >= polling.timeout {
            return Err(ContractError::ReceiptTimeout(hash));
        }
        tokio::time::sleep(polling.interval).await;
    }
}

/// Picks the client variant: simulated without a contract address, on-chain otherwise.
pub fn select_client(
    contract_address: Option<&str>,
    transport: Arc<dyn RpcTransport>,
    from: &str,
    polling: ReceiptPolling,
) -> Result<Arc<dyn ContractClient>, ContractError> {
    match contract_address.filter(|a| !a.is_empty()) {
        Some(address) => Ok(Arc::new(OnChainClient::new(transport, address, from, polling)?)),
        None => {
            info!("No contract address configured, minting is simulated");
            Ok(Arc::new(SimulatedClient::new()))
        }
    }
}
