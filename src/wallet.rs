use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::contract::{select_client, ContractClient, ReceiptPolling};
use crate::errors::WalletError;
use crate::eth::{self, RpcTransport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    #[serde(rename_all = "camelCase")]
    Connected { address: String, chain_id: u64 },
}

/// Notifications pushed by the wallet provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(u64),
}

struct Inner {
    state: ConnectionState,
    client: Option<Arc<dyn ContractClient>>,
}

/// Wallet session owner. Connecting creates the contract client for the
/// connected account; disconnecting drops it.
pub struct WalletConnector {
    transport: Arc<dyn RpcTransport>,
    contract_address: Option<String>,
    polling: ReceiptPolling,
    inner: Mutex<Inner>,
}

impl WalletConnector {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        contract_address: Option<String>,
        polling: ReceiptPolling,
    ) -> Self {
        Self {
            transport,
            contract_address,
            polling,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                client: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // state is replaced wholesale, so a poisoned value is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub fn address(&self) -> Option<String> {
        match &self.lock().state {
            ConnectionState::Connected { address, .. } => Some(address.clone()),
            _ => None,
        }
    }

    /// Contract client of the current session.
    pub fn client(&self) -> Option<Arc<dyn ContractClient>> {
        self.lock().client.clone()
    }

    pub async fn client_or_connect(&self) -> Result<Arc<dyn ContractClient>, WalletError> {
        if let Some(client) = self.client() {
            return Ok(client);
        }
        self.connect().await?;
        self.client().ok_or(WalletError::NotConnected)
    }

    pub async fn connect(&self) -> Result<String, WalletError> {
        self.lock().state = ConnectionState::Connecting;

        match self.open_session().await {
            Ok((address, chain_id, client)) => {
                info!("Wallet connected: {} on chain {}", address, chain_id);
                let mut inner = self.lock();
                inner.state = ConnectionState::Connected {
                    address: address.clone(),
                    chain_id,
                };
                inner.client = Some(client);
                Ok(address)
            }
            Err(e) => {
                warn!("Wallet connection failed: {}", e);
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Asks the wallet to pick again which account it exposes, then moves
    /// the session to that account. Starts a session when none is open. A
    /// refused or failed switch leaves the current session untouched.
    pub async fn switch_account(&self) -> Result<String, WalletError> {
        let chain_id = match self.state() {
            ConnectionState::Connected { chain_id, .. } => chain_id,
            _ => return self.connect().await,
        };

        let address = self.request_account().await.map_err(|e| {
            warn!("Account switch failed: {}", e);
            e
        })?;
        let client = self.client_for(&address)?;

        info!("Wallet switched to {}", address);
        let mut inner = self.lock();
        inner.state = ConnectionState::Connected {
            address: address.clone(),
            chain_id,
        };
        inner.client = Some(client);
        Ok(address)
    }

    /// Permission prompt first so the user can choose among accounts, then
    /// the account list itself.
    async fn request_account(&self) -> Result<String, WalletError> {
        self.transport
            .request("wallet_requestPermissions", json!([{ "eth_accounts": {} }]))
            .await?;
        let accounts = self
            .transport
            .request("eth_requestAccounts", json!([]))
            .await?;
        first_account(&accounts).ok_or(WalletError::NoAccounts)
    }

    async fn open_session(&self) -> Result<(String, u64, Arc<dyn ContractClient>), WalletError> {
        let address = self.request_account().await?;

        let chain = self.transport.request("eth_chainId", json!([])).await?;
        let chain_id = eth::parse_quantity(&chain)?;

        let client = self.client_for(&address)?;
        Ok((address, chain_id, client))
    }

    fn client_for(&self, address: &str) -> Result<Arc<dyn ContractClient>, WalletError> {
        select_client(
            self.contract_address.as_deref(),
            Arc::clone(&self.transport),
            address,
            self.polling,
        )
        .map_err(|e| WalletError::InvalidAccount(e.to_string()))
    }

    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if inner.client.take().is_some() {
            info!("Wallet session closed");
        }
        inner.state = ConnectionState::Disconnected;
    }

    /// Account changes switch the session to the new account (or end it when
    /// none is left); a network change ends the session.
    pub fn handle_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::AccountsChanged(accounts) => {
                let chain_id = match self.state() {
                    ConnectionState::Connected { chain_id, .. } => chain_id,
                    _ => return,
                };

                let Some(address) = accounts.into_iter().next() else {
                    self.disconnect();
                    return;
                };

                match self.client_for(&address) {
                    Ok(client) => {
                        info!("Wallet account changed to {}", address);
                        let mut inner = self.lock();
                        inner.state = ConnectionState::Connected { address, chain_id };
                        inner.client = Some(client);
                    }
                    Err(e) => {
                        warn!("Ignoring account change: {}", e);
                        self.disconnect();
                    }
                }
            }
            WalletEvent::ChainChanged(chain_id) => {
                info!("Network changed to chain {}, resetting wallet session", chain_id);
                self.disconnect();
            }
        }
    }
}

fn first_account(accounts: &Value) -> Option<String> {
    accounts
        .as_array()?
        .first()?
        .as_str()
        .map(|a| a.to_lowercase())
}
