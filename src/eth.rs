//! Minimal Ethereum JSON-RPC plumbing for the EveryFirst contract.
//!
//! The contract surface is declared once with `sol!`; calls, return values
//! and the `NoteMinted` log are encoded and decoded from that declaration.

use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent, SolValue};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::RpcError;

sol! {
    interface IEveryFirst {
        function hasRole(bytes32 role, address account) external view returns (bool);
        function mintWithURI(address to, string tokenURI, bytes32 digest, uint256 date) external;
        function getMetadataDigest(uint256 tokenId) external view returns (bytes32);

        event NoteMinted(uint256 indexed tokenId, address indexed owner, bytes32 digest, uint256 date);
    }
}

pub use IEveryFirst::NoteMinted as NoteMintedLog;

/// Role a sender needs before `mintWithURI` succeeds.
pub fn minter_role() -> B256 {
    keccak256("MINTER_ROLE")
}

/// Hex form of the `NoteMinted` topic, as it appears in receipt logs.
pub fn note_minted_topic() -> String {
    to_hex(NoteMintedLog::SIGNATURE_HASH.as_slice())
}


#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("rpc #{} {}", id, method);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?;

        match (response.result, response.error) {
            (_, Some(err)) => Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits = strip_0x(s);
    let decoded = if digits.len() % 2 == 1 {
        hex::decode(format!("0{}", digits))
    } else {
        hex::decode(digits)
    };
    decoded.map_err(|e| format!("invalid hex '{}': {}", s, e))
}

pub fn parse_address(s: &str) -> Result<Address, String> {
    let bytes = decode_hex(s)?;
    <[u8; 20]>::try_from(bytes.as_slice())
        .map(Address::from)
        .map_err(|_| format!("'{}' is not a 20-byte address", s))
}

pub fn parse_bytes32(s: &str) -> Result<B256, String> {
    let bytes = decode_hex(s)?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map(B256::from)
        .map_err(|_| format!("'{}' is not 32 bytes", s))
}

/// Parses a `0x`-prefixed quantity such as a gas amount or block number.
pub fn parse_quantity(value: &Value) -> Result<u64, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Malformed(format!("expected hex quantity, got {}", value)))?;
    u64::from_str_radix(strip_0x(s), 16)
        .map_err(|e| RpcError::Malformed(format!("bad quantity '{}': {}", s, e)))
}

fn hex_data(value: &Value) -> Result<Vec<u8>, RpcError> {
    value
        .as_str()
        .ok_or_else(|| RpcError::Malformed(format!("expected hex data, got {}", value)))
        .and_then(|s| decode_hex(s).map_err(RpcError::Malformed))
}

pub fn encode_has_role(role: B256, account: Address) -> Vec<u8> {
    IEveryFirst::hasRoleCall { role, account }.abi_encode()
}

pub fn encode_get_metadata_digest(token_id: u64) -> Vec<u8> {
    IEveryFirst::getMetadataDigestCall {
        tokenId: U256::from(token_id),
    }
    .abi_encode()
}

pub fn encode_mint_with_uri(to: Address, token_uri: &str, digest: B256, date: u64) -> Vec<u8> {
    IEveryFirst::mintWithURICall {
        to,
        tokenURI: token_uri.to_string(),
        digest,
        date: U256::from(date),
    }
    .abi_encode()
}

pub fn decode_has_role(result: &Value) -> Result<bool, RpcError> {
    let data = hex_data(result)?;
    IEveryFirst::hasRoleCall::abi_decode_returns(&data, true)
        .map(|ret| ret._0)
        .map_err(|e| RpcError::Malformed(format!("hasRole result: {}", e)))
}

pub fn decode_metadata_digest(result: &Value) -> Result<B256, RpcError> {
    let data = hex_data(result)?;
    IEveryFirst::getMetadataDigestCall::abi_decode_returns(&data, true)
        .map(|ret| ret._0)
        .map_err(|e| RpcError::Malformed(format!("getMetadataDigest result: {}", e)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedNoteMinted {
    pub token_id: u64,
    pub owner: String,
    pub digest: String,
    pub date: u64,
}

impl DecodedNoteMinted {
    fn from_fields(token_id: U256, owner: Address, digest: B256, date: U256) -> Option<Self> {
        Some(Self {
            token_id: u64::try_from(token_id).ok()?,
            owner: to_hex(owner.as_slice()),
            digest: to_hex(digest.as_slice()),
            date: u64::try_from(date).ok()?,
        })
    }
}

/// Decodes a `NoteMinted` log object from a receipt.
///
/// The declared layout indexes `tokenId` and `owner`. Deployments that index
/// a different prefix of the parameters are still read: the indexed topics
/// followed by the data words form the same static tuple in declaration
/// order.
pub fn decode_note_minted(log: &Value) -> Option<DecodedNoteMinted> {
    let topics: Vec<B256> = log
        .get("topics")?
        .as_array()?
        .iter()
        .map(|t| t.as_str().and_then(|t| parse_bytes32(t).ok()))
        .collect::<Option<_>>()?;
    if topics.first()? != &NoteMintedLog::SIGNATURE_HASH {
        return None;
    }
    let data = decode_hex(log.get("data")?.as_str()?).ok()?;

    if let Ok(event) = NoteMintedLog::decode_raw_log(topics.iter().copied(), &data, true) {
        return DecodedNoteMinted::from_fields(event.tokenId, event.owner, event.digest, event.date);
    }

    let mut fields: Vec<u8> = topics[1..].iter().flat_map(|t| t.0).collect();
    fields.extend_from_slice(&data);
    fields.truncate(4 * 32);
    let (token_id, owner, digest, date) =
        <(U256, Address, B256, U256)>::abi_decode(&fields, true).ok()?;
    DecodedNoteMinted::from_fields(token_id, owner, digest, date)
}
