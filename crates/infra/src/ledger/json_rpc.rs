//! EVM JSON-RPC ledger client.
//!
//! Reads a token contract with `eth_call` against the `latest` block:
//! the mint counter through a configurable zero-argument selector and
//! attribution through `ownerOf(uint256)`. Owner lookups are sent as JSON-RPC
//! batches of at most [`MAX_BATCH_CALLS`] calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use mintforge_core::{OwnerRef, TokenId};

use super::{Ledger, LedgerError, OwnerLookup};

/// `ownerOf(uint256)`.
pub const OWNER_OF_SELECTOR: &str = "6352211e";
/// `nextTokenId()`.
pub const NEXT_TOKEN_ID_SELECTOR: &str = "75794a3c";

pub const MAX_BATCH_CALLS: usize = 100;

#[derive(Debug, Clone)]
pub struct JsonRpcLedgerConfig {
    pub rpc_url: String,
    /// Contract address, `0x` + 40 hex digits.
    pub contract_address: String,
    /// Four-byte selector of the counter function, hex with or without `0x`.
    pub count_selector: String,
    pub timeout: Duration,
    pub max_batch: usize,
}

impl JsonRpcLedgerConfig {
    pub fn new(rpc_url: impl Into<String>, contract_address: impl Into<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract_address: contract_address.into(),
            count_selector: NEXT_TOKEN_ID_SELECTOR.to_string(),
            timeout: Duration::from_secs(30),
            max_batch: MAX_BATCH_CALLS,
        }
    }

    pub fn with_count_selector(mut self, selector: impl Into<String>) -> Self {
        self.count_selector = selector.into();
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.clamp(1, MAX_BATCH_CALLS);
        self
    }
}

/// Ledger backed by an EVM JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct JsonRpcLedger {
    client: reqwest::Client,
    rpc_url: String,
    contract: String,
    count_selector: String,
    max_batch: usize,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Value,
    result: Option<String>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl JsonRpcLedger {
    pub fn new(config: JsonRpcLedgerConfig) -> Result<Self, LedgerError> {
        let contract = OwnerRef::parse(&config.contract_address)
            .map_err(|e| LedgerError::Rejected(format!("contract address: {e}")))?;
        let count_selector = normalize_selector(&config.count_selector)?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LedgerError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            rpc_url: config.rpc_url,
            contract: contract.to_string(),
            count_selector,
            max_batch: config.max_batch.clamp(1, MAX_BATCH_CALLS),
        })
    }

    fn call_object(&self, id: u64, data: String) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_call",
            "params": [{"to": self.contract, "data": data}, "latest"],
        })
    }

    async fn post(&self, body: &Value) -> Result<Value, LedgerError> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(body)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::Transport(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(LedgerError::Rejected(format!("HTTP {}", status.as_u16())));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }

    async fn eth_call(&self, data: String) -> Result<String, LedgerError> {
        let body = self.call_object(1, data);
        let value = self.post(&body).await?;
        let response: RpcResponse =
            serde_json::from_value(value).map_err(|e| LedgerError::Decode(e.to_string()))?;
        into_result(response)
    }

    async fn owners_batch(&self, ids: &[TokenId]) -> Result<Vec<OwnerLookup>, LedgerError> {
        let calls: Vec<Value> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| self.call_object(i as u64, owner_of_calldata(*id)))
            .collect();

        let value = self.post(&Value::Array(calls)).await?;

        // A batch-level failure comes back as a single error object.
        let responses: Vec<RpcResponse> = match value {
            Value::Array(items) => items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<_, _>>()
                .map_err(|e| LedgerError::Decode(e.to_string()))?,
            other => {
                let single: RpcResponse =
                    serde_json::from_value(other).map_err(|e| LedgerError::Decode(e.to_string()))?;
                return Err(match into_result(single) {
                    Err(e) => e,
                    Ok(_) => LedgerError::Decode("expected a batch response".to_string()),
                });
            }
        };

        let mut by_index: HashMap<u64, RpcResponse> = responses
            .into_iter()
            .filter_map(|r| r.id.as_u64().map(|i| (i, r)))
            .collect();

        let mut lookups = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            let result = match by_index.remove(&(i as u64)) {
                Some(response) => into_result(response).and_then(|word| decode_owner(&word)),
                None => Err(LedgerError::Decode(format!("no batch response for {id}"))),
            };
            if let Err(e) = &result {
                if e.is_retryable() {
                    return Err(e.clone());
                }
            }
            lookups.push((*id, result));
        }
        Ok(lookups)
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    #[instrument(skip(self), err)]
    async fn current_count(&self) -> Result<u64, LedgerError> {
        let word = self.eth_call(format!("0x{}", self.count_selector)).await?;
        let count = decode_uint(&word)?;
        debug!(count, "ledger counter read");
        Ok(count)
    }

    #[instrument(skip(self), fields(token_id = %id), err)]
    async fn owner_of(&self, id: TokenId) -> Result<OwnerRef, LedgerError> {
        let word = self.eth_call(owner_of_calldata(id)).await?;
        decode_owner(&word)
    }

    #[instrument(skip(self, ids), fields(ids = ids.len()), err)]
    async fn owners_of(&self, ids: &[TokenId]) -> Result<Vec<OwnerLookup>, LedgerError> {
        let mut lookups = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_batch) {
            lookups.extend(self.owners_batch(chunk).await?);
        }
        Ok(lookups)
    }
}

fn normalize_selector(raw: &str) -> Result<String, LedgerError> {
    let hex = raw.trim().trim_start_matches("0x");
    if hex.len() != 8 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LedgerError::Rejected(format!(
            "selector must be 4 bytes of hex: {raw}"
        )));
    }
    Ok(hex.to_ascii_lowercase())
}

fn owner_of_calldata(id: TokenId) -> String {
    format!("0x{OWNER_OF_SELECTOR}{:064x}", id.get())
}

fn into_result(response: RpcResponse) -> Result<String, LedgerError> {
    if let Some(err) = response.error {
        let lowered = err.message.to_ascii_lowercase();
        return Err(if err.code == 3 || lowered.contains("revert") {
            LedgerError::Reverted(err.message)
        } else if (-32700..=-32600).contains(&err.code) {
            LedgerError::Rejected(format!("{} ({})", err.message, err.code))
        } else {
            LedgerError::Transport(format!("{} ({})", err.message, err.code))
        });
    }
    response
        .result
        .ok_or_else(|| LedgerError::Decode("response has neither result nor error".to_string()))
}

/// First 32-byte word of an ABI return value, as 64 hex digits.
fn first_word(data: &str) -> Result<&str, LedgerError> {
    let hex = data.strip_prefix("0x").unwrap_or(data);
    if hex.is_empty() {
        return Err(LedgerError::Reverted("empty return data".to_string()));
    }
    let word = hex
        .get(..64)
        .ok_or_else(|| LedgerError::Decode(format!("short return data: {data}")))?;
    if !word.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LedgerError::Decode(format!("non-hex return data: {data}")));
    }
    Ok(word)
}

fn decode_uint(data: &str) -> Result<u64, LedgerError> {
    let word = first_word(data)?;
    let (high, low) = word.split_at(48);
    if high.chars().any(|c| c != '0') {
        return Err(LedgerError::Decode(format!("value exceeds u64: 0x{word}")));
    }
    u64::from_str_radix(low, 16).map_err(|e| LedgerError::Decode(e.to_string()))
}

fn decode_owner(data: &str) -> Result<OwnerRef, LedgerError> {
    let word = first_word(data)?;
    let (padding, address) = word.split_at(24);
    if padding.chars().any(|c| c != '0') {
        return Err(LedgerError::Decode(format!("not an address word: 0x{word}")));
    }
    if address.chars().all(|c| c == '0') {
        return Err(LedgerError::Reverted("owner is the zero address".to_string()));
    }
    OwnerRef::parse(&format!("0x{address}")).map_err(|e| LedgerError::Decode(e.to_string()))
}
