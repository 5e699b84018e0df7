use crate::types::Pubkey;
use alloy_primitives::Bytes;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::debug;

/// Upper bound on addresses per `getMultipleAccounts` call accepted by RPC nodes.
pub const GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE: usize = 99;

#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, Hash, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

/// Raw account bytes together with the slot they were read at.
/// `buffer` is `None` when the account does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferAndSlot {
    pub slot: u64,
    pub buffer: Option<Bytes>,
}

/// Answer of one batched read. `values` is positional to the requested keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipleAccounts {
    pub slot: u64,
    pub values: Vec<Option<Bytes>>,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rpc node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
    #[error("expected {expected} accounts in response, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Reads raw account data from the remote ledger.
#[async_trait]
pub trait AccountReader: Send + Sync {
    /// Read every key at a single slot. Must not be called with more than
    /// [`AccountReader::max_accounts_per_request`] keys.
    async fn get_multiple_accounts(&self, keys: &[Pubkey], commitment: Commitment) -> Result<MultipleAccounts, RpcError>;

    async fn get_account(&self, key: &Pubkey, commitment: Commitment) -> Result<BufferAndSlot, RpcError> {
        let response = self.get_multiple_accounts(std::slice::from_ref(key), commitment).await?;
        let buffer = response.values.into_iter().next().flatten();
        Ok(BufferAndSlot { slot: response.slot, buffer })
    }

    fn max_accounts_per_request(&self) -> usize {
        GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE
    }
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
pub(crate) struct RpcContext {
    pub slot: u64,
}

#[derive(Deserialize)]
pub(crate) struct WithContext<T> {
    pub context: RpcContext,
    pub value: T,
}

#[derive(Deserialize)]
pub(crate) struct UiAccount {
    /// `[payload, encoding]`
    pub data: (String, String),
}

impl UiAccount {
    pub(crate) fn decode_data(&self) -> Result<Bytes, RpcError> {
        let (payload, encoding) = &self.data;
        if encoding != "base64" {
            return Err(RpcError::InvalidResponse(format!("unsupported account encoding {encoding}")));
        }
        BASE64
            .decode(payload)
            .map(Bytes::from)
            .map_err(|e| RpcError::InvalidResponse(format!("invalid base64 account data: {e}")))
    }
}

/// [`AccountReader`] backed by the JSON-RPC HTTP endpoint of a node.
#[derive(Debug, Clone)]
pub struct RpcAccountReader {
    http_client: reqwest::Client,
    rpc_url: String,
    max_accounts_per_request: usize,
}

impl RpcAccountReader {
    pub fn new(rpc_url: String, timeout: Duration) -> Result<Self, RpcError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client, rpc_url, max_accounts_per_request: GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE })
    }

    pub fn with_max_accounts_per_request(mut self, max_accounts_per_request: usize) -> Self {
        self.max_accounts_per_request = max_accounts_per_request.max(1);
        self
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, RpcError> {
        let request_body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http_client
            .post(&self.rpc_url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?
            .error_for_status()?;

        let response: RpcResponse<T> = response.json().await?;
        if let Some(error) = response.error {
            return Err(RpcError::Node { code: error.code, message: error.message });
        }
        response.result.ok_or_else(|| RpcError::InvalidResponse(format!("missing result for {method}")))
    }
}

#[async_trait]
impl AccountReader for RpcAccountReader {
    async fn get_multiple_accounts(&self, keys: &[Pubkey], commitment: Commitment) -> Result<MultipleAccounts, RpcError> {
        if keys.is_empty() {
            return Err(RpcError::InvalidResponse("getMultipleAccounts called without keys".to_string()));
        }

        let params = serde_json::json!([
            keys.iter().map(Pubkey::to_base58).collect::<Vec<_>>(),
            { "commitment": commitment, "encoding": "base64" },
        ]);
        let response: WithContext<Vec<Option<UiAccount>>> = self.request("getMultipleAccounts", params).await?;

        if response.value.len() != keys.len() {
            return Err(RpcError::LengthMismatch { expected: keys.len(), actual: response.value.len() });
        }

        let values = response
            .value
            .iter()
            .map(|account| account.as_ref().map(UiAccount::decode_data).transpose())
            .collect::<Result<Vec<_>, _>>()?;

        debug!("getMultipleAccounts: {} accounts at slot {}", keys.len(), response.context.slot);
        Ok(MultipleAccounts { slot: response.context.slot, values })
    }

    async fn get_account(&self, key: &Pubkey, commitment: Commitment) -> Result<BufferAndSlot, RpcError> {
        let params = serde_json::json!([key.to_base58(), { "commitment": commitment, "encoding": "base64" }]);
        let response: WithContext<Option<UiAccount>> = self.request("getAccountInfo", params).await?;
        let buffer = response.value.as_ref().map(UiAccount::decode_data).transpose()?;
        Ok(BufferAndSlot { slot: response.context.slot, buffer })
    }

    fn max_accounts_per_request(&self) -> usize {
        self.max_accounts_per_request
    }
}
