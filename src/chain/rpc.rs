//! Bitcoin Core JSON-RPC client.
//!
//! Only the three calls the pipeline consumes: `getblockcount`,
//! `getblockhash`, and `getblock` at verbosity 2 (full transaction
//! decoding).

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::oracle::filter::{InputSummary, OutputSummary, TxSummary};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("rpc response missing result")]
    MissingResult,
}

impl RpcError {
    /// Transport problems are worth retrying; node-side errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Thin client over the node's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct BitcoinRpc {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl BitcoinRpc {
    pub fn new(url: String, user: Option<String>, password: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build RPC HTTP client")?;
        Ok(Self {
            client,
            url,
            user,
            password,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "chainpulse",
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response: RpcResponse<T> = request.send().await?.json().await?;

        if let Some(error) = response.error {
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
            });
        }
        response.result.ok_or(RpcError::MissingResult)
    }

    pub async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([])).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", json!([height])).await
    }

    /// Fetch a block with full transaction decoding (verbosity 2).
    pub async fn get_block_verbose(&self, hash: &str) -> Result<VerboseBlock, RpcError> {
        self.call("getblock", json!([hash, 2])).await
    }
}

/// Verbose block as returned by `getblock <hash> 2`, trimmed to the fields
/// the pipeline reads.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseBlock {
    pub hash: String,
    pub height: u64,
    pub time: i64,
    pub tx: Vec<VerboseTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTransaction {
    pub txid: String,
    pub vin: Vec<VerboseInput>,
    pub vout: Vec<VerboseOutput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerboseInput {
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txinwitness: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseOutput {
    pub value: f64,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
}

impl VerboseTransaction {
    /// View consumed by the payment filter. Witness sizes come from the hex
    /// strings (two hex characters per byte).
    pub fn to_summary(&self) -> TxSummary {
        TxSummary {
            txid: self.txid.clone(),
            inputs: self
                .vin
                .iter()
                .map(|vin| InputSummary {
                    prev_txid: vin.txid.clone().unwrap_or_default(),
                    coinbase: vin.coinbase.is_some(),
                    witness_lens: vin.txinwitness.iter().map(|item| item.len() / 2).collect(),
                })
                .collect(),
            outputs: self
                .vout
                .iter()
                .map(|vout| OutputSummary {
                    value_btc: vout.value,
                    op_return: vout.script_pub_key.asm.starts_with("OP_RETURN"),
                })
                .collect(),
        }
    }
}
