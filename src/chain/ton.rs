//! TON destination over the toncenter HTTP API
//!
//! Reads go through the v2 `runGetMethod` endpoint, broadcasts through
//! `sendBocReturnHash`. When an index (v3) URL is configured, confirmations
//! also look the external message up by hash.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::codec::{message_body, EncodeRequest, TonCodec};
use super::{BridgeConfig, BroadcastReceipt, Destination, RelayMessage};
use crate::error::RelayError;

/// Connection and wallet settings for [`TonCenterClient`]
#[derive(Clone)]
pub struct TonCenterConfig {
    /// toncenter v2 base URL, e.g. `https://toncenter.com/api/v2`
    pub api_url: String,
    pub api_key: Option<String>,
    /// toncenter v3 base URL, enables hash-based confirmation
    pub index_url: Option<String>,
    pub wallet: String,
    pub bridge: String,
    pub light_client_master: String,
    pub recv_packet_value_nano: u64,
    pub update_client_value_nano: u64,
}

impl std::fmt::Debug for TonCenterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TonCenterConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("index_url", &self.index_url)
            .field("wallet", &self.wallet)
            .field("bridge", &self.bridge)
            .field("light_client_master", &self.light_client_master)
            .field("recv_packet_value_nano", &self.recv_packet_value_nano)
            .field("update_client_value_nano", &self.update_client_value_nano)
            .finish()
    }
}

/// toncenter v2 envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    fn into_result(self, what: &str) -> Result<T, RelayError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => {
                let message = format!(
                    "{} failed ({}): {}",
                    what,
                    self.code.unwrap_or_default(),
                    self.error.unwrap_or_else(|| "no result".to_string())
                );
                match self.code {
                    Some(code) if code >= 500 => Err(RelayError::Transport(message)),
                    _ => Err(RelayError::from_rpc_message(message)),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetMethodResult {
    exit_code: i32,
    #[serde(default)]
    stack: Vec<Value>,
}

impl GetMethodResult {
    /// A non-zero exit is the contract's answer, not a transport hiccup
    fn into_stack(self, address: &str, method: &str) -> Result<Vec<Value>, RelayError> {
        if self.exit_code != 0 {
            return Err(RelayError::Submission(format!(
                "get method {} on {} returned exit {}",
                method, address, self.exit_code
            )));
        }
        Ok(self.stack)
    }
}

#[derive(Debug, Deserialize)]
struct IndexTransactions {
    #[serde(default)]
    transactions: Vec<IndexTransaction>,
}

#[derive(Debug, Deserialize)]
struct IndexTransaction {
    hash: String,
    description: TxDescription,
}

#[derive(Debug, Deserialize)]
struct TxDescription {
    #[serde(default)]
    aborted: bool,
    compute_ph: Option<ComputePhase>,
}

#[derive(Debug, Deserialize)]
struct ComputePhase {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    exit_code: Option<i32>,
}

impl IndexTransaction {
    fn succeeded(&self) -> bool {
        !self.description.aborted
            && self
                .description
                .compute_ph
                .as_ref()
                .and_then(|c| c.success)
                .unwrap_or(true)
    }
}

/// Read a `["num", "0x..."]` stack entry
fn parse_stack_num(entry: &Value) -> Result<u64, RelayError> {
    let raw = entry
        .get(1)
        .and_then(Value::as_str)
        .filter(|_| entry.get(0).and_then(Value::as_str) == Some("num"))
        .ok_or_else(|| RelayError::Transport(format!("unexpected stack entry {}", entry)))?;

    let parsed = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| RelayError::Transport(format!("bad stack number {}: {}", raw, e)))
}

/// Read the BOC of a `["cell", {"bytes": ...}]` stack entry
fn parse_stack_cell(entry: &Value) -> Result<String, RelayError> {
    entry
        .get(1)
        .and_then(|c| c.get("bytes"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelayError::Transport(format!("unexpected stack entry {}", entry)))
}

/// [`Destination`] for the TON bridge adapter
pub struct TonCenterClient {
    http: reqwest::Client,
    config: TonCenterConfig,
    codec: Arc<dyn TonCodec>,
}

impl TonCenterClient {
    pub fn new(config: TonCenterConfig, codec: Arc<dyn TonCodec>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            codec,
        }
    }

    fn with_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    async fn post<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<ApiResponse<T>, RelayError> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), method);
        let response = self.with_key(self.http.post(url)).json(&body).send().await?;
        Ok(response.json().await?)
    }

    async fn run_get_method(&self, address: &str, method: &str) -> Result<Vec<Value>, RelayError> {
        let result: GetMethodResult = self
            .post(
                "runGetMethod",
                json!({ "address": address, "method": method, "stack": [] }),
            )
            .await?
            .into_result(method)?;

        result.into_stack(address, method)
    }

    fn target_of(&self, message: &RelayMessage) -> (&str, u64) {
        match message {
            RelayMessage::UpdateClient(_) => (
                self.config.light_client_master.as_str(),
                self.config.update_client_value_nano,
            ),
            RelayMessage::RecvPacket { .. } => {
                (self.config.bridge.as_str(), self.config.recv_packet_value_nano)
            }
        }
    }
}

#[async_trait]
impl Destination for TonCenterClient {
    fn account(&self) -> &str {
        &self.config.wallet
    }

    async fn bridge_config(&self) -> Result<BridgeConfig, RelayError> {
        let stack = self
            .run_get_method(&self.config.bridge, "get_bridge_data")
            .await?;
        // Light client master is the last entry
        let cell = stack
            .last()
            .ok_or_else(|| RelayError::Transport("empty get_bridge_data stack".to_string()))?;
        let light_client = self.codec.parse_address(&parse_stack_cell(cell)?).await?;

        Ok(BridgeConfig {
            light_client,
            bridge_wasm: None,
        })
    }

    async fn trusted_height(&self) -> Result<u64, RelayError> {
        let stack = self
            .run_get_method(&self.config.light_client_master, "get_trusted_height")
            .await?;
        let first = stack
            .first()
            .ok_or_else(|| RelayError::Transport("empty get_trusted_height stack".to_string()))?;
        parse_stack_num(first)
    }

    async fn sequence(&self) -> Result<u64, RelayError> {
        let stack = self.run_get_method(&self.config.wallet, "seqno").await?;
        let first = stack
            .first()
            .ok_or_else(|| RelayError::Transport("empty seqno stack".to_string()))?;
        parse_stack_num(first)
    }

    async fn submit(
        &self,
        sequence: u64,
        message: &RelayMessage,
    ) -> Result<BroadcastReceipt, RelayError> {
        let (to, value_nano) = self.target_of(message);
        let encoded = self
            .codec
            .encode_external(&EncodeRequest {
                wallet: self.config.wallet.clone(),
                seqno: sequence,
                to: to.to_string(),
                value_nano,
                body: message_body(message)?,
            })
            .await?;

        let sent: Value = self
            .post("sendBocReturnHash", json!({ "boc": encoded.boc }))
            .await?
            .into_result("sendBocReturnHash")
            .map_err(|e| match e {
                RelayError::Transport(_) => e,
                other => RelayError::Submission(other.to_string()),
            })?;

        info!(
            message = message.label(),
            seqno = sequence,
            to,
            value_nano,
            message_hash = %encoded.message_hash,
            "Broadcast external message"
        );
        debug!(response = %sent, "sendBocReturnHash response");

        Ok(BroadcastReceipt {
            message_hash: encoded.message_hash,
            sequence,
        })
    }

    async fn transaction_landed(
        &self,
        receipt: &BroadcastReceipt,
    ) -> Result<Option<bool>, RelayError> {
        let Some(index_url) = &self.config.index_url else {
            return Ok(None);
        };

        let url = format!(
            "{}/transactionsByMessage",
            index_url.trim_end_matches('/')
        );
        let found: IndexTransactions = self
            .with_key(self.http.get(url))
            .query(&[("msg_hash", receipt.message_hash.as_str()), ("direction", "in")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match found.transactions.first() {
            None => Ok(Some(false)),
            Some(tx) if tx.succeeded() => Ok(Some(true)),
            Some(tx) => Err(RelayError::Submission(format!(
                "transaction {} failed with exit code {}",
                tx.hash,
                tx.description
                    .compute_ph
                    .as_ref()
                    .and_then(|c| c.exit_code)
                    .unwrap_or_default()
            ))),
        }
    }

    async fn balance(&self, address: &str) -> Result<u128, RelayError> {
        let url = format!(
            "{}/getAddressBalance",
            self.config.api_url.trim_end_matches('/')
        );
        let response: ApiResponse<String> = self
            .with_key(self.http.get(url))
            .query(&[("address", address)])
            .send()
            .await?
            .json()
            .await?;
        let raw = response.into_result("getAddressBalance")?;
        raw.parse()
            .map_err(|e| RelayError::Transport(format!("bad balance {}: {}", raw, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stack_num() {
        assert_eq!(parse_stack_num(&json!(["num", "0x1f4"])).unwrap(), 500);
        assert_eq!(parse_stack_num(&json!(["num", "42"])).unwrap(), 42);
        assert!(parse_stack_num(&json!(["cell", {"bytes": "te6c"}])).is_err());
        assert!(parse_stack_num(&json!(["num", "0xzz"])).is_err());
    }

    #[test]
    fn test_get_method_exit_is_not_retried() {
        let failed: GetMethodResult =
            serde_json::from_str(r#"{"exit_code":11,"stack":[]}"#).unwrap();
        let err = failed.into_stack("EQ-bridge", "get_bridge_data").unwrap_err();
        assert!(matches!(err, RelayError::Submission(_)));
        assert!(!err.is_retryable());

        let ok: GetMethodResult =
            serde_json::from_str(r#"{"exit_code":0,"stack":[["num","0x2a"]]}"#).unwrap();
        let stack = ok.into_stack("EQ-bridge", "get_bridge_data").unwrap();
        assert_eq!(parse_stack_num(&stack[0]).unwrap(), 42);
    }

    #[test]
    fn test_parse_stack_cell() {
        let entry = json!(["cell", {"bytes": "te6ccgEBAQEAJAAAQ4", "object": {}}]);
        assert_eq!(parse_stack_cell(&entry).unwrap(), "te6ccgEBAQEAJAAAQ4");
    }

    #[test]
    fn test_api_response_errors() {
        let ok: ApiResponse<String> =
            serde_json::from_str(r#"{"ok":true,"result":"1000"}"#).unwrap();
        assert_eq!(ok.into_result("balance").unwrap(), "1000");

        let overloaded: ApiResponse<String> =
            serde_json::from_str(r#"{"ok":false,"error":"overloaded","code":503}"#).unwrap();
        assert!(matches!(
            overloaded.into_result("balance"),
            Err(RelayError::Transport(_))
        ));

        let rejected: ApiResponse<Value> = serde_json::from_str(
            r#"{"ok":false,"error":"external message was rejected","code":500}"#,
        )
        .unwrap();
        // 5xx stays transport even when the text looks permanent
        assert!(rejected.into_result("send").unwrap_err().is_retryable());

        let rejected: ApiResponse<Value> = serde_json::from_str(
            r#"{"ok":false,"error":"external message was rejected","code":400}"#,
        )
        .unwrap();
        assert_eq!(rejected.into_result("send").unwrap_err().kind(), "submission");
    }

    #[test]
    fn test_index_transaction_success() {
        let found: IndexTransactions = serde_json::from_str(
            r#"{"transactions":[{"hash":"abc","description":{"aborted":false,"compute_ph":{"success":true,"exit_code":0}}}]}"#,
        )
        .unwrap();
        assert!(found.transactions[0].succeeded());

        let failed: IndexTransactions = serde_json::from_str(
            r#"{"transactions":[{"hash":"def","description":{"aborted":true,"compute_ph":{"success":false,"exit_code":37}}}]}"#,
        )
        .unwrap();
        assert!(!failed.transactions[0].succeeded());
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = TonCenterConfig {
            api_url: "https://toncenter.com/api/v2".to_string(),
            api_key: Some("secret".to_string()),
            index_url: None,
            wallet: "EQwallet".to_string(),
            bridge: "EQbridge".to_string(),
            light_client_master: "EQlc".to_string(),
            recv_packet_value_nano: 700_000_000,
            update_client_value_nano: 1_000_000_000,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
