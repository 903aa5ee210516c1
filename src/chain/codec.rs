//! TON message encoding
//!
//! Cell serialization of relay bodies and wallet signing are delegated to a
//! signer service that holds the relayer key. The relayer only ever sees
//! base64 BOCs and message hashes.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::RelayMessage;
use crate::error::RelayError;

/// A signed external message ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedMessage {
    /// Base64 bag of cells
    pub boc: String,
    /// Hex hash of the external message
    pub message_hash: String,
}

/// Everything needed to wrap a relay body into a wallet transfer
#[derive(Debug, Clone, Serialize)]
pub struct EncodeRequest {
    pub wallet: String,
    pub seqno: u64,
    /// Contract the internal message is addressed to
    pub to: String,
    pub value_nano: u64,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait TonCodec: Send + Sync {
    /// Sign an external message for `request.wallet` carrying `request.body`
    async fn encode_external(&self, request: &EncodeRequest) -> Result<EncodedMessage, RelayError>;

    /// Read the address stored in a base64 cell
    async fn parse_address(&self, cell_boc: &str) -> Result<String, RelayError>;
}

/// JSON body understood by the signer for each relay message
pub fn message_body(message: &RelayMessage) -> Result<serde_json::Value, RelayError> {
    match message {
        RelayMessage::UpdateClient(data) => Ok(json!({
            "op": "update_client",
            "height": data.height,
            "header": data.header,
            "last_commit": data.last_commit,
            "validators": data.validators,
        })),
        RelayMessage::RecvPacket {
            proven_height,
            packet,
            proofs,
        } => {
            let proofs: Vec<String> = proofs
                .iter()
                .map(|p| BASE64.encode(p.encode_to_vec()))
                .collect();
            Ok(json!({
                "op": "recv_packet",
                "proven_height": proven_height,
                "packet": serde_json::to_value(packet)
                    .map_err(|e| RelayError::Submission(format!("unencodable packet: {}", e)))?,
                "proofs": proofs,
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ParseAddressResponse {
    address: String,
}

/// [`TonCodec`] over the signer's HTTP API
pub struct RemoteTonCodec {
    http: reqwest::Client,
    base_url: String,
}

impl RemoteTonCodec {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TonCodec for RemoteTonCodec {
    async fn encode_external(&self, request: &EncodeRequest) -> Result<EncodedMessage, RelayError> {
        let response = self
            .http
            .post(format!("{}/encode", self.base_url))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn parse_address(&self, cell_boc: &str) -> Result<String, RelayError> {
        let response: ParseAddressResponse = self
            .http
            .post(format!("{}/parse-address", self.base_url))
            .json(&json!({ "boc": cell_boc }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.address)
    }
}
