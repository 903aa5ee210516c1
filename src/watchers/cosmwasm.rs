//! Packet extraction from CosmWasm bridge transactions
//!
//! Pure classification of raw transactions into [`PacketBatch`]es. Only
//! successful transactions are scanned, only `wasm` attributes emitted by the
//! configured bridge contract are considered, and a packet whose required
//! fields do not parse is dropped with a warning instead of failing the batch.

use std::collections::HashMap;

use eyre::{eyre, Result, WrapErr};
use tracing::{debug, warn};

use super::Extractor;
use crate::chain::{EventAttribute, RawTx, TxEvent};
use crate::types::{AckPacket, AckStatus, PacketBatch, Provenance, Source, TransferPacket};

/// `action` of a bridge-to-TON transfer
pub const ACTION_SEND_TO_TON: &str = "send_to_ton";
/// `action` of an acknowledgement bound back to TON
pub const ACTION_SEND_TO_COSMOS: &str = "send_to_cosmos";

const CONTRACT_ADDRESS_KEY: &str = "_contract_address";

/// Attributes emitted by one contract execution
type WasmAttributes = HashMap<String, String>;

/// Split `wasm` events into one attribute map per contract execution.
///
/// A single `wasm` event may concatenate several executions; each one starts
/// with its own `_contract_address` attribute.
pub fn parse_wasm_events(events: &[TxEvent]) -> Vec<WasmAttributes> {
    let mut executions = Vec::new();

    for event in events {
        if event.kind != "wasm" && !event.kind.starts_with("wasm-") {
            continue;
        }

        let mut current: Option<WasmAttributes> = None;
        for EventAttribute { key, value } in &event.attributes {
            if key == CONTRACT_ADDRESS_KEY {
                if let Some(done) = current.take() {
                    executions.push(done);
                }
                current = Some(WasmAttributes::new());
            }
            // Attributes before any contract address cannot be attributed
            if let Some(attrs) = current.as_mut() {
                attrs.insert(key.clone(), value.clone());
            }
        }
        if let Some(done) = current {
            executions.push(done);
        }
    }

    executions
}

/// Extractor for the CosmWasm bridge contract
#[derive(Debug, Clone)]
pub struct CosmwasmBridgeExtractor {
    bridge_address: String,
}

impl CosmwasmBridgeExtractor {
    pub fn new(bridge_address: impl Into<String>) -> Self {
        Self {
            bridge_address: bridge_address.into(),
        }
    }

    pub fn bridge_address(&self) -> &str {
        &self.bridge_address
    }

    fn extract_tx(&self, tx: &RawTx, batch: &mut PacketBatch) {
        let mut provenance = Provenance {
            hash: tx.hash.clone(),
            height: tx.height,
            tx_index: tx.index,
            event_index: 0,
            timestamp: tx.timestamp.clone(),
        };

        for (index, attrs) in parse_wasm_events(&tx.events).into_iter().enumerate() {
            let contract = attrs.get(CONTRACT_ADDRESS_KEY).map(String::as_str);
            if contract != Some(self.bridge_address.as_str()) {
                continue;
            }
            provenance.event_index = index as u32;

            match attrs.get("action").map(String::as_str) {
                Some(ACTION_SEND_TO_TON) => match parse_transfer(&attrs, &provenance) {
                    Ok(packet) => batch.transfer_packets.push(packet),
                    Err(e) => warn!(
                        tx_hash = %tx.hash,
                        height = tx.height,
                        error = %e,
                        "Dropping malformed send_to_ton packet"
                    ),
                },
                Some(ACTION_SEND_TO_COSMOS) => match parse_ack(&attrs, &provenance) {
                    Ok(packet) => batch.ack_packets.push(packet),
                    Err(e) => warn!(
                        tx_hash = %tx.hash,
                        height = tx.height,
                        error = %e,
                        "Dropping malformed send_to_cosmos packet"
                    ),
                },
                _ => {}
            }
        }
    }
}

impl Extractor for CosmwasmBridgeExtractor {
    fn classify(&self, txs: &[RawTx], offset: u64) -> PacketBatch {
        let mut batch = PacketBatch {
            offset,
            ..Default::default()
        };

        for tx in txs {
            if !tx.succeeded() {
                debug!(tx_hash = %tx.hash, code = tx.code, "Skipping failed transaction");
                continue;
            }
            self.extract_tx(tx, &mut batch);
        }

        batch
    }
}

fn parse_transfer(attrs: &WasmAttributes, provenance: &Provenance) -> Result<TransferPacket> {
    let crc_src = extract_string(attrs, "crc_src")?;
    let src = Source::from_attribute(&crc_src)
        .ok_or_else(|| eyre!("Unknown crc_src: {}", crc_src))?;
    let timeout_timestamp = match attrs.get("timeout_timestamp") {
        Some(raw) => Some(
            raw.parse::<u64>()
                .wrap_err("Invalid u64 for timeout_timestamp")?,
        ),
        None => None,
    };

    Ok(TransferPacket {
        seq: extract_u64(attrs, "seq")?,
        to: extract_string(attrs, "to")?,
        denom: extract_string(attrs, "denom")?,
        amount: extract_u128(attrs, "amount")?,
        src,
        timeout_timestamp,
        provenance: provenance.clone(),
    })
}

fn parse_ack(attrs: &WasmAttributes, provenance: &Provenance) -> Result<AckPacket> {
    let status = match attrs.get("ack") {
        Some(raw) => {
            let code = raw.parse::<u8>().wrap_err("Invalid ack code")?;
            AckStatus::from_code(code).ok_or_else(|| eyre!("Unknown ack code: {}", code))?
        }
        None => AckStatus::Success,
    };

    Ok(AckPacket {
        seq: extract_u64(attrs, "seq")?,
        status,
        provenance: provenance.clone(),
    })
}

/// Helper function to extract string attribute
fn extract_string(attrs: &WasmAttributes, key: &str) -> Result<String> {
    attrs
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| eyre!("Missing attribute: {}", key))
}

/// Helper function to extract u64 attribute
fn extract_u64(attrs: &WasmAttributes, key: &str) -> Result<u64> {
    extract_string(attrs, key)?
        .parse()
        .wrap_err_with(|| format!("Invalid u64 for {}", key))
}

fn extract_u128(attrs: &WasmAttributes, key: &str) -> Result<u128> {
    extract_string(attrs, key)?
        .parse()
        .wrap_err_with(|| format!("Invalid u128 for {}", key))
}
