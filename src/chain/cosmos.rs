//! CometBFT RPC client for the CosmWasm source chain

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use futures::future::try_join_all;
use tendermint::block::{Commit, Header, Height};
use tendermint::merkle::proof::ProofOps;
use tendermint::validator;
use tendermint_rpc::query::Query;
use tendermint_rpc::{Client, HttpClient, Order, Paging, Url};
use tracing::debug;

use super::{EventAttribute, QueryTag, RawTx, SourceChain, TxEvent};
use crate::error::RelayError;

/// Transactions requested per `tx_search` page (CometBFT caps at 100)
const TX_PAGE_SIZE: u8 = 100;

/// Source chain client backed by a CometBFT HTTP RPC endpoint
pub struct CosmosRpcClient {
    rpc_client: HttpClient,
    rpc_url: String,
}

impl CosmosRpcClient {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let url: Url = rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let rpc_client = HttpClient::new(url).wrap_err("Failed to create RPC client")?;

        Ok(Self {
            rpc_client,
            rpc_url: rpc_url.to_string(),
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn block_time(&self, height: u64) -> Result<(u64, String), RelayError> {
        let block = self.rpc_client.block(to_height(height)?).await?;
        Ok((height, block.block.header.time.to_rfc3339()))
    }
}

fn to_height(height: u64) -> Result<Height, RelayError> {
    Height::try_from(height)
        .map_err(|e| RelayError::Config(format!("invalid height {}: {}", height, e)))
}

/// Build the `tx.height` range query with the configured tags AND-ed in
pub fn build_tx_query(from: u64, to: u64, tags: &[QueryTag]) -> Query {
    tags.iter().fold(
        Query::gte("tx.height", from).and_lte("tx.height", to),
        |query, tag| query.and_eq(tag.key.clone(), tag.value.clone()),
    )
}

#[async_trait]
impl SourceChain for CosmosRpcClient {
    async fn latest_height(&self) -> Result<u64, RelayError> {
        let status = self.rpc_client.status().await?;
        Ok(status.sync_info.latest_block_height.value())
    }

    async fn search_txs(
        &self,
        from: u64,
        to: u64,
        tags: &[QueryTag],
    ) -> Result<Vec<RawTx>, RelayError> {
        let query = build_tx_query(from, to, tags);
        let mut responses = Vec::new();
        let mut page = 1u32;

        loop {
            let response = self
                .rpc_client
                .tx_search(query.clone(), false, page, TX_PAGE_SIZE, Order::Ascending)
                .await?;
            let total = response.total_count as usize;
            let received = response.txs.len();
            responses.extend(response.txs);

            if received == 0 || responses.len() >= total {
                break;
            }
            page += 1;
        }

        if responses.is_empty() {
            return Ok(Vec::new());
        }

        // One block fetch per distinct height for the timestamps
        let heights: BTreeSet<u64> = responses.iter().map(|tx| tx.height.value()).collect();
        let times: HashMap<u64, String> =
            try_join_all(heights.into_iter().map(|h| self.block_time(h)))
                .await?
                .into_iter()
                .collect();

        debug!(from, to, txs = responses.len(), "Fetched source transactions");

        let mut txs: Vec<RawTx> = responses
            .into_iter()
            .map(|tx| {
                let height = tx.height.value();
                RawTx {
                    hash: tx.hash.to_string(),
                    height,
                    index: tx.index,
                    timestamp: times.get(&height).cloned().unwrap_or_default(),
                    code: tx.tx_result.code.value(),
                    events: tx
                        .tx_result
                        .events
                        .into_iter()
                        .map(|event| TxEvent {
                            kind: event.kind,
                            attributes: event
                                .attributes
                                .into_iter()
                                .map(|a| EventAttribute {
                                    key: String::from_utf8_lossy(a.key_bytes()).into_owned(),
                                    value: String::from_utf8_lossy(a.value_bytes()).into_owned(),
                                })
                                .collect(),
                        })
                        .collect(),
                }
            })
            .collect();
        txs.sort_by_key(|tx| (tx.height, tx.index));

        Ok(txs)
    }

    async fn block_header(&self, height: u64) -> Result<Header, RelayError> {
        let response = self.rpc_client.block(to_height(height)?).await?;
        Ok(response.block.header)
    }

    async fn last_commit(&self, height: u64) -> Result<Commit, RelayError> {
        let response = self.rpc_client.block(to_height(height)?).await?;
        response
            .block
            .last_commit
            .ok_or_else(|| RelayError::NotFound(format!("block {} has no last commit", height)))
    }

    async fn validators(&self, height: u64) -> Result<Vec<validator::Info>, RelayError> {
        let response = self
            .rpc_client
            .validators(to_height(height)?, Paging::All)
            .await?;
        Ok(response.validators)
    }

    async fn query_proof(
        &self,
        path: &str,
        key: Vec<u8>,
        height: u64,
    ) -> Result<ProofOps, RelayError> {
        let response = self
            .rpc_client
            .abci_query(Some(path.to_string()), key, Some(to_height(height)?), true)
            .await?;

        if !response.code.is_ok() {
            return Err(RelayError::ProofConstruction(format!(
                "abci query at height {} failed with code {}: {}",
                height,
                response.code.value(),
                response.log
            )));
        }
        if response.value.is_empty() {
            return Err(RelayError::NotFound(format!(
                "key {} absent at height {}",
                hex::encode(&response.key),
                height
            )));
        }

        response.proof.ok_or_else(|| {
            RelayError::ProofConstruction(format!("abci query at height {} returned no proof", height))
        })
    }
}
