//! Block-range poller
//!
//! Each tick fetches `[offset, min(offset + limit, latest + 1))`, split into
//! up to `parallelism` sub-ranges fetched concurrently and emitted in height
//! order. The poller waits for the consumer to acknowledge every chunk before
//! emitting the next one and before starting the next tick, so ticks never
//! overlap and the offset only moves past chunks that were handed off.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::chain::{QueryTag, RawTx, SourceChain};
use crate::error::RelayError;
use crate::metrics;
use crate::types::Direction;
use crate::writers::retry::{with_retry, RetryPolicy};

/// Poller settings for one direction
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Blocks fetched per tick
    pub limit: u64,
    /// Concurrent sub-range fetches per tick
    pub parallelism: usize,
    pub interval: Duration,
    pub query_tags: Vec<QueryTag>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            parallelism: 4,
            interval: Duration::from_millis(5000),
            query_tags: Vec::new(),
        }
    }
}

/// Transactions of one contiguous height range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxChunk {
    pub from: u64,
    pub to: u64,
    pub txs: Vec<RawTx>,
    /// Height to resume from once this chunk is handed off
    pub offset: u64,
}

#[derive(Debug)]
pub enum PollerEvent {
    /// A fetched chunk. The consumer answers `true` once the chunk is durably
    /// handed off; `false` (or dropping the sender) rewinds to `chunk.from`.
    Chunk {
        chunk: TxChunk,
        ack: oneshot::Sender<bool>,
    },
    /// A tick failed after retries; the next tick starts from the same offset
    Error(RelayError),
}

/// Split `[from, to]` into at most `parts` contiguous ranges
pub fn split_range(from: u64, to: u64, parts: usize) -> Vec<(u64, u64)> {
    if to < from {
        return Vec::new();
    }
    let span = to - from + 1;
    let parts = (parts.max(1) as u64).min(span);
    let size = span.div_ceil(parts);

    let mut ranges = Vec::with_capacity(parts as usize);
    let mut start = from;
    while start <= to {
        let end = (start + size - 1).min(to);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

pub struct ChainPoller {
    direction: Direction,
    source: Arc<dyn SourceChain>,
    config: PollerConfig,
    retry: RetryPolicy,
}

impl ChainPoller {
    pub fn new(
        direction: Direction,
        source: Arc<dyn SourceChain>,
        config: PollerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            direction,
            source,
            config,
            retry,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Poll from `start` until the consumer goes away
    pub async fn run(self, start: u64, events: mpsc::Sender<PollerEvent>) {
        let mut offset = start;
        info!(direction = %self.direction, offset, "Chain poller started");

        loop {
            if let Err(e) = self.tick(&mut offset, &events).await {
                warn!(
                    direction = %self.direction,
                    offset,
                    error = %e,
                    "Polling cycle failed"
                );
                metrics::record_error(self.direction, "poll");
                if events.send(PollerEvent::Error(e)).await.is_err() {
                    break;
                }
            }
            if events.is_closed() {
                break;
            }
            tokio::time::sleep(self.config.interval).await;
        }

        info!(direction = %self.direction, offset, "Chain poller stopped");
    }

    /// One polling cycle. `offset` advances past every acknowledged chunk.
    pub async fn tick(
        &self,
        offset: &mut u64,
        events: &mpsc::Sender<PollerEvent>,
    ) -> Result<(), RelayError> {
        let latest = match with_retry(&self.retry, "latest_height", || {
            self.source.latest_height()
        })
        .await
        {
            Ok(latest) => latest,
            Err(RelayError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        metrics::set_chain_height(self.direction, latest);

        if latest < *offset {
            debug!(direction = %self.direction, offset = *offset, latest, "No new blocks");
            return Ok(());
        }

        let end = latest.min(offset.saturating_add(self.config.limit.max(1)) - 1);
        let ranges = split_range(*offset, end, self.config.parallelism);

        let mut chunks = stream::iter(ranges)
            .map(|(from, to)| self.fetch_range(from, to))
            .buffered(self.config.parallelism.max(1));

        while let Some(result) = chunks.next().await {
            let chunk = result?;
            let (from, next) = (chunk.from, chunk.offset);
            let blocks = chunk.to - chunk.from + 1;

            let (ack_tx, ack_rx) = oneshot::channel();
            if events
                .send(PollerEvent::Chunk { chunk, ack: ack_tx })
                .await
                .is_err()
            {
                return Ok(());
            }

            match ack_rx.await {
                Ok(true) => {
                    *offset = next;
                    metrics::record_blocks_scanned(self.direction, blocks);
                }
                _ => {
                    debug!(
                        direction = %self.direction,
                        from,
                        "Chunk not handed off, rewinding"
                    );
                    *offset = from;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    async fn fetch_range(&self, from: u64, to: u64) -> Result<TxChunk, RelayError> {
        let tags = &self.config.query_tags;
        // A missing range is an error too: the offset must not move past
        // blocks that were never read.
        let txs = with_retry(&self.retry, "search_txs", || {
            self.source.search_txs(from, to, tags)
        })
        .await?;

        debug!(direction = %self.direction, from, to, txs = txs.len(), "Fetched chunk");
        Ok(TxChunk {
            from,
            to,
            txs,
            offset: to + 1,
        })
    }
}
