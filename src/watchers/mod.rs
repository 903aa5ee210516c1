//! Source-chain watchers and the relay orchestrator
//!
//! Per direction: a [`ChainPoller`] feeds raw transactions to an
//! [`Extractor`], the extracted packets become durable jobs, the jobs go to
//! that direction's submission pipeline, and only then is the offset saved.

use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::{Destination, RawTx};
use crate::error::RelayError;
use crate::metrics;
use crate::store::{OffsetStore, RelayStore};
use crate::types::{Direction, Job, PacketBatch, PacketKind};
use crate::writers::retry::{with_retry, RetryPolicy};

pub mod cosmwasm;
pub mod poller;

pub use cosmwasm::CosmwasmBridgeExtractor;
pub use poller::{ChainPoller, PollerConfig, PollerEvent, TxChunk};

/// Turns raw source transactions into bridge packets.
///
/// Implementations are pure: the same input always yields the same batch.
pub trait Extractor: Send + Sync {
    /// Classify `txs`; `offset` is the height to resume from afterwards
    fn classify(&self, txs: &[RawTx], offset: u64) -> PacketBatch;
}

/// Startup check that the destination bridge trusts the expected light client
pub struct BridgeCheck {
    pub destination: Arc<dyn Destination>,
    pub light_client: String,
}

/// Everything needed to watch one direction
pub struct RelayDirection {
    pub direction: Direction,
    pub poller: ChainPoller,
    pub extractor: Arc<dyn Extractor>,
    /// Offset floor
    pub min_height: u64,
    /// Queue of this direction's submission pipeline
    pub jobs: mpsc::Sender<Job>,
    pub bridge_check: Option<BridgeCheck>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Consecutive offset save failures tolerated before stopping
    pub max_offset_save_failures: u32,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_offset_save_failures: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Drives every configured direction
pub struct Orchestrator {
    store: Arc<dyn RelayStore>,
    directions: Vec<RelayDirection>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RelayStore>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            directions: Vec::new(),
            config,
        }
    }

    pub fn with_direction(mut self, direction: RelayDirection) -> Self {
        self.directions.push(direction);
        self
    }

    /// Run all directions concurrently.
    /// Returns on shutdown or when any direction hits a fatal error.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        if self.directions.is_empty() {
            return Err(eyre!("no relay direction configured"));
        }

        let mut join_set = tokio::task::JoinSet::new();
        for relay in self.directions {
            let store = self.store.clone();
            let config = self.config.clone();
            join_set.spawn(async move { drive(relay, store, config).await });
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping orchestrator");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A relay direction exited unexpectedly without error");
                        Err(eyre!("relay direction exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A relay direction stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A relay direction task panicked: {:?}", e);
                        Err(eyre!("relay direction task panicked: {}", e))
                    }
                    None => Err(eyre!("all relay directions exited unexpectedly")),
                }
            }
        }
    }
}

async fn verify_bridge(check: &BridgeCheck, retry: &RetryPolicy) -> Result<(), RelayError> {
    let bridge = with_retry(retry, "bridge_config", || check.destination.bridge_config()).await?;
    if bridge.light_client != check.light_client {
        return Err(RelayError::Config(format!(
            "bridge adapter uses light client {}, expected {}",
            bridge.light_client, check.light_client
        )));
    }
    info!(
        light_client = %bridge.light_client,
        bridge_wasm = ?bridge.bridge_wasm,
        "Bridge adapter configuration verified"
    );
    Ok(())
}

/// Re-enqueue jobs that were in flight when the process stopped
async fn resume_jobs(
    direction: Direction,
    store: &dyn RelayStore,
    jobs: &mpsc::Sender<Job>,
) -> Result<usize> {
    let pending = store
        .resumable_jobs(direction)
        .await
        .wrap_err("Failed to load resumable jobs")?;
    let count = pending.len();
    for job in pending {
        jobs.send(job)
            .await
            .map_err(|_| eyre!("submission pipeline closed"))?;
    }
    Ok(count)
}

/// Classify one chunk, persist and enqueue its jobs, then save the offset
async fn hand_off(
    direction: Direction,
    extractor: &dyn Extractor,
    store: &dyn RelayStore,
    offsets: &OffsetStore,
    jobs: &mpsc::Sender<Job>,
    chunk: &TxChunk,
) -> Result<(), RelayError> {
    let batch = extractor.classify(&chunk.txs, chunk.offset);
    let offset = batch.offset;

    if !batch.is_empty() {
        for _ in &batch.transfer_packets {
            metrics::record_packet_detected(direction, PacketKind::Transfer);
        }
        for _ in &batch.ack_packets {
            metrics::record_packet_detected(direction, PacketKind::Ack);
        }
        let detected = batch.len();

        let new_jobs = store.insert_jobs(direction, batch.into_packets()).await?;
        info!(
            direction = %direction,
            from = chunk.from,
            to = chunk.to,
            detected,
            new_jobs = new_jobs.len(),
            "Packets detected"
        );

        for job in new_jobs {
            debug!(job_id = job.id, key = %job.key(), "Enqueueing job");
            jobs.send(job)
                .await
                .map_err(|_| RelayError::Config("submission pipeline closed".to_string()))?;
        }
    }

    offsets.save(offset).await?;
    metrics::set_offset(direction, offset);
    Ok(())
}

async fn drive(
    relay: RelayDirection,
    store: Arc<dyn RelayStore>,
    config: OrchestratorConfig,
) -> Result<()> {
    let RelayDirection {
        direction,
        poller,
        extractor,
        min_height,
        jobs,
        bridge_check,
    } = relay;

    if let Some(check) = &bridge_check {
        verify_bridge(check, &config.retry)
            .await
            .wrap_err_with(|| format!("Bridge check failed for {}", direction))?;
    }

    let resumed = resume_jobs(direction, store.as_ref(), &jobs).await?;
    let offsets = OffsetStore::new(store.clone(), direction);
    let start = offsets.load(min_height).await;
    metrics::set_offset(direction, start);
    info!(direction = %direction, start, resumed, "Relay direction started");

    let (events_tx, mut events_rx) = mpsc::channel(1);
    let poller_task = tokio::spawn(poller.run(start, events_tx));

    let mut failures = 0u32;
    let result = loop {
        match events_rx.recv().await {
            Some(PollerEvent::Chunk { chunk, ack }) => {
                match hand_off(
                    direction,
                    extractor.as_ref(),
                    store.as_ref(),
                    &offsets,
                    &jobs,
                    &chunk,
                )
                .await
                {
                    Ok(()) => {
                        if failures > 0 {
                            info!(direction = %direction, "Offset saves recovered");
                        }
                        failures = 0;
                        metrics::set_consecutive_offset_failures(direction, 0);
                        let _ = ack.send(true);
                    }
                    Err(e @ RelayError::Config(_)) => {
                        let _ = ack.send(false);
                        break Err(eyre!(e));
                    }
                    Err(e) => {
                        let _ = ack.send(false);
                        failures += 1;
                        metrics::set_consecutive_offset_failures(direction, failures);
                        metrics::record_error(direction, e.kind());
                        error!(
                            direction = %direction,
                            from = chunk.from,
                            failures,
                            error = %e,
                            "Chunk hand-off failed, rewinding"
                        );
                        if failures >= config.max_offset_save_failures {
                            break Err(eyre!(e).wrap_err(format!(
                                "{} consecutive offset save failures for {}",
                                failures, direction
                            )));
                        }
                    }
                }
            }
            Some(PollerEvent::Error(e)) => {
                warn!(direction = %direction, error = %e, "Poller reported error");
            }
            None => break Err(eyre!("poller for {} stopped", direction)),
        }
    };

    poller_task.abort();
    result
}
