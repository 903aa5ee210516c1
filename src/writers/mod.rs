//! Submission pipeline
//!
//! Turns queued [`Job`]s into confirmed destination transactions:
//!
//! ```text
//! Detected -> ProofRequested -> ProofReady -> Submitted -> Confirmed
//!                  |                |              |
//!                  +----------------+--------------+--> Failed
//! ```
//!
//! Proof construction runs on a bounded pool of workers. Prepared jobs leave
//! the pool in enqueue order and go to a single submitter, which holds the
//! destination account lock across broadcast and confirmation. Every terminal
//! outcome is persisted and reported on the event channel.

use std::sync::{Arc, Mutex};

use futures::stream::{FuturesOrdered, StreamExt};
use ics23::ExistenceProof;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bounded_cache::BoundedKeyCache;
use crate::chain::{BroadcastReceipt, Destination, RelayMessage};
use crate::confirmation::{self, ConfirmationConfig};
use crate::error::RelayError;
use crate::metrics;
use crate::proof::{LightClientUpdateData, ProofSource};
use crate::store::RelayStore;
use crate::types::{Direction, Job, JobKey, JobStatus, Packet, PacketKind, TransferPacket};

pub mod account_lock;
pub mod retry;

pub use account_lock::AccountLocks;
pub use retry::{classify_error, with_retry, RetryPolicy};

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Jobs building proofs concurrently
    pub workers: usize,
    pub retry: RetryPolicy,
    pub confirmation: ConfirmationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            confirmation: ConfirmationConfig::default(),
        }
    }
}

/// A relayed packet, reported once its job is confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub job_id: i64,
    pub key: JobKey,
    pub packet: Packet,
    /// Hash of the confirmed packet message
    pub message_hash: String,
}

impl Completion {
    /// Recipient, denom, amount and source of a relayed transfer
    pub fn transfer(&self) -> Option<&TransferPacket> {
        match &self.packet {
            Packet::Transfer(transfer) => Some(transfer),
            Packet::Ack(_) => None,
        }
    }
}

/// Outcome of a wallet balance check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletBalance {
    Healthy(u128),
    /// Below the configured minimum
    Low(u128),
    /// Balance query failed
    Unknown,
}

/// Read the relayer wallet balance, export it and warn when it runs low
pub async fn check_wallet_balance(
    destination: &dyn Destination,
    wallet: &str,
    minimum: u128,
) -> WalletBalance {
    match destination.balance(wallet).await {
        Ok(balance) => {
            metrics::set_wallet_balance(balance, minimum);
            if balance < minimum {
                warn!(wallet, balance = %balance, minimum = %minimum, "Relayer wallet balance is low");
                WalletBalance::Low(balance)
            } else {
                debug!(wallet, balance = %balance, "Relayer wallet balance");
                WalletBalance::Healthy(balance)
            }
        }
        Err(e) => {
            warn!(wallet, error = %e, "Failed to read wallet balance");
            WalletBalance::Unknown
        }
    }
}

/// A job that reached `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: i64,
    pub key: JobKey,
    /// Last state reached before failing
    pub stage: JobStatus,
    pub error: RelayError,
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Completed(Completion),
    Failed(JobFailure),
}

/// Holds one slot of the in-flight gauge until dropped
struct InFlight(Direction);

impl InFlight {
    fn new(direction: Direction) -> Self {
        metrics::inc_jobs_in_flight(direction);
        Self(direction)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::dec_jobs_in_flight(self.0);
    }
}

/// Proofs gathered for a job, owned by it until submission
struct Prepared {
    job: Job,
    proven_height: u64,
    update: Option<LightClientUpdateData>,
    proofs: Vec<ExistenceProof>,
    in_flight: InFlight,
}

struct StageError {
    stage: JobStatus,
    error: RelayError,
}

fn at(stage: JobStatus) -> impl Fn(RelayError) -> StageError {
    move |error| StageError { stage, error }
}

pub struct SubmissionPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    proofs: Arc<dyn ProofSource>,
    destination: Arc<dyn Destination>,
    store: Arc<dyn RelayStore>,
    locks: AccountLocks,
    config: PipelineConfig,
    events: mpsc::UnboundedSender<JobEvent>,
    confirmed: Mutex<BoundedKeyCache<JobKey>>,
}

impl SubmissionPipeline {
    /// Build a pipeline and the receiver of its terminal job events
    pub fn new(
        proofs: Arc<dyn ProofSource>,
        destination: Arc<dyn Destination>,
        store: Arc<dyn RelayStore>,
        locks: AccountLocks,
        config: PipelineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let pipeline = Self {
            inner: Arc::new(Inner {
                proofs,
                destination,
                store,
                locks,
                config,
                events,
                confirmed: Mutex::new(BoundedKeyCache::default()),
            }),
        };
        (pipeline, events_rx)
    }

    /// Drain `jobs` until the sender side closes and every job is finished
    pub async fn run(self, mut jobs: mpsc::Receiver<Job>) {
        let workers = self.inner.config.workers.max(1);
        let (ready_tx, mut ready_rx) = mpsc::channel::<Prepared>(workers);

        let submitter_inner = self.inner.clone();
        let submitter = tokio::spawn(async move {
            while let Some(prepared) = ready_rx.recv().await {
                submitter_inner.submit(prepared).await;
            }
        });

        info!(workers, account = %self.inner.destination.account(), "Submission pipeline started");

        let mut in_flight = FuturesOrdered::new();
        let mut open = true;
        loop {
            tokio::select! {
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok(Some(prepared)) => {
                            if ready_tx.send(prepared).await.is_err() {
                                // The returned job drops with its in-flight slot
                                error!("Submitter stopped, abandoning prepared jobs");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!(error = %e, "Proof task panicked"),
                    }
                }
                maybe_job = jobs.recv(), if open && in_flight.len() < workers => {
                    match maybe_job {
                        Some(job) => {
                            let inner = self.inner.clone();
                            in_flight.push_back(tokio::spawn(async move { inner.prepare(job).await }));
                        }
                        None => open = false,
                    }
                }
                else => break,
            }
        }

        drop(ready_tx);
        if let Err(e) = submitter.await {
            error!(error = %e, "Submitter task panicked");
        }
        info!("Submission pipeline stopped");
    }
}

impl Inner {
    async fn set_status(&self, job: &Job, status: JobStatus) {
        if let Err(e) = self.store.update_job_status(job.id, status).await {
            warn!(job_id = job.id, status = %status, error = %e, "Failed to persist job status");
        }
    }

    async fn already_confirmed(&self, job: &Job) -> bool {
        let key = job.key();
        let cached = self
            .confirmed
            .lock()
            .map(|cache| cache.contains(&key))
            .unwrap_or(false);
        if cached {
            return true;
        }
        match self.store.job_status(job.id).await {
            Ok(Some(JobStatus::Confirmed)) => true,
            Ok(_) => false,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Failed to read job status");
                false
            }
        }
    }

    async fn prepare(&self, job: Job) -> Option<Prepared> {
        if self.already_confirmed(&job).await {
            debug!(job_id = job.id, key = %job.key(), "Job already confirmed, skipping");
            return None;
        }
        let in_flight = InFlight::new(job.direction);

        if let Some(hash) = job.submitted_hash.clone() {
            if confirmation::recorded_broadcast_landed(
                self.destination.as_ref(),
                &hash,
                &self.config.confirmation,
            )
            .await
            {
                info!(job_id = job.id, key = %job.key(), message_hash = %hash, "Recorded broadcast landed");
                let receipt = BroadcastReceipt {
                    message_hash: hash,
                    sequence: 0,
                };
                self.complete(job, receipt).await;
                return None;
            }
            warn!(job_id = job.id, message_hash = %hash, "Recorded broadcast not found, relaying again");
        }

        match self.build_proofs(&job).await {
            Ok((proven_height, update, proofs)) => Some(Prepared {
                job,
                proven_height,
                update,
                proofs,
                in_flight,
            }),
            Err(StageError { stage, error }) => {
                self.fail(&job, stage, error).await;
                None
            }
        }
    }

    async fn build_proofs(
        &self,
        job: &Job,
    ) -> Result<(u64, Option<LightClientUpdateData>, Vec<ExistenceProof>), StageError> {
        self.set_status(job, JobStatus::ProofRequested).await;

        let proven_height = job.packet.proven_height();
        let seq = job.packet.seq();
        let trusted = with_retry(&self.config.retry, "trusted_height", || {
            self.destination.trusted_height()
        })
        .await
        .map_err(at(JobStatus::ProofRequested))?;

        let (update, proofs) = tokio::try_join!(
            async {
                if trusted < proven_height {
                    self.proofs
                        .create_update_client_data(proven_height)
                        .await
                        .map(Some)
                } else {
                    Ok(None)
                }
            },
            async {
                match job.packet.kind() {
                    PacketKind::Transfer => self.proofs.get_packet_proofs(proven_height, seq).await,
                    PacketKind::Ack => self.proofs.get_ack_packet_proofs(proven_height, seq).await,
                }
            },
        )
        .map_err(at(JobStatus::ProofRequested))?;

        info!(
            job_id = job.id,
            key = %job.key(),
            proven_height,
            trusted,
            needs_update = update.is_some(),
            proofs = proofs.len(),
            "Proofs ready"
        );
        self.set_status(job, JobStatus::ProofReady).await;

        Ok((proven_height, update, proofs))
    }

    async fn submit(&self, prepared: Prepared) {
        let Prepared {
            job,
            proven_height,
            update,
            proofs,
            in_flight: _in_flight,
        } = prepared;

        let _guard = self.locks.acquire(self.destination.account()).await;

        match self.deliver(&job, proven_height, update, proofs).await {
            Ok(receipt) => self.complete(job, receipt).await,
            Err(StageError { stage, error }) => self.fail(&job, stage, error).await,
        }
    }

    /// Advance the light client if still needed, then deliver the packet.
    /// Caller holds the account lock.
    async fn deliver(
        &self,
        job: &Job,
        proven_height: u64,
        update: Option<LightClientUpdateData>,
        proofs: Vec<ExistenceProof>,
    ) -> Result<BroadcastReceipt, StageError> {
        // An earlier job may have moved the light client past this height
        let trusted = with_retry(&self.config.retry, "trusted_height", || {
            self.destination.trusted_height()
        })
        .await
        .map_err(at(JobStatus::ProofReady))?;

        if trusted < proven_height {
            let data = match update {
                Some(data) => data,
                None => self
                    .proofs
                    .create_update_client_data(proven_height)
                    .await
                    .map_err(at(JobStatus::ProofReady))?,
            };
            self.broadcast_and_confirm(job, RelayMessage::UpdateClient(data))
                .await?;
        } else {
            debug!(job_id = job.id, trusted, proven_height, "Light client already trusted");
        }

        self.broadcast_and_confirm(
            job,
            RelayMessage::RecvPacket {
                proven_height,
                packet: job.packet.clone(),
                proofs,
            },
        )
        .await
    }

    async fn broadcast_and_confirm(
        &self,
        job: &Job,
        message: RelayMessage,
    ) -> Result<BroadcastReceipt, StageError> {
        let sequence = with_retry(&self.config.retry, "sequence", || self.destination.sequence())
            .await
            .map_err(at(JobStatus::ProofReady))?;

        let receipt = self
            .destination
            .submit(sequence, &message)
            .await
            .map_err(at(JobStatus::ProofReady))?;

        // Only the packet broadcast is recorded; it is what a restart resolves
        let persisted = match message {
            RelayMessage::RecvPacket { .. } => {
                self.store.mark_submitted(job.id, &receipt.message_hash).await
            }
            RelayMessage::UpdateClient(_) => {
                self.store.update_job_status(job.id, JobStatus::Submitted).await
            }
        };
        if let Err(e) = persisted {
            warn!(job_id = job.id, error = %e, "Failed to persist submitted status");
        }
        info!(
            job_id = job.id,
            key = %job.key(),
            message = message.label(),
            sequence,
            message_hash = %receipt.message_hash,
            "Submitted"
        );

        let waited = confirmation::wait_for_confirmation(
            self.destination.as_ref(),
            &receipt,
            sequence,
            &self.config.confirmation,
        )
        .await
        .map_err(at(JobStatus::Submitted))?;
        metrics::record_confirmation_latency(message.label(), waited.as_secs_f64());

        Ok(receipt)
    }

    async fn complete(&self, job: Job, receipt: BroadcastReceipt) {
        let key = job.key();
        if let Err(e) = self.store.mark_confirmed(job.id).await {
            error!(job_id = job.id, key = %key, error = %e, "Failed to persist confirmed status");
            metrics::record_error(job.direction, e.kind());
        }
        if let Ok(mut cache) = self.confirmed.lock() {
            cache.insert(key);
        }
        metrics::record_job_finished(job.direction, JobStatus::Confirmed);

        info!(
            job_id = job.id,
            key = %key,
            message_hash = %receipt.message_hash,
            "Job confirmed"
        );

        let _ = self.events.send(JobEvent::Completed(Completion {
            job_id: job.id,
            key,
            packet: job.packet,
            message_hash: receipt.message_hash,
        }));
    }

    async fn fail(&self, job: &Job, stage: JobStatus, error: RelayError) {
        let key = job.key();
        error!(
            job_id = job.id,
            key = %key,
            stage = %stage,
            error_kind = error.kind(),
            error = %error,
            "Job failed"
        );

        if let Err(e) = self.store.mark_failed(job.id, &error.to_string()).await {
            error!(job_id = job.id, error = %e, "Failed to persist failed status");
        }
        metrics::record_error(job.direction, error.kind());
        metrics::record_job_finished(job.direction, JobStatus::Failed);

        let _ = self.events.send(JobEvent::Failed(JobFailure {
            job_id: job.id,
            key,
            stage,
            error,
        }));
    }
}
