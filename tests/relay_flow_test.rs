//! End-to-end relay flow: poller, extractor, offsets, proofs and submission
//! wired together over mocked chains and the in-memory store.
//!
//! Run with: cargo test --test relay_flow_test

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use common::{send_to_ton_tx, MockDestination, MockSource, BRIDGE, LIGHT_CLIENT};
use tonbridge_relayer::error::RelayError;
use tonbridge_relayer::proof::{CommitmentNamespaces, ProofBuilder, ProofSource};
use tonbridge_relayer::store::{MemoryStore, RelayStore};
use tonbridge_relayer::types::{Direction, JobStatus};
use tonbridge_relayer::watchers::{
    BridgeCheck, ChainPoller, CosmwasmBridgeExtractor, Orchestrator, OrchestratorConfig,
    PollerConfig, PollerEvent, RelayDirection,
};
use tonbridge_relayer::writers::{
    AccountLocks, JobEvent, PipelineConfig, RetryPolicy, SubmissionPipeline,
};

const START: u64 = 90;

struct Relay {
    store: Arc<MemoryStore>,
    source: Arc<MockSource>,
    destination: Arc<MockDestination>,
    events: mpsc::UnboundedReceiver<JobEvent>,
    shutdown: mpsc::Sender<()>,
    orchestrator: JoinHandle<eyre::Result<()>>,
}

fn poller_config() -> PollerConfig {
    PollerConfig {
        limit: 100,
        parallelism: 4,
        interval: Duration::from_secs(5),
        query_tags: Vec::new(),
    }
}

fn builder(source: Arc<MockSource>) -> ProofBuilder {
    ProofBuilder::new(
        source,
        BRIDGE,
        CommitmentNamespaces::default(),
        RetryPolicy::default(),
    )
    .unwrap()
}

fn launch(
    store: Arc<MemoryStore>,
    source: Arc<MockSource>,
    destination: Arc<MockDestination>,
    max_offset_save_failures: u32,
) -> Relay {
    let (pipeline, events) = SubmissionPipeline::new(
        Arc::new(builder(source.clone())),
        destination.clone(),
        store.clone(),
        AccountLocks::new(),
        PipelineConfig::default(),
    );
    let (jobs_tx, jobs_rx) = mpsc::channel(64);
    tokio::spawn(pipeline.run(jobs_rx));

    let orchestrator = Orchestrator::new(
        store.clone(),
        OrchestratorConfig {
            max_offset_save_failures,
            retry: RetryPolicy::default(),
        },
    )
    .with_direction(RelayDirection {
        direction: Direction::CosmosToTon,
        poller: ChainPoller::new(
            Direction::CosmosToTon,
            source.clone(),
            poller_config(),
            RetryPolicy::default(),
        ),
        extractor: Arc::new(CosmwasmBridgeExtractor::new(BRIDGE)),
        min_height: START,
        jobs: jobs_tx,
        bridge_check: Some(BridgeCheck {
            destination: destination.clone(),
            light_client: LIGHT_CLIENT.to_string(),
        }),
    });

    let (shutdown, shutdown_rx) = mpsc::channel(1);
    let orchestrator = tokio::spawn(orchestrator.run(shutdown_rx));

    Relay {
        store,
        source,
        destination,
        events,
        shutdown,
        orchestrator,
    }
}

impl Relay {
    async fn next_event(&mut self) -> JobEvent {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("no job event")
            .expect("pipeline closed")
    }

    /// Wait until the durable offset reaches `height`
    async fn offset_reaches(&self, height: u64) {
        let wait = async {
            loop {
                if let Ok(Some(saved)) = self.store.load_offset(Direction::CosmosToTon).await {
                    if saved >= height {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(600), wait)
            .await
            .expect("offset never reached target");
    }

    async fn stop(self) -> eyre::Result<()> {
        let _ = self.shutdown.send(()).await;
        self.orchestrator.await.expect("orchestrator panicked")
    }
}

#[tokio::test(start_paused = true)]
async fn test_transfer_relayed_end_to_end() {
    let source = Arc::new(MockSource::new(100));
    source.push_tx(send_to_ton_tx("AA01", 95, BRIDGE, 1, "A", "D", "1000000"));
    let destination = Arc::new(MockDestination::new(50));
    let mut relay = launch(Arc::new(MemoryStore::new()), source, destination, 5);

    let completion = match relay.next_event().await {
        JobEvent::Completed(completion) => completion,
        other => panic!("unexpected event {:?}", other),
    };
    let transfer = completion.transfer().unwrap();
    assert_eq!(transfer.to, "A");
    assert_eq!(transfer.denom, "D");
    assert_eq!(transfer.amount, 1_000_000);
    assert_eq!(transfer.provenance.height, 95);

    // Packet proof at proven height 96 means the store is read at 95
    let key = builder(relay.source.clone()).commitment_key("send_packet_commitment", 1);
    let proof_queries = relay.source.proof_queries.lock().unwrap().clone();
    assert_eq!(proof_queries, vec![(key, 95)]);

    // Header 96 is finalized by the commit carried in block 97
    assert_eq!(*relay.source.header_queries.lock().unwrap(), vec![96]);
    assert_eq!(*relay.source.commit_queries.lock().unwrap(), vec![97]);

    let broadcasts = relay.destination.broadcasts();
    assert_eq!(relay.destination.labels(), vec!["update_client", "recv_packet"]);
    assert!(broadcasts.iter().all(|b| b.proven_height == 96));

    let jobs = relay.store.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status(), Some(JobStatus::Confirmed));

    relay.offset_reaches(101).await;
    assert!(relay.stop().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_blocks_without_bridge_events_advance_offset() {
    let source = Arc::new(MockSource::new(100));
    source.push_tx(send_to_ton_tx("BB01", 92, "orai1othercontract", 1, "A", "D", "5"));
    let mut failed_tx = send_to_ton_tx("BB02", 93, BRIDGE, 2, "A", "D", "5");
    failed_tx.code = 5;
    source.push_tx(failed_tx);

    let relay = launch(
        Arc::new(MemoryStore::new()),
        source,
        Arc::new(MockDestination::new(50)),
        5,
    );

    relay.offset_reaches(101).await;
    assert!(relay.store.jobs().is_empty());
    assert!(relay.destination.broadcasts().is_empty());
    assert!(relay.stop().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_proof_failures_fail_job_and_polling_continues() {
    let source = Arc::new(MockSource::new(100));
    source.push_tx(send_to_ton_tx("CC01", 95, BRIDGE, 1, "A", "D", "7"));
    source.fail_proofs(3);
    let mut relay = launch(
        Arc::new(MemoryStore::new()),
        source,
        Arc::new(MockDestination::new(1_000)),
        5,
    );

    let failure = match relay.next_event().await {
        JobEvent::Failed(failure) => failure,
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(failure.stage, JobStatus::ProofRequested);
    assert!(matches!(failure.error, RelayError::Transport(_)));
    assert_eq!(relay.source.proof_queries.lock().unwrap().len(), 3);

    // New blocks keep being picked up
    relay
        .source
        .push_tx(send_to_ton_tx("CC02", 105, BRIDGE, 2, "A", "D", "8"));
    relay.source.set_latest(110);

    match relay.next_event().await {
        JobEvent::Completed(completion) => assert_eq!(completion.key.seq, 2),
        other => panic!("unexpected event {:?}", other),
    }

    let failed = relay.store.failed_jobs(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("proof node unavailable"));
    assert!(relay.stop().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_from_saved_offset() {
    let store = Arc::new(MemoryStore::new());
    let relay = launch(
        store.clone(),
        Arc::new(MockSource::new(100)),
        Arc::new(MockDestination::new(50)),
        5,
    );
    relay.offset_reaches(101).await;
    assert!(relay.stop().await.is_ok());

    let source = Arc::new(MockSource::new(120));
    source.push_tx(send_to_ton_tx("DD01", 110, BRIDGE, 9, "A", "D", "3"));
    let mut relay = launch(store, source, Arc::new(MockDestination::new(50)), 5);

    match relay.next_event().await {
        JobEvent::Completed(completion) => assert_eq!(completion.key.seq, 9),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(relay.source.first_search_from(), Some(101));
    assert!(relay.stop().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_unsaved_offset_rewinds_without_duplicating_jobs() {
    let store = Arc::new(MemoryStore::new());
    store.fail_offset_io(true);
    let source = Arc::new(MockSource::new(100));
    source.push_tx(send_to_ton_tx("EE01", 91, BRIDGE, 4, "A", "D", "11"));
    let mut relay = launch(store.clone(), source, Arc::new(MockDestination::new(1_000)), 100);

    // The first chunk holds the packet: jobs persist, the offset does not
    tokio::time::sleep(Duration::from_secs(12)).await;
    let searches = relay.source.searches.lock().unwrap().clone();
    assert!(searches.iter().filter(|(from, _)| *from == START).count() >= 2);

    store.fail_offset_io(false);
    relay.offset_reaches(101).await;

    match relay.next_event().await {
        JobEvent::Completed(completion) => assert_eq!(completion.key.seq, 4),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(store.jobs().len(), 1);
    assert_eq!(relay.destination.labels(), vec!["recv_packet"]);
    assert!(relay.stop().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_offset_failures_are_fatal() {
    let store = Arc::new(MemoryStore::new());
    store.fail_offset_io(true);
    let relay = launch(
        store,
        Arc::new(MockSource::new(100)),
        Arc::new(MockDestination::new(50)),
        3,
    );

    let result = tokio::time::timeout(Duration::from_secs(600), relay.orchestrator)
        .await
        .expect("orchestrator kept running")
        .expect("orchestrator panicked");
    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("3 consecutive offset save failures"));
}

#[tokio::test(start_paused = true)]
async fn test_light_client_mismatch_stops_startup() {
    let destination = Arc::new(MockDestination::new(50));
    destination.set_light_client("EQ-some-other-client");
    let relay = launch(
        Arc::new(MemoryStore::new()),
        Arc::new(MockSource::new(100)),
        destination,
        5,
    );

    let result = tokio::time::timeout(Duration::from_secs(60), relay.orchestrator)
        .await
        .expect("orchestrator kept running")
        .expect("orchestrator panicked");
    let err = result.unwrap_err();
    let relay_error = err.downcast_ref::<RelayError>().unwrap();
    assert!(matches!(relay_error, RelayError::Config(_)));
    assert!(relay.source.searches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_update_client_data_is_all_or_nothing() {
    let source = Arc::new(MockSource::new(100));
    source.missing_commits(true);
    let builder = builder(source.clone());

    let err = builder.create_update_client_data(96).await.unwrap_err();
    assert!(matches!(err, RelayError::ProofConstruction(_)));
    // Three attempts, each asking for the commit in block 97
    assert_eq!(*source.commit_queries.lock().unwrap(), vec![97, 97, 97]);
    assert!(source.header_queries.lock().unwrap().iter().all(|h| *h == 96));

    source.missing_commits(false);
    let data = builder.create_update_client_data(96).await.unwrap();
    assert_eq!(data.height, 96);
    assert_eq!(data.header.height.value(), 96);
    assert_eq!(data.last_commit.height.value(), 97);
}

#[tokio::test(start_paused = true)]
async fn test_packet_proof_succeeds_after_transient_failures() {
    let source = Arc::new(MockSource::new(100));
    source.fail_proofs(2);
    let builder = builder(source.clone());

    let proofs = builder.get_packet_proofs(51, 3).await.unwrap();
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].key, builder.commitment_key("send_packet_commitment", 3));

    let queries = source.proof_queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 3);
    assert!(queries.iter().all(|(_, height)| *height == 50));
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_range_keeps_offset() {
    let source = Arc::new(MockSource::new(20));
    source.missing_ranges(true);
    let poller = ChainPoller::new(
        Direction::CosmosToTon,
        source.clone(),
        poller_config(),
        RetryPolicy::default(),
    );

    let (events_tx, mut events_rx) = mpsc::channel(8);
    let acker = tokio::spawn(async move {
        let mut chunks = 0;
        while let Some(event) = events_rx.recv().await {
            if let PollerEvent::Chunk { ack, .. } = event {
                chunks += 1;
                let _ = ack.send(true);
            }
        }
        chunks
    });

    let mut offset = 1;
    let err = poller.tick(&mut offset, &events_tx).await.unwrap_err();
    assert!(matches!(err, RelayError::NotFound(_)));
    assert_eq!(offset, 1);

    // Once the node serves the range again the same blocks are read
    source.missing_ranges(false);
    poller.tick(&mut offset, &events_tx).await.unwrap();
    assert_eq!(offset, 21);

    drop(events_tx);
    assert_eq!(acker.await.unwrap(), 4);
    assert_eq!(source.first_search_from(), Some(1));
}
