use std::collections::HashMap;
use std::sync::Arc;

use eyre::WrapErr;
use tokio::sync::mpsc;

use tonbridge_relayer::api::{self, ApiState};
use tonbridge_relayer::chain::{
    CosmosRpcClient, Destination, RemoteTonCodec, SourceChain, TonCenterClient,
};
use tonbridge_relayer::config::Config;
use tonbridge_relayer::db;
use tonbridge_relayer::metrics;
use tonbridge_relayer::proof::ProofBuilder;
use tonbridge_relayer::store::{PgRelayStore, RelayStore};
use tonbridge_relayer::types::Direction;
use tonbridge_relayer::watchers::{
    BridgeCheck, ChainPoller, CosmwasmBridgeExtractor, Orchestrator, RelayDirection,
};
use tonbridge_relayer::writers::{check_wallet_balance, AccountLocks, JobEvent, SubmissionPipeline};

/// Jobs buffered between the orchestrator and the pipeline
const JOB_QUEUE_SIZE: usize = 1024;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting TON bridge relayer");

    let config = Config::load()?;
    tracing::info!(
        cosmos_rpc = %config.cosmos.rpc_url,
        wasm_bridge = %config.cosmos.bridge_address,
        ton_bridge = %config.ton.bridge_address,
        start_height = config.sync.start_height,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn RelayStore> = Arc::new(PgRelayStore::new(pool));

    // Source side
    let source: Arc<dyn SourceChain> = Arc::new(CosmosRpcClient::new(&config.cosmos.rpc_url)?);
    let proofs = ProofBuilder::new(
        source.clone(),
        &config.cosmos.bridge_address,
        config.namespaces(),
        config.retry_policy(),
    )
    .wrap_err("Failed to create proof builder")?;

    // Destination side
    let codec = Arc::new(RemoteTonCodec::new(&config.ton.signer_url));
    let destination: Arc<dyn Destination> =
        Arc::new(TonCenterClient::new(config.ton_center_config(), codec));

    // Pipeline
    let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_SIZE);
    let (pipeline, mut job_events) = SubmissionPipeline::new(
        Arc::new(proofs),
        destination.clone(),
        store.clone(),
        AccountLocks::new(),
        config.pipeline_config(),
    );
    let pipeline_task = tokio::spawn(pipeline.run(jobs_rx));

    // Completion consumer: balance watch and failure reporting
    let balance_destination = destination.clone();
    let wallet = config.ton.wallet_address.clone();
    let min_balance = config.ton.min_wallet_balance_nano;
    tokio::spawn(async move {
        while let Some(event) = job_events.recv().await {
            match event {
                JobEvent::Completed(completion) => {
                    if let Some(transfer) = completion.transfer() {
                        tracing::info!(
                            job_id = completion.job_id,
                            to = %transfer.to,
                            denom = %transfer.denom,
                            amount = %transfer.amount,
                            src = %transfer.src,
                            message_hash = %completion.message_hash,
                            "Transfer relayed"
                        );
                    }
                    check_wallet_balance(balance_destination.as_ref(), &wallet, min_balance).await;
                }
                JobEvent::Failed(failure) => {
                    tracing::warn!(
                        job_id = failure.job_id,
                        key = %failure.key,
                        stage = %failure.stage,
                        error = %failure.error,
                        "Job needs operator attention, replay with POST /replay/{}",
                        failure.job_id
                    );
                }
            }
        }
    });

    // Shutdown wiring
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    // Start metrics/API server
    let api_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.relayer.api_port));
    let api_state = ApiState {
        store: store.clone(),
        replay: HashMap::from([(Direction::CosmosToTon, jobs_tx.clone())]),
    };
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let orchestrator = Orchestrator::new(store, config.orchestrator_config()).with_direction(
        RelayDirection {
            direction: Direction::CosmosToTon,
            poller: ChainPoller::new(
                Direction::CosmosToTon,
                source,
                config.poller_config(),
                config.retry_policy(),
            ),
            extractor: Arc::new(CosmwasmBridgeExtractor::new(
                config.cosmos.bridge_address.clone(),
            )),
            min_height: config.sync.start_height,
            jobs: jobs_tx,
            bridge_check: Some(BridgeCheck {
                destination,
                light_client: config.ton.light_client_master.clone(),
            }),
        },
    );

    tracing::info!("Relayer initialized, starting processing");
    let result = orchestrator.run(shutdown_rx).await;
    pipeline_task.abort();
    metrics::UP.set(0.0);

    match result {
        Ok(()) => {
            tracing::info!("TON bridge relayer stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Orchestrator error");
            Err(e)
        }
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tonbridge_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
