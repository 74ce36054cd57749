use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use redeemer::application::processor::{ProcessorConfig, RedemptionProcessor};
use redeemer::application::settlement::{RedemptionService, SettlementSettings};
use redeemer::config::{BackendKind, ClientConfig, DEFAULT_CALL_TIMEOUT_SECS, ServiceConfig};
use redeemer::domain::address::Address;
use redeemer::domain::job::SubscriptionId;
use redeemer::domain::network::NetworkRegistry;
use redeemer::domain::ports::{DelegationStoreRef, EventRecorderRef, ExecutionBackendRef, RedeemerRef};
use redeemer::domain::subscription::Subscription;
use redeemer::infrastructure::gateway::GatewayBackend;
use redeemer::infrastructure::in_memory::{InMemoryDelegationStore, InMemoryEventRecorder};
#[cfg(feature = "storage-rocksdb")]
use redeemer::infrastructure::rocksdb::RocksDbStore;
use redeemer::infrastructure::simulated::SimulatedBackend;
use redeemer::interfaces::csv::event_writer::EventWriter;
use redeemer::interfaces::csv::job_reader::JobReader;
use redeemer::interfaces::delegation_file::import_delegations;
use redeemer::interfaces::rpc::client::RedemptionClient;
use redeemer::interfaces::rpc::server::{self, ServiceState};
use redeemer::observability;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Execution Service, configured from REDEEMER_* variables
    Serve,
    /// Dispatch due charges from a CSV file and print the recorded outcomes
    Dispatch(DispatchArgs),
}

#[derive(Args)]
struct DispatchArgs {
    /// Due charges exported by the Job Source
    jobs: PathBuf,

    /// JSON object mapping subscription ids to their delegations
    #[arg(long)]
    delegations: PathBuf,

    /// Execution Service base URL. Without it the service runs in-process
    /// over a simulated backend.
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer token; switches the client to the secure (https-only) transport
    #[arg(long)]
    auth_token: Option<String>,

    /// Smart wallet address of the in-process simulated backend
    #[arg(long)]
    account: Option<String>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    workers: usize,

    #[arg(long, default_value_t = 100)]
    queue_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT_SECS)]
    call_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// Billing interval used when seeding subscriptions not yet on file
    #[arg(long, default_value_t = 30)]
    interval_days: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => serve().await,
        Command::Dispatch(args) => dispatch(args).await,
    }
}

async fn serve() -> Result<()> {
    let config = ServiceConfig::from_env().into_diagnostic()?;

    let backend: ExecutionBackendRef = match config.backend {
        BackendKind::Simulated => {
            let account = config
                .account_address
                .clone()
                .ok_or_else(|| miette!("REDEEMER_ACCOUNT_ADDRESS is required for the simulated backend"))?;
            Arc::new(SimulatedBackend::new(account))
        }
        BackendKind::Gateway => {
            let url = config
                .gateway_url
                .clone()
                .ok_or_else(|| miette!("REDEEMER_GATEWAY_URL is required for the gateway backend"))?;
            Arc::new(GatewayBackend::new(url, Duration::from_secs(30)).into_diagnostic()?)
        }
    };
    info!(backend = ?config.backend, "execution backend selected");

    let service = RedemptionService::new(
        backend,
        Arc::new(NetworkRegistry::builtin()),
        config.settlement.clone(),
    );
    let state = Arc::new(ServiceState::new(service, config.auth_token.clone()));
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .into_diagnostic()?;

    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
    .into_diagnostic()
}

async fn dispatch(args: DispatchArgs) -> Result<()> {
    let started_at = Utc::now();
    let (recorder, delegations) = open_stores(args.db_path.as_deref())?;
    import_delegations(&args.delegations, delegations.as_ref())
        .await
        .into_diagnostic()?;

    let call_timeout = Duration::from_secs(args.call_timeout_secs);
    let redeemer: RedeemerRef = match &args.endpoint {
        Some(endpoint) => {
            let config = ClientConfig::new(endpoint.as_str(), args.auth_token.clone(), call_timeout)
                .into_diagnostic()?;
            Arc::new(RedemptionClient::new(&config).into_diagnostic()?)
        }
        None => {
            let account = args
                .account
                .as_deref()
                .ok_or_else(|| miette!("--account is required when no --endpoint is given"))?;
            let backend = Arc::new(SimulatedBackend::new(Address::parse(account).into_diagnostic()?));
            Arc::new(RedemptionService::new(
                backend,
                Arc::new(NetworkRegistry::builtin()),
                SettlementSettings::default(),
            ))
        }
    };

    let processor = RedemptionProcessor::new(
        redeemer,
        recorder.clone(),
        delegations,
        ProcessorConfig {
            workers: args.workers,
            queue_capacity: args.queue_capacity,
            call_timeout,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            ..ProcessorConfig::default()
        },
    );
    processor.start();

    let file = File::open(&args.jobs).into_diagnostic()?;
    let mut dispatched: Vec<SubscriptionId> = Vec::new();
    for job_result in JobReader::new(file).jobs() {
        let job = match job_result {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "skipping unreadable job row");
                continue;
            }
        };

        if recorder
            .subscription(&job.subscription_id)
            .await
            .into_diagnostic()?
            .is_none()
        {
            recorder
                .upsert_subscription(Subscription::for_job(&job, args.interval_days))
                .await
                .into_diagnostic()?;
        }

        let subscription_id = job.subscription_id.clone();
        match processor.submit(job).await {
            Ok(()) => {
                if !dispatched.contains(&subscription_id) {
                    dispatched.push(subscription_id);
                }
            }
            Err(e) => warn!(subscription_id = %subscription_id, error = %e, "job not submitted"),
        }
    }

    let stats = processor.stop().await;

    let mut events = Vec::new();
    for subscription_id in &dispatched {
        let recorded = recorder.events(subscription_id).await.into_diagnostic()?;
        events.extend(
            recorded
                .into_iter()
                .filter(|event| event.occurred_at >= started_at),
        );
    }

    let stdout = io::stdout();
    let mut writer = EventWriter::new(stdout.lock());
    writer.write_events(&events).into_diagnostic()?;

    info!(?stats, "dispatch finished");
    Ok(())
}

fn open_stores(db_path: Option<&Path>) -> Result<(EventRecorderRef, DelegationStoreRef)> {
    if let Some(path) = db_path {
        #[cfg(feature = "storage-rocksdb")]
        {
            let store = Arc::new(RocksDbStore::open(path).into_diagnostic()?);
            let recorder: EventRecorderRef = store.clone();
            let delegations: DelegationStoreRef = store;
            return Ok((recorder, delegations));
        }

        #[cfg(not(feature = "storage-rocksdb"))]
        {
            warn!(
                path = %path.display(),
                "persistent storage requested via --db-path, but the storage-rocksdb feature is not enabled; falling back to in-memory storage"
            );
        }
    }

    let recorder: EventRecorderRef = Arc::new(InMemoryEventRecorder::new());
    let delegations: DelegationStoreRef = Arc::new(InMemoryDelegationStore::new());
    Ok((recorder, delegations))
}
