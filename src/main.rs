use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use workspace_orchestrator::allocator::Allocator;
use workspace_orchestrator::capacity::CapacityController;
use workspace_orchestrator::cloud::aws::AwsCloudAdapter;
use workspace_orchestrator::cloud::CloudAdapter;
use workspace_orchestrator::config::Config;
use workspace_orchestrator::http::{self, AppState, HeaderAuthExtractor};
use workspace_orchestrator::lifecycle::LifecycleReactor;
use workspace_orchestrator::liveness::LivenessGateway;
use workspace_orchestrator::reaper::IdleReaper;
use workspace_orchestrator::store::redis_store::RedisStore;
use workspace_orchestrator::store::StateStore;

#[derive(Parser)]
#[command(name = "workspace-orchestrator")]
#[command(about = "Allocates cloud workspaces to developers on demand")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP surface, idle reaper, and lifecycle webhook handler
    Serve,
    /// Print a one-shot status snapshot and exit
    Status,
    /// Run a single Capacity Controller reconcile pass and exit
    Reconcile,
}

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_CREDENTIAL_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Status => print_status(config).await,
        Commands::Reconcile => reconcile_once(config).await,
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!(error = %e, "unrecoverable store/cloud failure");
            ExitCode::from(EXIT_CREDENTIAL_FAILURE)
        }
    }
}

async fn connect(config: &Config) -> Result<(Arc<RedisStore>, Arc<AwsCloudAdapter>)> {
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let cloud = Arc::new(AwsCloudAdapter::from_env().await);
    Ok((store, cloud))
}

/// Cross-references ASG membership with the warm pool and Session Store on
/// startup, repairing any drift a State Store restart may have introduced
/// (spec §9's recommended reboot-recovery reconciler).
async fn self_heal(
    cloud: &Arc<AwsCloudAdapter>,
    store: &Arc<RedisStore>,
    config: &Config,
) -> Result<()> {
    let asg = cloud.describe_asg(&config.asg_name).await?;
    let mut healed = 0usize;

    for instance_id in &asg.instances {
        let owned = store.get_user_for_instance(instance_id).await?.is_some();
        if owned {
            continue;
        }

        let desc = cloud.describe_instance(instance_id).await?;
        if desc.is_ready() && desc.is_unassigned() {
            store.pool_add(instance_id).await?;
            healed += 1;
        }
    }

    if healed > 0 {
        info!(healed, "self-heal: reclaimed unassigned ready instances into warm pool");
    }
    Ok(())
}

async fn serve(config: Arc<Config>) -> Result<()> {
    let (store, cloud): (Arc<RedisStore>, Arc<AwsCloudAdapter>) = connect(&config).await?;
    self_heal(&cloud, &store, &config).await?;

    let store: Arc<dyn StateStore> = store;
    let cloud_dyn: Arc<dyn CloudAdapter> = cloud;

    let capacity = Arc::new(CapacityController::new(
        cloud_dyn.clone(),
        store.clone(),
        config.clone(),
    ));
    let allocator = Arc::new(Allocator::new(
        cloud_dyn.clone(),
        store.clone(),
        capacity.clone(),
        config.clone(),
    ));
    let liveness = Arc::new(LivenessGateway::new(store.clone()));
    let lifecycle = Arc::new(LifecycleReactor::new(cloud_dyn.clone(), store.clone(), config.clone()));
    let reaper = Arc::new(IdleReaper::new(
        cloud_dyn.clone(),
        store.clone(),
        capacity.clone(),
        config.clone(),
    ));

    let _reaper_handle = reaper.spawn();

    let state = Arc::new(AppState {
        allocator,
        store,
        cloud: cloud_dyn,
        liveness,
        lifecycle,
        auth: Arc::new(HeaderAuthExtractor),
        asg_name: config.asg_name.clone(),
        started_at: Instant::now(),
    });

    let addr = config.bind_addr.parse()?;
    http::run_server(addr, state).await
}

async fn print_status(config: Arc<Config>) -> Result<()> {
    let (store, cloud) = connect(&config).await?;
    let active = store.active_count().await?;
    let pool = store.pool_size().await?;
    let asg = cloud.describe_asg(&config.asg_name).await?;

    println!(
        "active_users={active} warm_spares={pool} total_instances={} asg_desired_capacity={}",
        asg.instances.len(),
        asg.desired_capacity
    );
    Ok(())
}

async fn reconcile_once(config: Arc<Config>) -> Result<()> {
    let (store, cloud) = connect(&config).await?;
    let store: Arc<dyn StateStore> = store;
    let cloud: Arc<dyn CloudAdapter> = cloud;
    let capacity = CapacityController::new(cloud, store, config);
    capacity.reconcile().await?;
    info!("reconcile complete");
    Ok(())
}
