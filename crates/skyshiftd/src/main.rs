//! The SkyShift control-plane server binary.
//!
//! Wires the durable store, the API surface, the scheduler and the Skylet
//! manager together and runs them until SIGTERM or ctrl-c.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use skyshift_compat::DefaultManagerFactory;
use skyshift_scheduler::{Scheduler, SchedulerConfig};
use skyshift_server::{api::AppState, Authorizer, TokenSigner};
use skyshift_skylet::{SkyletConfig, SkyletManager};
use skyshift_store::{ObjectStore, SledDriver};
use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `info,skyshift_store=debug`.
const LOG_ENV: &str = "SKYSHIFTD_LOG";

#[derive(Debug, Parser)]
#[command(name = "skyshiftd", about = "SkyShift control plane", version)]
struct Cli {
    /// Address the API listens on.
    #[arg(long, env = "SKYSHIFTD_LISTEN", default_value = "127.0.0.1:50051")]
    listen: SocketAddr,

    /// Directory holding the durable KV state.
    #[arg(long, env = "SKYSHIFTD_STATE_DIR", default_value = ".skyshift/state")]
    state_dir: PathBuf,

    /// Secret the bootstrap admin account is created with.
    #[arg(long, env = "SKYSHIFTD_BOOTSTRAP_SECRET", hide_env_values = true)]
    bootstrap_secret: String,

    /// Session token lifetime in seconds.
    #[arg(long, env = "SKYSHIFTD_TOKEN_TTL", default_value_t = 24 * 60 * 60)]
    token_ttl: u64,

    /// Signing key rotation interval in seconds.
    #[arg(long, env = "SKYSHIFTD_KEY_ROTATION", default_value_t = 7 * 24 * 60 * 60)]
    key_rotation: u64,

    /// Invite token lifetime in seconds.
    #[arg(long, env = "SKYSHIFTD_INVITE_TTL", default_value_t = 7 * 24 * 60 * 60)]
    invite_ttl: u64,

    /// Scheduler plugin pipeline, in order.
    #[arg(long, value_delimiter = ',', default_values_t = [
        "DefaultPlugin".to_string(),
        "ClusterAffinityPlugin".to_string(),
    ])]
    scheduler_plugins: Vec<String>,

    /// Compose job placement filters conjunctively instead of the default
    /// disjunctive composition.
    #[arg(long, default_value_t = false)]
    and_filters: bool,

    /// Evict a cluster slice whose replicas sit PENDING longer than this
    /// many seconds. Unset disables eviction.
    #[arg(long, env = "SKYSHIFTD_WAIT_TIMEOUT")]
    wait_timeout: Option<u64>,

    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[derive(Debug, Snafu)]
enum MainError {
    #[snafu(display("failed to open state directory"))]
    OpenState { source: skyshift_store::KvError },

    #[snafu(display("failed to seed bootstrap objects"))]
    Bootstrap {
        source: skyshift_server::bootstrap::BootstrapError,
    },

    #[snafu(display("invalid scheduler configuration"))]
    SchedulerConfig {
        source: skyshift_scheduler::PluginError,
    },

    #[snafu(display("api server failed"))]
    Api { source: skyshift_server::ServeError },

    #[snafu(display("failed to install signal handler"))]
    Signals { source: std::io::Error },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let driver = SledDriver::open(&cli.state_dir).context(OpenStateSnafu)?;
    let store = ObjectStore::new(Arc::new(driver));
    skyshift_server::bootstrap(&store, &cli.bootstrap_secret)
        .await
        .context(BootstrapSnafu)?;

    // The signing key is generated entropy; the bootstrap secret only ever
    // becomes the admin account's password hash.
    let signer = Arc::new(TokenSigner::new(
        Duration::from_secs(cli.key_rotation),
        Duration::from_secs(cli.token_ttl),
    ));
    let factory = Arc::new(DefaultManagerFactory::default());

    let state = AppState {
        store: store.clone(),
        signer,
        authz: Authorizer::new(store.clone()),
        factory: factory.clone(),
        invite_ttl: Duration::from_secs(cli.invite_ttl),
    };

    let scheduler_config = SchedulerConfig {
        plugins: cli.scheduler_plugins.clone(),
        filter_composition: if cli.and_filters {
            skyshift_scheduler::FilterComposition::And
        } else {
            skyshift_scheduler::FilterComposition::Or
        },
        ..SchedulerConfig::default()
    };
    let scheduler =
        Scheduler::new(store.clone(), scheduler_config).context(SchedulerConfigSnafu)?;

    let skylet_config = SkyletConfig {
        wait_timeout: cli.wait_timeout.map(Duration::from_secs),
        ..SkyletConfig::default()
    };
    let skylet_manager = SkyletManager::new(store.clone(), factory, skylet_config);

    // One shutdown signal fans out to every component.
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut sigterm = signal(SignalKind::terminate()).context(SignalsSnafu)?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let skylet_task = tokio::spawn(skylet_manager.run(shutdown_rx.clone()));

    info!(listen = %cli.listen, "skyshiftd starting");
    let serve_result = skyshift_server::serve(cli.listen, state, shutdown_rx).await;

    let _ = scheduler_task.await;
    let _ = skylet_task.await;

    serve_result.context(ApiSnafu)?;
    info!("skyshiftd stopped");
    Ok(())
}
