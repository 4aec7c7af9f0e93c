//! elrond-server: ring-based release orchestration server.
//!
//! Runs the HTTP control plane and the two supervisors against a shared
//! SQLite store. Multiple instances may point at the same database;
//! they coordinate through row locks only.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use elrond_core::config::ElrondConfig;
use elrond_core::model::new_id;
use elrond_core::provisioner::{
    AnnotationSink, ElrondProvisioner, GroupProvisioner, HttpProvisionerClient,
    ProvisioningParams, RingProvisioner, SloGate,
};
use elrond_core::store::Store;
use elrond_core::supervisor::{
    Doer, InstallationGroupSupervisor, RingSupervisor, Scheduler, SupervisorParams,
};
use elrond_core::webhook::WebhookSender;
use elrond_server::api::{self, AppState};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// elrond server - progressive ring-based release orchestration
#[derive(Parser, Debug)]
#[command(name = "elrond-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// The database backing the server (overrides config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// The interface and port on which to listen (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// The interval in seconds to poll for background work (overrides config)
    #[arg(long)]
    poll: Option<u64>,

    /// The provisioner server whose API will be queried (overrides config)
    #[arg(long)]
    provisioner_server: Option<String>,

    /// Whether this server runs a ring supervisor (overrides config)
    #[arg(long)]
    ring_supervisor: Option<bool>,

    /// Whether this server runs an installation group supervisor (overrides config)
    #[arg(long)]
    installation_group_supervisor: Option<bool>,

    /// Whether to output debug logs
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<ElrondConfig> {
        let mut config = match &self.config {
            Some(path) => ElrondConfig::from_file(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?,
            None => ElrondConfig::default(),
        };

        if let Some(database) = self.database {
            config.database = database;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(poll) = self.poll {
            config.poll_seconds = poll;
        }
        if let Some(provisioner_server) = self.provisioner_server {
            config.provisioner_server = provisioner_server;
        }
        if let Some(ring_supervisor) = self.ring_supervisor {
            config.ring_supervisor = ring_supervisor;
        }
        if let Some(installation_group_supervisor) = self.installation_group_supervisor {
            config.installation_group_supervisor = installation_group_supervisor;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;
    let instance_id = new_id();

    let store = Arc::new(
        Store::open(&config.database).with_context(|| {
            format!("failed to open database {}", config.database.display())
        })?,
    );
    store
        .check_version()
        .context("database schema is incompatible with this server")?;

    info!(
        instance = %instance_id,
        database = %config.database.display(),
        store_version = %store.current_version()?,
        ring_supervisor = config.ring_supervisor,
        installation_group_supervisor = config.installation_group_supervisor,
        "starting elrond server"
    );
    if !config.ring_supervisor && !config.installation_group_supervisor {
        warn!("server is running with no supervisors; only API functionality will work");
    }

    let slo = match &config.slo_endpoint {
        Some(endpoint) => Some(SloGate::new(endpoint.clone()).context("failed to build SLO gate")?),
        None => None,
    };
    let provisioner = Arc::new(ElrondProvisioner::new(
        ProvisioningParams {
            group_release_timeout: config.provisioner_group_release_timeout(),
            group_poll_interval: config.provisioner_poll_interval(),
        },
        Arc::new(
            HttpProvisionerClient::new(config.provisioner_server.clone())
                .context("failed to build provisioner client")?,
        ),
        slo,
        AnnotationSink::new(config.grafana_url.clone(), config.grafana_tokens.clone()),
    ));

    let webhooks = WebhookSender::new();
    let supervisor_params = SupervisorParams {
        soak_check_sleep: config.soak_check_sleep(),
        stale_lock_threshold: config.stale_lock_threshold(),
    };

    let mut doers: Vec<Arc<dyn Doer>> = Vec::new();
    if config.ring_supervisor {
        doers.push(Arc::new(RingSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&provisioner) as Arc<dyn RingProvisioner>,
            webhooks.clone(),
            instance_id.clone(),
            supervisor_params.clone(),
        )));
    }
    if config.installation_group_supervisor {
        doers.push(Arc::new(InstallationGroupSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&provisioner) as Arc<dyn GroupProvisioner>,
            webhooks.clone(),
            instance_id.clone(),
            supervisor_params,
        )));
    }

    if config.poll_seconds == 0 {
        info!("periodic scheduler tick is disabled");
    }
    let scheduler = Arc::new(Scheduler::new(doers, config.poll_interval()));

    let state = Arc::new(AppState {
        store,
        scheduler: Arc::clone(&scheduler),
        webhooks,
        environment: config.environment.clone(),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(addr = %config.listen, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let graceful = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    let drain_deadline = {
        let mut rx = shutdown_rx;
        async move {
            let _ = rx.changed().await;
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        }
    };

    let server = std::pin::pin!(
        axum::serve(listener, app)
            .with_graceful_shutdown(graceful)
            .into_future()
    );
    tokio::select! {
        result = server => {
            result.context("server error")?;
        }
        () = drain_deadline => {
            warn!("drain timeout elapsed with requests still in flight, exiting");
        }
    }

    info!("shutting down supervisors");
    scheduler.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

/// Resolves when SIGINT or SIGTERM is received.
async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "failed to register SIGTERM handler");
            std::future::pending().await
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(err) => {
            warn!(error = %err, "failed to register SIGINT handler");
            std::future::pending().await
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
