use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobbatch_operator::{
    config::{Config, EventSinkKind},
    controllers::BatchController,
    metrics,
    sinks::{KubeEventSink, NotificationSink, StdoutSink},
    startup,
};

#[derive(Debug, Parser)]
#[command(name = "jobbatch-operator", version, about = "Runs batches of job templates with bounded concurrency")]
struct Cli {
    /// Only watch this namespace (default: all namespaces)
    #[arg(long)]
    namespace: Option<String>,

    /// Number of reconciliation workers
    #[arg(long)]
    workers: Option<usize>,

    /// Do not create the JobBatch and JobTemplate CRDs on startup
    #[arg(long)]
    skip_crd_install: bool,

    /// Where notifications go: kubernetes or stdout
    #[arg(long)]
    event_sink: Option<EventSinkKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load()?;
    if let Some(namespace) = cli.namespace {
        config.controller.namespace = Some(namespace);
    }
    if let Some(workers) = cli.workers {
        config.controller.workers = workers;
    }
    if cli.skip_crd_install {
        config.crds.install = false;
    }
    if let Some(sink) = cli.event_sink {
        config.events.sink = sink;
    }
    config.validate()?;
    info!("Loaded configuration: {:?}", config);

    metrics::register_metrics()?;

    let client = Client::try_default().await?;

    if config.crds.install {
        startup::ensure_crds(&client, config.crds.establish_timeout).await?;
    } else {
        info!("Skipping CRD installation");
    }

    let sink: Arc<dyn NotificationSink> = match config.events.sink {
        EventSinkKind::Kubernetes => Arc::new(KubeEventSink::new(
            client.clone(),
            config.events.component.clone(),
            config.events.host.clone(),
        )),
        EventSinkKind::Stdout => Arc::new(StdoutSink::new(None, config.events.pretty)),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, stopping"),
            Err(e) => {
                warn!("Failed to listen for interrupt: {}", e);
                // Keep the sender alive so the controller is not stopped.
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    BatchController::new(client, config, sink).run(shutdown_rx).await?;
    Ok(())
}
