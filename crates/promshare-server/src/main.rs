use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use promshare_metrics::MetricsRegistry;
use promshare_server::{ExporterState, exporter_router};
use promshare_storage::{BackendKind, StorageConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "promshare-exporter",
    about = "Prometheus exporter for metrics aggregated in shared storage"
)]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value = "9464")]
    port: u16,

    /// memory, shared or sqlite. Overrides PROMSHARE_BACKEND.
    ///
    /// `shared` runs the CAS engine over an in-process store. It only
    /// aggregates this process's own metrics; use sqlite to share a file.
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Overrides PROMSHARE_SQLITE_PATH.
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Namespace of the exporter's own request metrics.
    #[arg(long, default_value = "promshare")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::from_default_env().add_directive("promshare=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let addr = format!("{}:{}", cli.host, cli.port);

    let mut storage = StorageConfig::from_env()?;
    if let Some(backend) = cli.backend {
        storage.backend = backend;
    }
    if let Some(path) = cli.sqlite_path {
        storage.sqlite_path = path;
    }

    let adapter = storage.build()?;
    let registry = Arc::new(MetricsRegistry::new(adapter));
    let state = Arc::new(ExporterState::new(registry, &cli.namespace)?);
    let app = exporter_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        backend = storage.backend.as_str(),
        namespace = %cli.namespace,
        "promshare exporter listening on {addr}"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
