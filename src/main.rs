use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = ledhub::config::Cli::parse();
    let cmd = cli.command.clone().unwrap_or(ledhub::config::Command::Run);

    match cmd {
        ledhub::config::Command::Run => run_server(cli.config).await,
        ledhub::config::Command::Push => push_once(cli.config).await,
    }
}

fn propagation_context(
    config: &ledhub::config::Config,
) -> Result<ledhub::propagate::PropagationContext> {
    let store = ledhub::state::JsonSnapshotStore::load_or_init(ledhub::state::StoreInit {
        data_dir: config.data_dir.clone(),
    })?;
    let transport = ledhub::transport::HttpDeviceTransport::new(
        ledhub::transport::TransportOptions::from_config(config),
    )?;

    Ok(ledhub::propagate::PropagationContext {
        store: Arc::new(Mutex::new(store)),
        transport: Arc::new(transport),
        viewers: ledhub::viewers::ViewerHub::new(),
    })
}

async fn push_once(config: ledhub::config::Config) -> Result<()> {
    let ctx = propagation_context(&config)?;
    let report =
        ledhub::propagate::propagate_once(&ctx, &ledhub::propagate::PropagationScope::All).await;

    info!(
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "push finished"
    );
    if !report.failed.is_empty() {
        let names = report
            .failed
            .iter()
            .map(|f| f.device.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow::bail!("could not reach {} device(s): {names}", report.failed.len());
    }
    Ok(())
}

async fn run_server(config: ledhub::config::Config) -> Result<()> {
    let ctx = propagation_context(&config)?;
    let coordinator = ledhub::propagate::spawn_coordinator(
        ctx.clone(),
        ledhub::propagate::CoordinatorOptions::from_config(&config),
    );

    let app = ledhub::http::build_router(
        ctx.store.clone(),
        coordinator.handle(),
        ctx.viewers.clone(),
    )
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        debounce_ms = config.debounce_ms,
        sweep_interval_ms = config.sweep_interval_ms,
        "starting ledhub"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    info!("ledhub stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
