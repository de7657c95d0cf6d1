use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use funnelbot::config::AppConfig;
use funnelbot::engine::FunnelEngine;
use funnelbot::intake;
use funnelbot::parent::ParentSession;
use funnelbot::store::{Database, LibSqlBackend};
use funnelbot::supervisor::Supervisor;
use funnelbot::telegram::TelegramFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn Database> =
        Arc::new(LibSqlBackend::new_local(Path::new(&config.db_path)).await?);

    let engine = Arc::new(FunnelEngine::new(
        store.clone(),
        Arc::new(TelegramFactory::new()),
        config.correlation_salt.clone(),
        config.runtime.clone(),
    ));

    let supervisor = Arc::new(Supervisor::new(
        engine.clone(),
        config.public_url.clone(),
        config.runtime.poll_timeout_secs,
    ));
    tokio::spawn(supervisor.clone().run(config.runtime.reconcile_interval));

    // Held until shutdown; dropping it stops the parent bot's poll loop.
    let mut _parent_shutdown = None;
    if let Some(parent_token) = config.parent_token.as_deref() {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        _parent_shutdown = Some(shutdown_tx);
        let parent = ParentSession::new(
            store.clone(),
            supervisor.clone(),
            parent_token,
            config.superadmin_id,
            config.runtime.poll_timeout_secs,
            shutdown_rx,
        );
        tokio::spawn(parent.run());
        info!("Parent bot enabled");
    }

    let app = intake::router(engine);
    let listener = tokio::net::TcpListener::bind(&config.intake_bind).await?;
    info!(bind = %config.intake_bind, "Conversion intake listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Intake server exited");
        }
    });

    eprintln!("funnelbot running; intake on {}", config.intake_bind);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
