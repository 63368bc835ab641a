use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use execq_infra::ServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    execq_observability::init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    info!(config = ?config, "starting execq-api");

    let services = Arc::new(
        execq_api::app::build_services(&config)
            .await
            .context("failed to build services")?,
    );
    let resetters = services.spawn_resetters(config.reset_interval);

    let app = execq_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    for resetter in resetters {
        resetter.shutdown().await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
