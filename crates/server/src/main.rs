use anyhow::Result;
use axum::serve;
use conduit_core::{
    config::AppConfig, dispatcher::Dispatcher, metrics::MetricsCollector, project::ProjectsRegistry,
};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use server::{create_app, AppState};
use std::{net::SocketAddr, sync::Arc};
use tokio::{signal, sync::broadcast};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system based on the configuration.
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &AppConfig) {
    let filter = if let Ok(env_filter) = std::env::var("RUST_LOG") {
        match env_filter.as_str() {
            "debug" | "trace" => {
                EnvFilter::new(format!("warn,conduit_core={env_filter},server={env_filter}"))
            }
            _ => EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("warn,conduit_core=info,server=info")),
        }
    } else {
        let level = &config.logging.level;
        EnvFilter::new(format!("warn,conduit_core={level},server={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("Failed to install crypto provider: {e:?}"))?;

    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!("Starting Conduit gateway");
    debug!(
        projects_count = config.projects.len(),
        budgets_count = config.rate_limiters.budgets.len(),
        bind_port = config.server.bind_port,
        "Configuration loaded"
    );

    let metrics = if config.metrics.enabled {
        Some(Arc::new(
            MetricsCollector::new().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {e}"))?,
        ))
    } else {
        None
    };

    let projects = ProjectsRegistry::bootstrap(&config, metrics.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Project bootstrap failed: {e}"))?;
    let projects = Arc::new(projects);
    info!(projects_count = config.projects.len(), "Projects initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let background = projects.start_background(&shutdown_tx);

    let state = Arc::new(AppState {
        dispatcher: Dispatcher::new(Arc::clone(&projects), config.max_timeout(), metrics.clone()),
        metrics,
    });
    let app = create_app(state, &config.server);

    let addr: SocketAddr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    info!(address = %addr, "RPC server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    if let Err(e) = serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "Server error occurred");
    }

    let _ = shutdown_tx.send(());
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task failed during shutdown");
        }
    }
    info!("Server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
