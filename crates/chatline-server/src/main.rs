use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chatline_core::Gateway;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let generated = !Path::new(&args.config).exists();
    let config = config::Config::load(&args.config)?;
    init_tracing(config.log.json);
    for warning in &config.warnings {
        tracing::warn!("{}", warning);
    }
    if generated {
        tracing::info!("Generated default config at '{}'", args.config);
    }

    let db = chatline_db::create_pool(&config.database.url, config.database.max_connections).await?;
    chatline_db::run_migrations(&db).await?;
    tracing::info!("Database ready");

    let gateway = Arc::new(Gateway::start(config.app_config(), &config.broker_config(), db).await?);
    let state = gateway.state();
    let app = chatline_api::build_router(&state)
        .merge(chatline_ws::gateway_router())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        address = %config.server.bind_address,
        broker = %config.broker.kind,
        "chatline gateway listening"
    );

    let signal_gateway = gateway.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        signal_gateway.begin_shutdown();
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    gateway
        .shutdown(Duration::from_secs(config.server.shutdown_timeout_seconds))
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chatline=info,tower_http=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutting down (ctrl-c)..."),
        _ = terminate => tracing::info!("Shutting down (SIGTERM)..."),
    }
}
