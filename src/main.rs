//! IMS Connect Gateway - entry point.
//!
//! Loads configuration, wires the session/conversation/transaction/security
//! subsystems and the backend pool into a [`Dispatcher`], then runs the
//! protocol accept loop alongside the management HTTP endpoint until a
//! shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ims_connect_gateway::config::GatewayConfig;
use ims_connect_gateway::conversation::ConversationManager;
use ims_connect_gateway::dispatcher::handler::HandlerRegistry;
use ims_connect_gateway::dispatcher::Dispatcher;
use ims_connect_gateway::pool::balancer::RoundRobin;
use ims_connect_gateway::pool::BackendRegistry;
use ims_connect_gateway::security::SecurityValidator;
use ims_connect_gateway::server;
use ims_connect_gateway::session::SessionManager;
use ims_connect_gateway::transaction::TransactionManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Command-line entry point for the gateway server.
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to a `GatewayConfig` JSON file. Falls back to `GATEWAY_CONFIG_PATH`,
    /// then to the built-in development preset.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Overrides `server.port` from whatever configuration was loaded.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ims_connect_gateway=info".parse()?),
        )
        .init();

    info!("starting IMS Connect Gateway");

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("GATEWAY_CONFIG_PATH").ok().map(Into::into));
    let mut config = config_path
        .and_then(|path| GatewayConfig::load_from_file(path).ok())
        .unwrap_or_else(GatewayConfig::development);
    if let Some(port) = args.port {
        config.server.port = ims_connect_gateway::domain_types::PortNumber::try_new(port)?;
    }
    config.validate()?;
    info!(port = config.server.port.into_inner(), backends = config.backends.len(), "configuration loaded");

    let shutdown = CancellationToken::new();

    let (sessions, timeout_events) = SessionManager::spawn(config.queue_capacity, 30, 3600, shutdown.clone());
    let conversations = ConversationManager::spawn(
        config.otma.conversations_max,
        config.conversation_history_cap,
        shutdown.clone(),
    );
    let transactions = TransactionManager::new(conversations);
    let security = SecurityValidator::new();
    let handlers = HandlerRegistry::new();

    let backends = Arc::new(BackendRegistry::from_configs(
        config.backends.clone(),
        config.pool.min_per_backend,
        config.pool.max_per_backend,
        Duration::from_millis(config.pool.connect_timeout_ms),
        Box::new(RoundRobin::new()),
    ));
    backends.spawn_health_checks(Duration::from_millis(config.pool.health_check_interval_ms), shutdown.clone());

    let dispatcher = Dispatcher::new(sessions, transactions, security, handlers, config.server.max_message_size);
    dispatcher.spawn_timeout_listener(timeout_events);

    let (protocol_listener, protocol_addr) = server::bind_protocol_listener(&config.server).await?;
    info!(%protocol_addr, "protocol listener bound");
    let accept_handle = tokio::spawn(server::accept_loop(
        protocol_listener,
        Arc::clone(&dispatcher),
        config.server.clone(),
        shutdown.clone(),
    ));

    let (management_listener, management_addr) = server::bind_management_listener(&config.server).await?;
    info!(%management_addr, "management listener bound");
    let management_handle =
        tokio::spawn(server::serve_management(management_listener, server::create_router(), shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let grace = Duration::from_secs(config.server.shutdown_timeout_sec);
    let _ = tokio::time::timeout(grace, accept_handle).await;
    let _ = tokio::time::timeout(grace, management_handle).await;
    dispatcher.sessions().shutdown().await;

    info!("IMS Connect Gateway shut down gracefully");
    Ok(())
}
