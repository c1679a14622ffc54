//! Main binary for the notification service
//!
//! Serves the notification API, the real-time WebSocket endpoint, health and
//! Prometheus metrics, and runs the retry, dead-letter, batching, ingestion
//! and heartbeat loops until Ctrl+C or SIGTERM.

use notification_service::{config::NotificationConfig, NotificationService};

use axum::serve;
use clap::{Arg, ArgMatches, Command};
use std::net::SocketAddr;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "notification_service=info,tower_http=info,axum=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let matches = create_cli().get_matches();
    init_tracing(matches.get_one::<String>("log-level").map(String::as_str))?;

    let config = load_config(&matches)?;
    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    info!(host = %config.server.host, port = config.server.port, "Starting notification service");
    info!(
        email = config.email.enabled,
        sms = config.sms.enabled,
        push = config.push.enabled,
        inapp = config.inapp.enabled,
        websocket = config.websocket.enabled,
        "Configured channels"
    );

    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .map_err(|e| format!("Invalid host address: {}", e))?,
        config.server.port,
    );

    let service = NotificationService::new(config).map_err(|e| {
        error!("Failed to initialize notification service: {}", e);
        e
    })?;

    let shutdown = CancellationToken::new();
    service.start(shutdown.clone());
    let app = service.router();

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!("Notification service listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("Metrics: http://{}/metrics", addr);
    info!("WebSocket endpoint: ws://{}/ws?user_id=<id>", addr);

    let server = serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown");
            shutdown.cancel();
        }
    });

    if let Err(e) = server.await {
        error!("Server error: {}", e);
        shutdown.cancel();
    }

    service.shutdown().await;
    info!("Notification service stopped gracefully");
    Ok(())
}

/// Initialize tracing/logging. `RUST_LOG` wins over `--log-level`.
fn init_tracing(level: Option<&str>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| match level {
        Some(level) if level != "info" => EnvFilter::try_new(format!(
            "notification_service={level},tower_http={level},axum={level}"
        )),
        _ => EnvFilter::try_new(DEFAULT_LOG_FILTER),
    })?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()?;

    Ok(())
}

/// Create CLI argument parser
fn create_cli() -> Command {
    Command::new("notification-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Notification delivery service for the file-sharing platform")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info"),
        )
}

/// Load configuration from defaults, file and environment, then apply CLI
/// overrides
fn load_config(matches: &ArgMatches) -> Result<NotificationConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = if let Some(config_file) = matches.get_one::<String>("config") {
        info!("Loading configuration from file: {}", config_file);
        std::env::set_var("NOTIFICATION_CONFIG_FILE", config_file);
        NotificationConfig::from_env()
            .map_err(|e| format!("Failed to load configuration from file: {}", e))?
    } else {
        NotificationConfig::from_env().unwrap_or_else(|e| {
            warn!("Failed to load configuration from environment: {}, using defaults", e);
            NotificationConfig::default()
        })
    };

    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }

    if let Some(port_str) = matches.get_one::<String>("port") {
        config.server.port = port_str
            .parse()
            .map_err(|e| format!("Invalid port number '{}': {}", port_str, e))?;
    }

    Ok(config)
}

/// Wait for shutdown signals
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
