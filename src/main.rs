//! ccbridge - remote session bridge
//!
//! Runs interactive coding-assistant CLI sessions inside pseudo-terminals and
//! exposes them to authenticated WebSocket clients.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as ClapParser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ccbridge::{
    api,
    attachments::DirAttachmentStore,
    auth::JwtAuthenticator,
    bridge::{Bridge, BridgeDeps},
    config::{BridgeConfig, ConfigError},
    error::BridgeError,
    sanitize::StandardSanitizer,
    shutdown::ShutdownCoordinator,
    store::{MemoryStore, SessionStore, SqliteStore, StoreError},
};

/// How long open sockets get to receive their close frames.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// ccbridge - remote session bridge
///
/// Spawns assistant sessions in pseudo-terminals and streams them to
/// WebSocket clients.
#[derive(ClapParser, Debug)]
#[command(name = "ccbridge", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket server
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// HS256 secret used to verify connection tokens
    #[arg(long, env = "CCBRIDGE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Command line run in each session's PTY
    #[arg(long)]
    program: Option<String>,

    /// SQLite database for session records
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory for uploaded photos
    #[arg(long)]
    upload_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut BridgeConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(secret) = self.jwt_secret {
            config.jwt_secret = Some(secret);
        }
        if let Some(program) = self.program {
            config.program = program;
        }
        if let Some(db) = self.db {
            config.db_path = Some(db);
        }
        if let Some(dir) = self.upload_dir {
            config.upload_dir = Some(dir);
        }
    }
}

#[derive(Error, Debug)]
pub enum CcbridgeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), CcbridgeError> {
    let mut cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.take().or_else(BridgeConfig::default_path);
    let mut config = match &config_path {
        Some(path) => BridgeConfig::load_or_default(path)?,
        None => BridgeConfig::default(),
    };
    cli.apply(&mut config);

    run_server(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ccbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn resolve_secret(configured: Option<String>) -> String {
    match configured.filter(|s| !s.is_empty()) {
        Some(secret) => secret,
        None => {
            use rand::Rng;
            tracing::warn!(
                "no JWT secret configured; generated a random one, tokens will not survive a restart"
            );
            rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(48)
                .map(char::from)
                .collect()
        }
    }
}

async fn open_store(config: &BridgeConfig) -> Result<Arc<dyn SessionStore>, CcbridgeError> {
    match config.resolved_db_path() {
        Some(path) => {
            tracing::info!(path = %path.display(), "opening session database");
            Ok(Arc::new(SqliteStore::open(&path).await?))
        }
        None => {
            tracing::warn!("no data directory available, session records kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(?e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

async fn run_server(config: BridgeConfig) -> Result<(), CcbridgeError> {
    tracing::info!("ccbridge starting");

    let store = open_store(&config).await?;
    let upload_dir = config.resolved_upload_dir();
    tokio::fs::create_dir_all(&upload_dir).await?;

    let secret = resolve_secret(config.jwt_secret.clone());
    let authenticator = Arc::new(JwtAuthenticator::new(secret.as_bytes()));

    let bridge = Bridge::spawn(
        config.bridge_options(),
        BridgeDeps {
            store,
            sanitizer: Arc::new(StandardSanitizer),
            attachments: Arc::new(DirAttachmentStore::new(upload_dir)),
        },
    )
    .await?;

    let shutdown = ShutdownCoordinator::new();
    let mut state = api::AppState::new(bridge.clone(), authenticator, shutdown.clone());
    state.max_connections = config.max_connections;
    state.max_message_size = config.max_message_size();

    let app = api::router(
        state,
        api::RouterConfig {
            upgrade_rate_per_sec: config.upgrade_rate_per_sec,
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            server_shutdown_rx.await.ok();
        })
        .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
        }
        _ = terminate_signal() => {
            tracing::info!("received SIGTERM");
        }
    }

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    if !shutdown.wait_for_all_closed(CLOSE_GRACE).await {
        tracing::warn!(
            remaining = shutdown.active_connections(),
            "connections still open after grace period"
        );
    }

    let _ = server_shutdown_tx.send(());
    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(?e, "HTTP server error"),
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }

    match bridge.shutdown().await {
        Ok(killed) => tracing::info!(killed, "sessions terminated"),
        Err(e) => tracing::warn!(?e, "bridge already stopped"),
    }

    tracing::info!("ccbridge exiting");
    Ok(())
}
