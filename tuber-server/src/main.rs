//! tuber-server - echo server
//!
//! Accepts framed JSON messages on every configured listener and sends each
//! one straight back to its session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use tuber_protocol::JsonCodec;
use tuber_server::config::{ConfigLoader, ListenerConfig, ServerConfig, DEFAULT_CONFIG_TOML};
use tuber_server::{bind, Handler, Manager, Session};
use tuber_utils::{init_logging_with_config, LogConfig, Result, TuberError};

mod cli;

use cli::Args;

/// How long to wait for sessions to close on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Echoes every message back to the session that sent it
struct EchoHandler;

#[async_trait]
impl Handler<JsonCodec> for EchoHandler {
    async fn on_session_open(&mut self, session: &Arc<Session<JsonCodec>>) {
        info!(session_id = %session.id(), peer = %session.peer_addr(), "client connected");
    }

    async fn on_session_close(&mut self, session: &Arc<Session<JsonCodec>>) {
        info!(
            session_id = %session.id(),
            reason = ?session.close_reason(),
            "client disconnected"
        );
    }

    async fn on_msg(&mut self, session: &Arc<Session<JsonCodec>>, message: Value) {
        // try_send keeps one stalled client from holding up dispatch
        if let Err(e) = session.try_send(&message) {
            error!(session_id = %session.id(), "echo failed: {}", e);
        }
    }
}

fn apply_args(mut config: ServerConfig, args: &Args) -> Result<ServerConfig> {
    if !args.listen.is_empty() {
        config.listeners = args
            .listen
            .iter()
            .map(|spec| ListenerConfig::parse(spec))
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(limit) = args.connect_limit {
        config.net.connect_limit = limit;
    }
    ConfigLoader::validate(&config)?;
    Ok(config)
}

async fn run(config: ServerConfig) -> Result<()> {
    let manager = Manager::new(config.net.clone(), JsonCodec::new(), EchoHandler);

    for listener in &config.listeners {
        let bound = bind(&listener.network, &listener.addr)
            .await
            .map_err(|e| TuberError::connection(e.to_string()))?;
        manager
            .add_listener(bound)
            .map_err(|e| TuberError::internal(e.to_string()))?;
    }

    manager
        .start()
        .map_err(|e| TuberError::internal(e.to_string()))?;
    info!("tuber server running with {} listener(s)", config.listeners.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    manager.shutdown();
    manager.close_all();

    let drained = async {
        while manager.live_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drained).await.is_err() {
        warn!("{} sessions still open after shutdown grace", manager.live_count());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if args.print_default_config {
        print!("{}", DEFAULT_CONFIG_TOML);
        return Ok(());
    }

    let config = ConfigLoader::load_and_validate(args.config.as_deref())?;
    let config = apply_args(config, &args)?;

    init_logging_with_config(LogConfig::server().with_default_filter(config.logging.filter.clone()))?;
    info!("tuber server starting");

    match run(config).await {
        Ok(()) => {
            info!("tuber server stopped");
            Ok(())
        }
        Err(e) => {
            error!("tuber server error: {}", e);
            Err(e)
        }
    }
}
