//! Chatbridge - OpenAI-compatible gateway over an automated browser chat
//! session.
//!
//! This binary wires the full pipeline together:
//! - HTTP API server (OpenAI-compatible chat completions)
//! - Wire decoder (plugged into the interception callback)
//! - Request coordinator and rotation controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatbridge_core::browser::mock::MockBrowser;
use chatbridge_core::{
    discover_profiles, BrowserPort, CoordinationContext, EventQueue, ProfileTier, RotationConfig,
    RotationController, StreamConfig,
};
use chatbridge_server::{AppState, RequestCoordinator, Server, ServerConfig};
use chatbridge_store::{CooldownStore, UsageStore};
use chatbridge_wire::{InterceptRules, WireDecoder};

/// Chatbridge - OpenAI-compatible gateway over a browser chat session
#[derive(Parser, Debug)]
#[command(name = "chatbridge", version, about)]
struct Args {
    /// Host to bind the API server to
    #[arg(long, default_value = chatbridge_server::DEFAULT_HOST)]
    host: String,

    /// Port to bind the API server to
    #[arg(long, default_value_t = chatbridge_server::DEFAULT_PORT)]
    port: u16,

    /// Directory holding stored credential profiles
    /// (`<dir>/standard/*`, `<dir>/emergency/*`)
    #[arg(long)]
    profiles_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "chatbridge", "Chatbridge").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with daily file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chatbridge={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("chatbridge")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                if args.debug {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stdout))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                }

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    tracing::warn!("File logging unavailable, using console only");
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let data_dir = chatbridge_store::default_data_dir()
        .unwrap_or_else(|| PathBuf::from("."));
    let profiles_dir = args
        .profiles_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("profiles"));

    let mut profiles = discover_profiles(&profiles_dir.join("standard"), ProfileTier::Standard);
    profiles.extend(discover_profiles(
        &profiles_dir.join("emergency"),
        ProfileTier::Emergency,
    ));
    tracing::info!(
        dir = %profiles_dir.display(),
        count = profiles.len(),
        "profile pool loaded"
    );

    let ctx = Arc::new(CoordinationContext::new());
    let cooldowns = CooldownStore::load(data_dir.join("cooldowns.json"));
    let usage = UsageStore::load(data_dir.join("usage.json"));

    // Stand-in automation layer; a CDP-backed implementation plugs in here.
    let browser: Arc<dyn BrowserPort> = Arc::new(MockBrowser::new());

    let rotation = Arc::new(RotationController::new(
        ctx.clone(),
        browser.clone(),
        RotationConfig::default(),
        profiles,
        cooldowns,
        usage,
    ));
    match rotation.activate_initial().await {
        Ok(path) => tracing::info!(profile = %path.display(), "profile active"),
        Err(e) => tracing::warn!(error = %e, "starting without an active profile"),
    }

    let (sink, queue) = EventQueue::channel();
    // The decoder is handed to the interception callback of the automation
    // layer; decoded events flow into the queue through the sink.
    let decoder = Arc::new(WireDecoder::new(
        InterceptRules::default(),
        ctx.clone(),
        Some(sink),
    ));
    decoder.set_model(chatbridge_server::state::DEFAULT_MODEL);

    let coordinator = Arc::new(RequestCoordinator::new(
        ctx.clone(),
        browser.clone(),
        rotation.clone(),
        queue,
        StreamConfig::default(),
    ));
    let coordinator_loop = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    let state = AppState::new(ctx.clone(), coordinator, rotation, Vec::new());
    let config = ServerConfig::default()
        .with_host(args.host.clone())
        .with_port(args.port);
    let server = Server::new(config, state)?;
    tracing::info!(addr = %server.addr(), "API server starting");
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    ctx.request_shutdown();

    // Give the in-flight session and the coordinator a moment to wind down.
    let _ = tokio::time::timeout(Duration::from_secs(5), coordinator_loop).await;
    server_task.abort();
    tracing::info!("goodbye");
    Ok(())
}
