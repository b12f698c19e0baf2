use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use demorelay_engine::JsonlDecoderFactory;
use demorelay_server::ServerConfig;
use demorelay_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

/// WebSocket relay that drives replay decoding sessions for remote clients.
#[derive(Debug, Parser)]
#[command(name = "demorelay", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "DEMORELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "DEMORELAY_PORT", default_value_t = 3000)]
    port: u16,

    /// Directory that relative session keys are resolved against.
    #[arg(long, env = "DEMORELAY_REPLAY_ROOT")]
    replay_root: Option<PathBuf>,

    /// Default log level. RUST_LOG takes precedence.
    #[arg(long, env = "DEMORELAY_LOG", default_value = "info")]
    log: Level,

    /// Per-module level override as `module=level`. Repeatable.
    #[arg(long = "log-module", value_parser = parse_module_level)]
    log_modules: Vec<(String, Level)>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty_logs: bool,

    /// Outbound frames buffered per connection.
    #[arg(long, default_value_t = 256)]
    max_send_queue: usize,

    /// Seconds between heartbeat pings.
    #[arg(long, default_value_t = 30)]
    heartbeat_interval_secs: u64,
}

fn parse_module_level(s: &str) -> Result<(String, Level), String> {
    let (module, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected module=level, got {s:?}"))?;
    if module.is_empty() {
        return Err(format!("missing module name in {s:?}"));
    }
    let level = level.parse::<Level>().map_err(|e| e.to_string())?;
    Ok((module.to_string(), level))
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_send_queue: self.max_send_queue,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            replay_root: self.replay_root.clone(),
            ..Default::default()
        }
    }
}

/// Upper bound on draining the server after a stop request.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on waiting for runtime work once the server has stopped.
/// Dispatches still blocked on another session are abandoned after this.
const RUNTIME_DRAIN: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let result = runtime.block_on(run(args));
    runtime.shutdown_timeout(RUNTIME_DRAIN);
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log,
        module_levels: args.log_modules.clone(),
        json: !args.pretty_logs,
    });

    let config = args.server_config();
    tracing::info!(
        bind = %config.bind_addr(),
        replay_root = ?config.replay_root,
        module_levels = ?telemetry.module_levels(),
        "Starting demorelay"
    );

    let factory = Arc::new(JsonlDecoderFactory::new(config.replay_root.clone()));
    let handle = demorelay_server::start(config, factory, &telemetry)
        .await
        .context("failed to start server")?;

    let token = handle.shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl+c")?;
            tracing::info!("Interrupted");
        }
        _ = token.cancelled() => {
            tracing::info!("Shutdown requested by client");
        }
    }

    handle.shutdown(SHUTDOWN_TIMEOUT).await;
    tracing::info!(counters = ?telemetry.counters().snapshot(), "Stopped");
    Ok(())
}
