//! Orchestrator server binary.
//!
//! Serves the client WebSocket channel and health endpoint. All
//! diagnostics go through tracing; `RUST_LOG` overrides the
//! `--log-level` flag.

use aria::config::OrchestratorConfig;
use aria::conversation::ConversationJournal;
use aria::server::run_server;
use aria::session::SessionRuntime;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Real-time voice-turn orchestrator server.
#[derive(Parser)]
#[command(name = "aria-server", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port (health endpoint). Overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// WebSocket port for session sockets. Overrides the config file.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Do not persist conversation turns (testing).
    #[arg(long)]
    skip_journal: bool,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to a daily file under the data directory.
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Keep the file-appender guard alive for the process lifetime.
    let _log_guard = init_tracing(&cli)?;

    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => {
            let path = OrchestratorConfig::default_path();
            if path.exists() {
                OrchestratorConfig::load(&path)?
            } else {
                let config = OrchestratorConfig::default();
                config.save(&path)?;
                tracing::info!("wrote default config to {}", path.display());
                config
            }
        }
    };
    if let Some(port) = cli.port {
        config.server.http_port = port;
    }
    if let Some(ws_port) = cli.ws_port {
        config.server.ws_port = ws_port;
    }

    let journal = if cli.skip_journal {
        tracing::info!("conversation journal disabled");
        ConversationJournal::disabled()
    } else {
        ConversationJournal::new(&config.journal)
    };

    let runtime = Arc::new(SessionRuntime::new(config, journal)?);

    tokio::select! {
        result = run_server(runtime) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "aria={level},tower_http=warn,tungstenite=warn",
            level = cli.log_level
        ))
    });

    if cli.log_file {
        let log_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aria")
            .join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(log_dir, "aria-server.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        Ok(None)
    }
}
