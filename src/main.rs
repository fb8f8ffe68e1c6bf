mod backend;
mod commands;
mod config;
mod error;
mod normalize;
mod proxy;
mod sanitize;

use anyhow::Context;
use axum::Router;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use reqwest::Client;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{DEFAULT_HOST, DEFAULT_PORT, EnvSnapshot, ProxyConfig, config_warnings, load_config};
use crate::proxy::{ProxyService, router as proxy_router};

#[derive(Parser, Debug)]
#[command(name = "azure-openai-bridge")]
#[command(about = "OpenAI chat-completions proxy for Azure OpenAI deployments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    /// Errors related to the bridge's own config (config.toml/config.json)
    ProxyConfig(String),
    /// Generic fallback for other failures
    Other(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::ProxyConfig(msg) => write!(f, "Proxy config error: {}", msg),
            CliError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(e.to_string())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP proxy (default when no subcommand is given)
    Serve {
        /// Listen address (default 127.0.0.1, or [server].host from config)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (default 3000, or [server].port from config)
        #[arg(long)]
        port: Option<u16>,
        /// Write logs to ~/.azure-openai-bridge/logs/runtime.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },
    /// Inspect or initialize ~/.azure-openai-bridge/config.toml
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// List model names that resolve to a backend, with their mode and source
    Models,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the config file path in use
    Path,
    /// Initialize a commented config template (TOML)
    Init {
        /// Overwrite existing config.toml (backing up to config.toml.bak)
        #[arg(long)]
        force: bool,
    },
    /// Print the config with credentials masked
    Show,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    // A missing .env is normal; variables may come from the shell instead.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let file_cfg = match load_config().await {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{}", format!("Failed to load config: {err}").yellow());
            ProxyConfig::default()
        }
    };
    let _log_guard = init_tracing(&cli, &file_cfg);
    let env = EnvSnapshot::capture();

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
        log_file: false,
    }) {
        Command::Config { cmd } => {
            commands::config::handle_config_cmd(cmd).await?;
        }
        Command::Models => {
            commands::config::handle_models_cmd(&env).await?;
        }
        Command::Serve { host, port, .. } => {
            let host = host
                .or_else(|| file_cfg.server.host.clone())
                .unwrap_or_else(|| DEFAULT_HOST.to_string());
            let port = port.or(file_cfg.server.port).unwrap_or(DEFAULT_PORT);
            run_server(file_cfg, env, &host, port)
                .await
                .map_err(|e| CliError::Other(format!("{e:#}")))?;
        }
    }

    Ok(())
}

fn init_tracing(cli: &Cli, cfg: &ProxyConfig) -> Option<WorkerGuard> {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let to_file = match &cli.command {
        Some(Command::Serve { log_file, .. }) => *log_file || cfg.logging.file,
        None => cfg.logging.file,
        _ => false,
    };

    if to_file {
        let log_dir = crate::config::proxy_home_dir().join("logs");
        let _ = std::fs::create_dir_all(&log_dir);

        rotate_runtime_log_if_needed(&log_dir);

        let file_appender = tracing_appender::rolling::never(&log_dir, "runtime.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(non_blocking)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

fn rotate_runtime_log_if_needed(log_dir: &std::path::Path) {
    fn parse_u64_env(key: &str) -> Option<u64> {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|&n| n > 0)
    }

    let max_bytes =
        parse_u64_env("AZURE_OPENAI_BRIDGE_LOG_MAX_BYTES").unwrap_or(20 * 1024 * 1024);
    let max_files = parse_u64_env("AZURE_OPENAI_BRIDGE_LOG_MAX_FILES").unwrap_or(10) as usize;

    let path = log_dir.join("runtime.log");
    let Ok(meta) = std::fs::metadata(&path) else {
        return;
    };
    if meta.len() < max_bytes {
        return;
    }

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let _ = std::fs::rename(&path, log_dir.join(format!("runtime.log.{ts}")));

    let Ok(rd) = std::fs::read_dir(log_dir) else {
        return;
    };
    let mut rotated: Vec<std::path::PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|s| s.starts_with("runtime.log."))
        })
        .collect();
    if rotated.len() <= max_files {
        return;
    }
    rotated.sort();
    let remove_count = rotated.len().saturating_sub(max_files);
    for p in rotated.into_iter().take(remove_count) {
        let _ = std::fs::remove_file(p);
    }
}

async fn run_server(cfg: ProxyConfig, env: EnvSnapshot, host: &str, port: u16) -> anyhow::Result<()> {
    let warnings = config_warnings(&env, &cfg);
    if !warnings.is_empty() {
        tracing::warn!("======== Model config warnings ========");
        for w in warnings {
            tracing::warn!("{}", w);
        }
        tracing::warn!("=======================================");
    }

    // Connect timeout only; requests carry no deadline.
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let proxy = ProxyService::new(client, Arc::new(cfg), env);
    let app: Router = proxy_router(proxy);

    let addr: SocketAddr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("invalid listen address {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("listen address {host}:{port} resolved to nothing"))?;
    let listener = bind_local_listener_or_explain(addr).await?;
    tracing::info!("azure-openai-bridge listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;
    tracing::info!("azure-openai-bridge stopped");
    Ok(())
}

async fn bind_local_listener_or_explain(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        let help = listener_bind_help(addr, &err);
        anyhow::Error::new(err).context(help)
    })
}

fn listener_bind_help(addr: SocketAddr, err: &std::io::Error) -> String {
    let port = addr.port();
    let example_cmd = format!("azure-openai-bridge serve --port {}", port.saturating_add(1));

    match err.kind() {
        ErrorKind::AddrInUse => format!(
            "cannot listen on http://{addr}: port {port} is already in use.\n\
- stop the process holding it, or pick another port, e.g. `{example_cmd}`"
        ),
        ErrorKind::PermissionDenied => format!(
            "cannot listen on http://{addr}: permission denied for port {port}.\n\
- use an unprivileged port, e.g. `{example_cmd}`"
        ),
        ErrorKind::AddrNotAvailable => format!(
            "cannot listen on http://{addr}: address {} is not available on this machine.\n\
- use --host 127.0.0.1 or a local interface address",
            addr.ip()
        ),
        _ => format!("cannot listen on http://{addr}.\n- try another port, e.g. `{example_cmd}`"),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                // Fallback: at least handle Ctrl+C.
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
