//! Remote shell - session-based command execution over gRPC and HTTP.
//!
//! Usage:
//!   remote-shell serve [--grpc-port 50051] [--http-port 8080]

use clap::{Args as ClapArgs, Parser, Subcommand};
use remote_shell::cleanup::spawn_cleanup;
use remote_shell::config::ServiceConfig;
use remote_shell::service::ExecutionService;
use remote_shell::state::AppState;
use remote_shell::{grpc_server, http_server};
use std::process::exit;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remote-shell")]
#[command(about = "Remote command execution service with per-client sessions")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gRPC server (and the HTTP server unless disabled)
    Serve(ServeArgs),
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// gRPC port to listen on
    #[arg(long, default_value = "50051")]
    grpc_port: u16,

    /// HTTP port to listen on; 0 disables the HTTP server
    #[arg(long, default_value = "8080")]
    http_port: u16,

    /// Shared token clients must present; empty disables auth
    #[arg(long)]
    auth_token: Option<String>,

    /// Comma-separated command verbs to allow; empty allows all
    #[arg(long, value_delimiter = ',')]
    allow_commands: Vec<String>,

    /// Requests per window per session; 0 disables rate limiting
    #[arg(long, default_value = "60")]
    rate_limit: i64,

    /// Rate limit window in seconds
    #[arg(long, default_value = "60")]
    rate_window_sec: u64,

    /// Per-command deadline in seconds; 0 means the default of 300
    #[arg(long, default_value = "300")]
    max_runtime_sec: u64,

    /// Batch output cap in bytes; 0 means unlimited
    #[arg(long, default_value = "262144")]
    max_output: usize,

    /// Allow `|`, `&&`, `||` and `;` in command lines
    #[arg(long)]
    no_block_chaining: bool,

    /// Enable the InteractiveShell RPC (a raw host shell; refused while a
    /// command whitelist is set)
    #[arg(long)]
    allow_interactive: bool,

    /// Idle seconds before a session is evicted
    #[arg(long, default_value = "1800")]
    session_timeout_sec: u64,

    /// Seconds between cleanup passes
    #[arg(long, default_value = "300")]
    cleanup_interval_sec: u64,
}

impl ServeArgs {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            auth_token: self.auth_token.clone().filter(|t| !t.is_empty()),
            whitelist: self.allow_commands.clone(),
            rate_limit: self.rate_limit,
            rate_window: Duration::from_secs(self.rate_window_sec),
            max_runtime: Duration::from_secs(self.max_runtime_sec),
            max_output: self.max_output,
            block_chaining: !self.no_block_chaining,
            allow_interactive: self.allow_interactive,
            session_timeout: Duration::from_secs(self.session_timeout_sec),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_sec.max(1)),
            ..ServiceConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            if let Err(e) = run(serve).await {
                error!("Server failed: {}", e);
                exit(1);
            }
        }
    }
}

async fn run(args: ServeArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = args.service_config();
    if config.auth_token.is_none() {
        info!("Token authentication disabled");
    }
    if !config.whitelist.is_empty() {
        info!(verbs = ?config.whitelist, "Command whitelist active");
    }
    if config.allow_interactive {
        info!("Interactive shell enabled");
    }
    let cleanup_every = config.cleanup_interval;

    let state = AppState::new(ExecutionService::new(config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cleanup = spawn_cleanup(state.service.clone(), cleanup_every, shutdown_rx.clone());

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let grpc = grpc_server::run_server(args.grpc_port, state.clone(), shutdown_rx.clone());
    if args.http_port == 0 {
        grpc.await?;
    } else {
        let http = async {
            http_server::run_server(args.http_port, state.clone(), shutdown_rx.clone())
                .await
                .map_err(Box::<dyn std::error::Error + Send + Sync>::from)
        };
        tokio::try_join!(grpc, http)?;
    }

    let _ = cleanup.await;
    info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
