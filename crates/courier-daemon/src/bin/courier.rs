//! Courier CLI - Serve, upload and download files
//!
//! Usage:
//!   courier serve [--dir DIR]             Accept uploads and downloads
//!   courier put <file> [--as NAME]        Upload a file
//!   courier get <name> [--output PATH]    Download a file
//!   courier config                        Print a sample configuration
//!
//! Exit codes: 0 ok, 1 startup failure, 2 usage, 3 I/O error,
//! 4 protocol error, 5 partial transfer, 6 connection failure.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use courier_core::{Config, ConfigError, TransferResult};
use courier_daemon::{ClientError, CourierClient, CourierServer, EXIT_STARTUP_FAILURE};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Concurrent file transfer over TCP", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the file server
    Serve {
        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Storage directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Sessions allowed to run at once
        #[arg(long)]
        max_sessions: Option<usize>,
    },

    /// Upload a file
    Put {
        /// Local file to send
        file: PathBuf,

        /// Name to store the file under (default: local file name)
        #[arg(long = "as", value_name = "NAME")]
        remote_name: Option<String>,

        /// Server host
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Download a file
    Get {
        /// Name of the stored file
        name: String,

        /// Where to save it (default: download directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Server host
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a sample configuration file
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    match cli.command {
        Commands::Serve {
            bind,
            port,
            dir,
            max_sessions,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(dir) = dir {
                config.server.storage_dir = dir;
            }
            if let Some(max) = max_sessions {
                config.server.max_sessions = max;
            }
            match config.validate() {
                Ok(()) => run_serve(config).await,
                Err(e) => startup_failure(e),
            }
        }
        Commands::Put {
            file,
            remote_name,
            host,
            port,
        } => {
            apply_client_overrides(&mut config, host, port);
            match config.validate() {
                Ok(()) => run_put(config, &file, remote_name.as_deref()).await,
                Err(e) => startup_failure(e),
            }
        }
        Commands::Get {
            name,
            output,
            host,
            port,
        } => {
            apply_client_overrides(&mut config, host, port);
            match config.validate() {
                Ok(()) => run_get(config, &name, output.as_deref()).await,
                Err(e) => startup_failure(e),
            }
        }
        Commands::Config => {
            if let Some(path) = Config::default_path() {
                println!("# Default location: {}", path.display());
            }
            print!("{}", Config::sample());
            ExitCode::SUCCESS
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) if !path.exists() => Err(ConfigError::Io(format!(
            "config file {} does not exist",
            path.display()
        ))),
        Some(path) => Config::load_from(path),
        None => Ok(Config::load()),
    }
}

fn apply_client_overrides(config: &mut Config, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.client.host = host;
    }
    if let Some(port) = port {
        config.client.port = port;
    }
}

fn startup_failure(e: ConfigError) -> ExitCode {
    error!("{}", e);
    ExitCode::from(EXIT_STARTUP_FAILURE)
}

async fn run_serve(config: Config) -> ExitCode {
    let server = match CourierServer::bind_default(config.server, config.transfer).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    // Handle Ctrl+C
    let handle = server.handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                handle.stop();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn run_put(config: Config, file: &Path, remote_name: Option<&str>) -> ExitCode {
    let client = CourierClient::new(config.client, config.transfer);
    report(client.upload(file, remote_name).await)
}

async fn run_get(config: Config, name: &str, output: Option<&Path>) -> ExitCode {
    let client = CourierClient::new(config.client, config.transfer);
    report(client.download(name, output).await)
}

fn report(outcome: Result<TransferResult, ClientError>) -> ExitCode {
    match outcome {
        Ok(result) => {
            println!("{}", result.summary());
            if let Some(path) = &result.stored_at {
                println!("Saved to {}", path.display());
            }
            ExitCode::from(result.outcome.exit_code())
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
