//! Beaker kernel proxy entry point
//!
//! Binds the sockets described by the connection file Jupyter hands us and
//! relays to a kernel that is either already running or launched here.

use beaker_jupyter::{ConnectionInfo, KernelProxyManager, ProxyConfig, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beaker-proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Jupyter kernel proxy with message interception")]
struct Cli {
    /// Connection file the frontend will connect to
    #[arg(value_name = "CONNECTION_FILE")]
    connection_file: PathBuf,

    /// Kernel to proxy to: a kernel id in the runtime directory or a
    /// connection file path
    #[arg(short, long, value_name = "REF", conflicts_with = "launch")]
    kernel: Option<String>,

    /// Directory holding kernel-<id>.json connection files
    #[arg(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// Kernel name reported for a launched kernel
    #[arg(long, default_value = "python3")]
    kernel_name: String,

    /// Write the bound connection info (with real ports) to this path
    #[arg(long, value_name = "PATH")]
    write_connection_file: Option<PathBuf>,

    /// Launch a kernel; `{connection_file}` is replaced with its connection
    /// file path
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "ARGV")]
    launch: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("beaker_jupyter=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {
            tracing::info!("Proxy shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("beaker-proxy: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ProxyConfig::from_env()?;
    if let Some(dir) = cli.runtime_dir {
        config.runtime_dir = dir;
    }

    tracing::info!("Loading connection file: {}", cli.connection_file.display());
    let server_info = ConnectionInfo::from_file(&cli.connection_file)?;
    let manager = KernelProxyManager::start(&server_info, config).await?;

    if let Some(path) = &cli.write_connection_file {
        manager.relay().server_info().write_file(path)?;
        tracing::info!("Wrote bound connection info to {}", path.display());
    }

    if !cli.launch.is_empty() {
        let info = manager.start_kernel(&cli.launch, &cli.kernel_name).await?;
        tracing::info!("Proxying to launched kernel on {}", info.endpoint(beaker_jupyter::SocketType::Shell));
    } else if let Some(kernel) = cli.kernel.as_deref() {
        manager.connect_to(kernel).await?;
        tracing::info!("Proxying to kernel {}", kernel);
    } else {
        tracing::warn!("No kernel given; answering kernel_info requests until one is attached");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted; shutting down");

    // A kernel we merely attached to keeps running
    let result = if cli.launch.is_empty() {
        Ok(())
    } else {
        manager.shutdown_current_kernel().await
    };
    manager.relay().shutdown().await;
    result
}
