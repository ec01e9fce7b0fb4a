//! synego - kernel and worker node entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use synego_base::builtin::EchoModule;
use synego_base::registry::HandlerModule;
use synego_base::{observability, spawn_local_workers, Config, Kernel, WorkerNode};

#[derive(Parser)]
#[command(name = "synego")]
#[command(about = "Multi-transport dispatch fabric")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a kernel serving every configured transport
    Kernel {
        /// JSON config file; defaults apply when omitted
        #[arg(short, long, env = "SYNEGO_CONFIG")]
        config: Option<PathBuf>,

        /// In-process worker nodes to start alongside the kernel
        #[arg(short, long, default_value = "0")]
        workers: usize,
    },

    /// Run a worker node that joins a kernel
    Worker {
        /// JSON config file; defaults apply when omitted
        #[arg(short, long, env = "SYNEGO_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> synego_base::Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Ok(Config::default()),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
        }
        token.cancel();
    });
}

async fn run_kernel(config: Config, workers: usize) -> synego_base::Result<()> {
    let kernel = Arc::new(Kernel::from_config(&config));
    let mounted = kernel.mount(&EchoModule);
    tracing::info!("Kernel {} starting with {} local handler(s)", kernel.node_id(), mounted.len());

    let nodes = if workers > 0 {
        let modules: Vec<Arc<dyn HandlerModule>> = vec![Arc::new(EchoModule)];
        spawn_local_workers(&kernel, workers, &modules, &config.kernel).await?
    } else {
        Vec::new()
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    kernel.serve(&config.transports, cancel).await?;

    for node in nodes {
        node.shutdown().await;
    }
    Ok(())
}

async fn run_worker(config: Config) -> synego_base::Result<()> {
    let worker = WorkerNode::from_config(&config);
    worker.mount(&EchoModule);
    tracing::info!("Service node starting with ID: {}", worker.node_id());

    let node = worker.join(None).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    node.run_until(cancel).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Kernel { config, workers } => {
            let config = load_config(config)?;
            observability::init_tracing_with(&config.observability);
            run_kernel(config, workers).await?;
        }
        Commands::Worker { config } => {
            let config = load_config(config)?;
            observability::init_tracing_with(&config.observability);
            run_worker(config).await?;
        }
    }

    Ok(())
}
