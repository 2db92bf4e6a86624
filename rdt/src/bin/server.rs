use clap::Parser;
use rdt::cli;
use rdt_core::{Server, ServerConfig, Shutdown};
use std::net::IpAddr;
use std::path::PathBuf;

/// Reliable UDP file-transfer server.
#[derive(Parser)]
#[command(name = "server")]
struct Args {
    /// Increase output verbosity
    #[arg(short, long)]
    verbose: bool,
    /// Decrease output verbosity
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
    /// Also write JSON logs under ./logs
    #[arg(long)]
    log: bool,
    /// Service IP address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Service port
    #[arg(short, long, default_value_t = 9000)]
    port: u16,
    /// Storage dir path
    #[arg(short, long, default_value = "server_files")]
    storage: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli::initialize_logging(args.verbose, args.quiet, args.log)?;

    let shutdown = Shutdown::new();
    let config = ServerConfig {
        bind: (args.host, args.port).into(),
        storage_dir: args.storage,
        ..Default::default()
    };
    let server = Server::bind(config, shutdown.clone()).await?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                shutdown.shut_down();
            }
        });
    }

    server.run().await?;
    Ok(())
}
