use clap::Parser;
use rdt::cli::{self, Protocol};
use rdt_core::{Client, ClientConfig};
use std::net::IpAddr;
use std::path::PathBuf;

/// Upload a file to the server.
#[derive(Parser)]
#[command(name = "upload")]
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
    /// Server IP address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// Server port
    #[arg(short, long, default_value_t = 9000)]
    port: u16,
    /// Source file path
    #[arg(short, long)]
    src: PathBuf,
    /// File name on the server
    #[arg(short, long)]
    name: String,
    /// Error recovery protocol
    #[arg(short = 'r', long, value_enum, default_value = "stop_and_wait")]
    protocol: Protocol,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli::initialize_logging(args.verbose, args.quiet, args.log)?;

    let config = ClientConfig::new((args.host, args.port).into(), args.protocol.into());
    let client = Client::connect(config).await?;
    client.upload(&args.src, &args.name).await?;
    client.close().await?;
    Ok(())
}
