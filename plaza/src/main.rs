mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use plaza_sfu::{logging, Config};

/// plaza, the virtual-space media server (SFU session orchestration)
#[derive(Debug, Parser)]
#[command(name = "plaza", version, about)]
struct Args {
    /// Path to a configuration file; environment variables with the
    /// PLAZA_ prefix override file values
    #[arg(short, long, env = "PLAZA_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    logging::init_logging(&config.logging)?;

    info!("plaza server starting...");
    info!("signaling address: {}", config.http_address());

    server::run(config).await
}
