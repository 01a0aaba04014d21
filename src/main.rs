use anyhow::Result;
use clap::Parser;

use respd::cli::Cli;
use respd::Server;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let server = Server::bind(&cli)?;
    server.serve()
}
