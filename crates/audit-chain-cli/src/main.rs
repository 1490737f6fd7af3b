use anyhow::Result;
use audit_chain_cli::{init_tracing, run_cli, Cli};
use clap::Parser;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    run_cli(cli)
}
