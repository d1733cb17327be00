use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = mathquest_progress_cli::Cli::parse();
    mathquest_progress_cli::run_cli(cli)
}
