use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = walscope_cli::Cli::parse();
    walscope_cli::run_cli(cli)
}
