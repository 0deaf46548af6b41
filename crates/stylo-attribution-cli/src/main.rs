use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    stylo_attribution_cli::init_tracing();
    let cli = stylo_attribution_cli::Cli::parse();
    stylo_attribution_cli::run_cli(cli)
}
