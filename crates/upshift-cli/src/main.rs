mod config;
mod dispatch;
mod render;

use anyhow::Result;
use clap::Parser;

use dispatch::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
