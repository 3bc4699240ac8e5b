use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "splittun",
    version,
    about = "Per-process split-tunnel gateway over a TUN adapter"
)]
pub struct Cli {
    /// Configuration file
    #[arg(long, default_value = "/etc/splittun/config.yaml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(long)]
    pub verbose: bool,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}
