use std::path::PathBuf;

use clap::{Parser, ValueHint, command};

#[derive(Parser, Debug, Clone)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Args {
    #[arg(
        long,
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        default_value = "config.toml",
        help = "Path to the agent configuration file (defaults to config.toml)"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        value_name = "MERCHANT_ID",
        help = "Rebuild orders for this merchant from stored message history before serving"
    )]
    pub restore: Option<String>,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Republish every merchant's stalls and products on startup"
    )]
    pub republish: bool,
}
