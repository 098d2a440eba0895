use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "parley-core")]
#[command(version)]
#[command(about = "Real-time communication server: WebRTC rooms and streams", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/parley-core.toml")]
    pub config: PathBuf,

    /// Listen port (overrides the config file and the PORT env var)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}
