use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "gplayer", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML file with buffering/failover tuning (defaults when omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play one URI or local path until end of stream, a fatal error or Ctrl-C
    Play {
        /// http(s):// URL, file:// URI or filesystem path
        uri: String,

        /// The source supports seeking (skips the start fill threshold)
        #[arg(long)]
        seekable: bool,

        /// Build two redundant source chains with automatic failover
        #[arg(long)]
        dual: bool,

        /// Use the lower start threshold for fast networks
        #[arg(long)]
        fast_network: bool,

        /// Seek to this position (ms) once playback has started
        #[arg(long)]
        seek_ms: Option<u64>,

        /// Output volume, 1.0 is unity
        #[arg(long, default_value_t = 1.0)]
        volume: f64,

        /// Position report interval in ms (0 disables)
        #[arg(long, default_value_t = 1000)]
        notify_ms: u64,

        /// Run against the in-process simulated pipeline instead of GStreamer
        #[arg(long)]
        simulate: bool,
    },
}
