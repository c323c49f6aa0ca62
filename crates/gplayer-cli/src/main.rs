//! gplayer: play one network stream or local file through the buffering
//! controller, printing host events to stdout.
//!
//! ## Modes
//! - default: GStreamer pipeline (requires the `gstreamer` feature).
//! - `--simulate`: in-process pipeline with a modelled network, for exercising
//!   buffering, seeking and failover without media or a sound card.

use anyhow::Result;
use clap::Parser;
use gplayer_cli::cli::{Args, Command};
use gplayer_cli::config::{PlaySessionConfig, load_player_config};
use gplayer_cli::runtime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose {
        "debug,gplayer_core=debug"
    } else {
        "info,gplayer_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut player = load_player_config(args.config.as_deref())?;

    match args.cmd {
        Command::Play {
            uri,
            seekable,
            dual,
            fast_network,
            seek_ms,
            volume,
            notify_ms,
            simulate,
        } => {
            player.dual_source |= dual;
            tracing::info!(uri = %uri, dual = player.dual_source, simulate, "starting session");
            runtime::run_play(PlaySessionConfig {
                uri,
                seekable,
                fast_network,
                seek_ms,
                volume,
                notify_ms,
                simulate,
                player,
            })
        }
    }
}
