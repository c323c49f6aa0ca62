//! Drives one playback session from the terminal.

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, select};
use gplayer_core::{
    PipelineEngine, PlayerEvent, PlayerHandle, SimNetwork, SimulatedEngine, spawn_player,
};

use crate::config::PlaySessionConfig;

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Interrupted,
}

/// Play `config.uri` until end of stream, a fatal error or Ctrl-C.
pub fn run_play(config: PlaySessionConfig) -> Result<()> {
    let engine = make_engine(config.simulate)?;
    let (event_tx, event_rx) = crossbeam_channel::unbounded::<PlayerEvent>();
    let handle = spawn_player(engine, config.player.clone(), Box::new(event_tx))
        .context("start player")?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    handle.set_notify_interval(config.notify_ms)?;
    handle.set_volume(config.volume, config.volume)?;
    handle.network_changed(config.fast_network)?;
    if is_network_url(&config.uri) {
        handle.set_url(&config.uri, config.seekable)?;
    } else {
        handle.set_uri(&config.uri, config.seekable)?;
    }
    handle.play()?;

    let result = pump_events(&handle, &event_rx, &stop_rx, config.seek_ms);
    let status = handle.status();
    handle.shutdown();
    match result? {
        Outcome::Completed => tracing::info!(position_ms = status.position_ms, "playback complete"),
        Outcome::Interrupted => tracing::info!("interrupted"),
    }
    Ok(())
}

fn make_engine(simulate: bool) -> Result<Box<dyn PipelineEngine>> {
    if simulate {
        let engine = SimulatedEngine::new();
        engine.control().set_network(SimNetwork::default());
        return Ok(Box::new(engine));
    }
    #[cfg(feature = "gstreamer")]
    {
        let engine = gplayer_core::GstEngine::new().context("initialise GStreamer")?;
        Ok(Box::new(engine))
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        bail!("built without the `gstreamer` feature; pass --simulate")
    }
}

fn pump_events(
    handle: &PlayerHandle,
    events: &Receiver<PlayerEvent>,
    stop: &Receiver<()>,
    mut pending_seek: Option<u64>,
) -> Result<Outcome> {
    loop {
        select! {
            recv(stop) -> _ => return Ok(Outcome::Interrupted),
            recv(events) -> msg => {
                let Ok(event) = msg else {
                    bail!("player worker exited unexpectedly");
                };
                println!("{}", describe_event(&event, handle.duration_ms()));
                match event {
                    PlayerEvent::PlayStarted => {
                        if let Some(ms) = pending_seek.take() {
                            handle.seek_to(ms)?;
                        }
                    }
                    PlayerEvent::PlayComplete => return Ok(Outcome::Completed),
                    PlayerEvent::Error { code } if !code.is_advisory() => {
                        bail!("playback failed: {code:?} ({})", code.code());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Network URLs skip path normalisation.
fn is_network_url(uri: &str) -> bool {
    let lower = uri.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("mms://")
}

fn describe_event(event: &PlayerEvent, duration_ms: u64) -> String {
    match event {
        PlayerEvent::Ready => "ready".to_string(),
        PlayerEvent::Prepared => "prepared".to_string(),
        PlayerEvent::PlayStarted => "playing".to_string(),
        PlayerEvent::PlayComplete => "end of stream".to_string(),
        PlayerEvent::Time { ms } if duration_ms > 0 => {
            format!("{} / {}", format_ms(*ms), format_ms(duration_ms))
        }
        PlayerEvent::Time { ms } => format_ms(*ms),
        PlayerEvent::Metadata { text } => format!("now playing: {text}"),
        PlayerEvent::Error { code } => format!("error {code:?} ({})", code.code()),
        PlayerEvent::StateChanged { from, to } => format!("state {from} -> {to}"),
    }
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}.{:03}", secs / 60, secs % 60, ms % 1000)
}
