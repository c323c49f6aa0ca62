//! Worker loop and the thread-safe handle the host talks to.
//!
//! All graph mutation happens on one dedicated thread. Host calls are turned
//! into [`PlayerCommand`]s; pipeline events, the monitor tick, the failover
//! tick, the position-notify tick and the seek throttle timer are multiplexed
//! with `crossbeam_channel::select!`, so none of them ever interleave.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use gplayer_types::PlayerStatus;

use crate::config::PlayerConfig;
use crate::controller::Player;
use crate::notify::HostCallbacks;
use crate::pipeline::PipelineEngine;
use crate::status::PlayerStatusState;

/// Commands accepted by the worker thread.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    SetUri { uri: String, seekable: bool },
    SetUrl { url: String, seekable: bool },
    Play,
    Pause,
    Stop,
    SeekTo { ms: u64 },
    /// 0 disables position notifications.
    SetNotifyInterval { ms: u64 },
    SetVolume { left: f64, right: f64 },
    SetBufferSize { bytes: u64 },
    Reset,
    NetworkChanged { fast: bool },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("invalid player configuration: {0}")]
    Config(String),
    #[error("failed to spawn player worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("player worker is not running")]
    Closed,
}

/// Handle for sending commands to the worker and reading its status.
///
/// Dropping the handle stops the worker and waits for it to exit.
#[derive(Debug)]
pub struct PlayerHandle {
    cmd_tx: Sender<PlayerCommand>,
    status: Arc<PlayerStatusState>,
    join: Option<JoinHandle<()>>,
}

impl PlayerHandle {
    pub fn send(&self, cmd: PlayerCommand) -> Result<(), PlayerError> {
        self.cmd_tx.send(cmd).map_err(|_| PlayerError::Closed)
    }

    pub fn set_uri(&self, uri: &str, seekable: bool) -> Result<(), PlayerError> {
        self.send(PlayerCommand::SetUri {
            uri: uri.to_string(),
            seekable,
        })
    }

    pub fn set_url(&self, url: &str, seekable: bool) -> Result<(), PlayerError> {
        self.send(PlayerCommand::SetUrl {
            url: url.to_string(),
            seekable,
        })
    }

    pub fn play(&self) -> Result<(), PlayerError> {
        self.send(PlayerCommand::Play)
    }

    pub fn pause(&self) -> Result<(), PlayerError> {
        self.send(PlayerCommand::Pause)
    }

    pub fn stop(&self) -> Result<(), PlayerError> {
        self.send(PlayerCommand::Stop)
    }

    pub fn seek_to(&self, ms: u64) -> Result<(), PlayerError> {
        self.send(PlayerCommand::SeekTo { ms })
    }

    pub fn set_notify_interval(&self, ms: u64) -> Result<(), PlayerError> {
        self.send(PlayerCommand::SetNotifyInterval { ms })
    }

    pub fn set_volume(&self, left: f64, right: f64) -> Result<(), PlayerError> {
        self.send(PlayerCommand::SetVolume { left, right })
    }

    pub fn set_buffer_size(&self, bytes: u64) -> Result<(), PlayerError> {
        self.send(PlayerCommand::SetBufferSize { bytes })
    }

    pub fn reset(&self) -> Result<(), PlayerError> {
        self.send(PlayerCommand::Reset)
    }

    pub fn network_changed(&self, fast: bool) -> Result<(), PlayerError> {
        self.send(PlayerCommand::NetworkChanged { fast })
    }

    pub fn position_ms(&self) -> u64 {
        self.status.position_ms()
    }

    pub fn duration_ms(&self) -> u64 {
        self.status.duration_ms()
    }

    pub fn is_playing(&self) -> bool {
        self.status.is_playing()
    }

    pub fn status(&self) -> PlayerStatus {
        self.status.snapshot()
    }

    /// Stop the worker and wait for it to drain and exit.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        let _ = self.cmd_tx.send(PlayerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("player worker panicked");
            }
        }
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Spawn the worker thread driving `engine`.
pub fn spawn_player<E: PipelineEngine + 'static>(
    engine: E,
    config: PlayerConfig,
    callbacks: Box<dyn HostCallbacks>,
) -> Result<PlayerHandle, PlayerError> {
    config.validate().map_err(PlayerError::Config)?;
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    let status = PlayerStatusState::shared();
    let worker_status = status.clone();
    let join = std::thread::Builder::new()
        .name("gplayer-worker".to_string())
        .spawn(move || worker_main(engine, config, callbacks, cmd_rx, worker_status))?;
    Ok(PlayerHandle {
        cmd_tx,
        status,
        join: Some(join),
    })
}

fn worker_main<E: PipelineEngine>(
    engine: E,
    config: PlayerConfig,
    callbacks: Box<dyn HostCallbacks>,
    cmd_rx: Receiver<PlayerCommand>,
    status: Arc<PlayerStatusState>,
) {
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let monitor = crossbeam_channel::tick(config.monitor_interval());
    let failover = if config.dual_source {
        crossbeam_channel::tick(config.failover_interval())
    } else {
        crossbeam_channel::never()
    };
    let mut notify: Receiver<Instant> = crossbeam_channel::never();

    let mut player = Player::new(engine, config, callbacks, event_tx);
    tracing::info!("player worker started");
    player.signal_ready();
    status.publish(&player.status());

    loop {
        let seek_timer = match player.seek_deadline() {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        };
        let mut notify_change = None;
        crossbeam_channel::select! {
            recv(cmd_rx) -> msg => match msg {
                Ok(PlayerCommand::Shutdown) | Err(_) => break,
                Ok(PlayerCommand::SetNotifyInterval { ms }) => notify_change = Some(ms),
                Ok(cmd) => apply_command(&mut player, cmd, Instant::now()),
            },
            recv(event_rx) -> ev => {
                if let Ok(ev) = ev {
                    player.handle_event(ev, Instant::now());
                }
            }
            recv(monitor) -> _ => player.on_monitor_tick(),
            recv(failover) -> _ => player.on_failover_tick(),
            recv(notify) -> _ => player.on_time_tick(),
            recv(seek_timer) -> _ => player.on_seek_timer(Instant::now()),
        }
        if let Some(ms) = notify_change {
            tracing::debug!(ms, "notify interval");
            notify = if ms == 0 {
                crossbeam_channel::never()
            } else {
                crossbeam_channel::tick(Duration::from_millis(ms))
            };
        }
        status.publish(&player.status());
    }

    player.shutdown();
    status.clear();
    tracing::info!("player worker stopped");
}

fn apply_command<E: PipelineEngine>(player: &mut Player<E>, cmd: PlayerCommand, now: Instant) {
    tracing::debug!(?cmd, "player command");
    match cmd {
        PlayerCommand::SetUri { uri, seekable } => player.set_uri(&uri, seekable),
        PlayerCommand::SetUrl { url, seekable } => player.set_url(&url, seekable),
        PlayerCommand::Play => player.play(),
        PlayerCommand::Pause => player.pause(),
        PlayerCommand::Stop => player.stop(),
        PlayerCommand::SeekTo { ms } => player.seek_to(ms, now),
        PlayerCommand::SetVolume { left, right } => player.set_volume(left, right),
        PlayerCommand::SetBufferSize { bytes } => player.set_buffer_size(bytes),
        PlayerCommand::Reset => player.reset(),
        PlayerCommand::NetworkChanged { fast } => player.network_changed(fast),
        // handled by the loop
        PlayerCommand::SetNotifyInterval { .. } | PlayerCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use gplayer_types::{PipelineState, PlayerEvent};

    use super::*;
    use crate::pipeline::ChainId;
    use crate::pipeline::sim::SimulatedEngine;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_config() -> PlayerConfig {
        PlayerConfig {
            monitor_interval_ms: 10,
            failover_interval_ms: 10,
            seek_min_delay_ms: 50,
            ..PlayerConfig::default()
        }
    }

    fn wait_for(rx: &Receiver<PlayerEvent>, wanted: &PlayerEvent) -> Vec<PlayerEvent> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(ev) => {
                    let hit = ev == *wanted;
                    seen.push(ev);
                    if hit {
                        return seen;
                    }
                }
                Err(_) => break,
            }
        }
        panic!("did not see {wanted:?}, got {seen:?}");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = PlayerConfig {
            monitor_interval_ms: 0,
            ..PlayerConfig::default()
        };
        let (tx, _rx) = crossbeam_channel::unbounded::<PlayerEvent>();
        let err = spawn_player(SimulatedEngine::new(), cfg, Box::new(tx)).unwrap_err();
        assert!(matches!(err, PlayerError::Config(_)));
    }

    #[test]
    fn plays_through_worker_loop() {
        let engine = SimulatedEngine::new();
        let control = engine.control();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = spawn_player(engine, fast_config(), Box::new(tx)).unwrap();
        wait_for(&rx, &PlayerEvent::Ready);

        handle.set_uri("http://example.com/a.ogg", false).unwrap();
        wait_for(&rx, &PlayerEvent::Prepared);
        control.set_fill_percent(ChainId::Primary, 100);
        handle.play().unwrap();
        wait_for(&rx, &PlayerEvent::PlayStarted);

        let deadline = Instant::now() + WAIT;
        while !handle.is_playing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_playing());
        assert_eq!(handle.status().target, PipelineState::Playing);
        handle.shutdown();
    }

    #[test]
    fn notify_interval_drives_time_events() {
        let engine = SimulatedEngine::new();
        let control = engine.control();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = spawn_player(engine, fast_config(), Box::new(tx)).unwrap();
        handle.set_uri("/tmp/clip.wav", false).unwrap();
        handle.pause().unwrap();
        wait_for(
            &rx,
            &PlayerEvent::StateChanged {
                from: PipelineState::Ready,
                to: PipelineState::Paused,
            },
        );
        control.set_position_ns(1_000_000_000);
        handle.set_notify_interval(10).unwrap();
        wait_for(&rx, &PlayerEvent::Time { ms: 1_000 });
    }

    #[test]
    fn dropping_handle_stops_worker() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = spawn_player(SimulatedEngine::new(), fast_config(), Box::new(tx)).unwrap();
        wait_for(&rx, &PlayerEvent::Ready);
        drop(handle);
        // the worker owned the only sender; once it exits the channel closes
        while rx.recv_timeout(WAIT).is_ok() {}
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn throttled_seeks_execute_latest_on_timer() {
        let engine = SimulatedEngine::new();
        let control = engine.control();
        let (tx, rx) = crossbeam_channel::unbounded();
        let cfg = PlayerConfig {
            seek_min_delay_ms: 300,
            ..fast_config()
        };
        let handle = spawn_player(engine, cfg, Box::new(tx)).unwrap();
        handle.set_uri("http://example.com/a.ogg", true).unwrap();
        handle.pause().unwrap();
        wait_for(
            &rx,
            &PlayerEvent::StateChanged {
                from: PipelineState::Ready,
                to: PipelineState::Paused,
            },
        );
        handle.seek_to(1_000).unwrap();
        handle.seek_to(2_000).unwrap();
        handle.seek_to(3_000).unwrap();

        let deadline = Instant::now() + WAIT;
        while control.seeks().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(control.seeks(), vec![1_000_000_000, 3_000_000_000]);
    }
}
