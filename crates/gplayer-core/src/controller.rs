//! Playback state controller.
//!
//! [`Player`] owns the engine, the current graph and the session, and is driven
//! exclusively from the worker loop: host commands, pipeline events and timer
//! ticks all end up in one of its methods. Actual state only changes when the
//! engine reports it; commands merely issue requests.

use std::time::Instant;

use crossbeam_channel::Sender;
use gplayer_types::{ErrorCode, PipelineState, PlayerEvent, PlayerStatus};

use crate::config::PlayerConfig;
use crate::failover::{FailoverCoordinator, FailoverOutcome};
use crate::graph::{Graph, VOLUME, build_graph};
use crate::monitor::{BufferMonitor, Throughput, TickSample};
use crate::notify::{ErrorClass, HostCallbacks, Notifier, classify_error, split_stream_title};
use crate::pipeline::{
    ChainId, EventSink, GraphEvent, PipelineEngine, PipelineEvent, StageProperty, StateChange,
    ms_to_ns, ns_to_ms,
};
use crate::seek::{SeekDecision, SeekThrottle};
use crate::session::{Session, normalize_uri};

/// Graph plus the per-graph controllers that are rebuilt with it.
#[derive(Debug)]
struct LiveGraph {
    graph: Graph,
    monitor: BufferMonitor,
    failover: Option<FailoverCoordinator>,
}

pub struct Player<E: PipelineEngine> {
    engine: E,
    config: PlayerConfig,
    notifier: Notifier,
    event_tx: Sender<GraphEvent>,
    generation: u64,
    graph: Option<LiveGraph>,
    session: Session,
    seek: SeekThrottle,
    fast_network: bool,
    volume: f64,
}

impl<E: PipelineEngine> Player<E> {
    pub fn new(
        engine: E,
        config: PlayerConfig,
        callbacks: Box<dyn HostCallbacks>,
        event_tx: Sender<GraphEvent>,
    ) -> Self {
        let seek = SeekThrottle::new(config.seek_min_delay());
        Self {
            engine,
            config,
            notifier: Notifier::new(callbacks),
            event_tx,
            generation: 0,
            graph: None,
            session: Session::default(),
            seek,
            fast_network: false,
            volume: 1.0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    pub fn buffering_percent(&self) -> u8 {
        self.graph.as_ref().map(|g| g.monitor.percent()).unwrap_or(0)
    }

    pub fn active_chain(&self) -> Option<ChainId> {
        self.graph
            .as_ref()
            .and_then(|g| g.failover.as_ref())
            .map(|f| f.active())
    }

    pub fn failover(&self) -> Option<&FailoverCoordinator> {
        self.graph.as_ref().and_then(|g| g.failover.as_ref())
    }

    /// Position in ms; 0 while the pipeline has not prerolled.
    pub fn position_ms(&self) -> u64 {
        if !self.session.is_prerolled() {
            return 0;
        }
        ns_to_ms(self.engine.position_ns().unwrap_or(self.session.position_ns))
    }

    /// Duration in ms; 0 while not prerolled or when unbounded.
    pub fn duration_ms(&self) -> u64 {
        if !self.session.is_prerolled() {
            return 0;
        }
        self.session
            .duration_ns
            .or_else(|| self.engine.duration_ns())
            .map(ns_to_ms)
            .unwrap_or(0)
    }

    pub fn is_playing(&self) -> bool {
        self.session.actual == PipelineState::Playing
    }

    pub fn status(&self) -> PlayerStatus {
        PlayerStatus {
            state: self.session.actual,
            target: self.session.target,
            position_ms: self.position_ms(),
            duration_ms: self.duration_ms(),
            buffering_percent: self.buffering_percent(),
            playing: self.is_playing(),
            network_error: self.session.network_error,
            active_chain: self.active_chain().map(|c| c.index() as u8),
        }
    }

    pub fn signal_ready(&mut self) {
        self.emit(PlayerEvent::Ready);
    }

    fn emit(&mut self, event: PlayerEvent) {
        self.notifier.emit(event);
    }

    fn request_state(&mut self, state: PipelineState) {
        self.session.requested = state;
        match self.engine.set_state(state) {
            Ok(StateChange::NoPreroll) => {
                if !self.session.live {
                    tracing::info!(%state, "live source, prerolling disabled");
                }
                self.session.live = true;
            }
            Ok(change) => tracing::debug!(%state, ?change, "state requested"),
            Err(err) => tracing::warn!(%state, error = %err, "state request failed"),
        }
    }

    /// End the session after an unrecoverable failure.
    fn fail(&mut self, code: ErrorCode) {
        self.session.target = PipelineState::Null;
        if self.graph.is_some() {
            self.request_state(PipelineState::Null);
        }
        self.emit(PlayerEvent::Error { code });
    }

    // ---- commands -------------------------------------------------------

    /// Load a data source; bare paths are converted to `file://` URIs.
    pub fn set_uri(&mut self, input: &str, seekable: bool) {
        match normalize_uri(input) {
            Ok(uri) => self.load(uri, seekable),
            Err(code) => self.reject_source(input, code),
        }
    }

    /// Load a URL as-is.
    pub fn set_url(&mut self, url: &str, seekable: bool) {
        if url.trim().to_ascii_lowercase().starts_with("mms://") {
            self.reject_source(url, ErrorCode::NotSupported);
            return;
        }
        self.load(url.trim().to_string(), seekable);
    }

    fn reject_source(&mut self, input: &str, code: ErrorCode) {
        tracing::warn!(uri = %input, ?code, "data source rejected");
        self.drop_graph();
        self.session = Session::default();
        self.emit(PlayerEvent::Error { code });
    }

    fn drop_graph(&mut self) {
        self.engine.teardown();
        self.graph = None;
        self.generation += 1;
        self.seek.reset();
    }

    fn load(&mut self, uri: String, seekable: bool) {
        self.generation += 1;
        self.seek.reset();
        self.graph = None;
        self.session = Session::new(uri.clone(), seekable, self.fast_network, self.volume);

        let sink = EventSink::new(self.event_tx.clone(), self.generation);
        let buffer = self.config.default_buffer_bytes;
        match build_graph(&mut self.engine, &uri, &self.config, buffer, sink) {
            Ok(graph) => {
                tracing::info!(uri = %uri, seekable, live = graph.live, "data source set");
                self.session.live = graph.live;
                self.session.target = PipelineState::Ready;
                self.session.requested = PipelineState::Ready;
                let failover = graph.spec.is_dual().then(FailoverCoordinator::new);
                self.graph = Some(LiveGraph {
                    graph,
                    monitor: BufferMonitor::new(self.config.monitor_interval()),
                    failover,
                });
                self.apply_volume();
                self.emit(PlayerEvent::Prepared);
            }
            Err(err) => {
                tracing::error!(uri = %uri, error = %err, "graph build failed");
                self.session.target = PipelineState::Null;
                self.emit(PlayerEvent::Error {
                    code: ErrorCode::Generic,
                });
            }
        }
    }

    pub fn play(&mut self) {
        if self.graph.is_none() {
            tracing::debug!("play ignored, no data source");
            return;
        }
        self.session.target = PipelineState::Playing;
        self.advance();
    }

    pub fn pause(&mut self) {
        if self.graph.is_none() {
            return;
        }
        let already = self.session.actual == PipelineState::Paused
            || self.session.requested == PipelineState::Paused;
        if self.session.target == PipelineState::Paused && already {
            tracing::debug!("pause ignored, already paused");
            return;
        }
        self.session.target = PipelineState::Paused;
        self.request_state(PipelineState::Paused);
    }

    pub fn stop(&mut self) {
        self.pause();
    }

    pub fn seek_to(&mut self, ms: u64, now: Instant) {
        if self.graph.is_none() {
            return;
        }
        let decision = self.seek.request(
            ms_to_ns(ms),
            self.session.actual,
            self.session.allow_seek,
            self.session.live,
            now,
        );
        match decision {
            SeekDecision::Execute(pos) => self.execute_seek(pos),
            other => tracing::debug!(ms, ?other, "seek not executed now"),
        }
    }

    fn execute_seek(&mut self, position_ns: u64) {
        match self.engine.seek(position_ns) {
            Ok(()) => {
                tracing::info!(position_ms = ns_to_ms(position_ns), "seek");
                self.session.position_ns = position_ns;
                if let Some(live) = self.graph.as_mut() {
                    live.monitor.clear_history();
                }
            }
            Err(err) => tracing::warn!(error = %err, "seek failed"),
        }
    }

    /// Deadline of a coalesced seek waiting for the throttle.
    pub fn seek_deadline(&self) -> Option<std::time::Instant> {
        self.seek.deadline()
    }

    pub fn on_seek_timer(&mut self, now: Instant) {
        if let Some(pos) = self.seek.on_timer(now) {
            self.execute_seek(pos);
        }
    }

    /// Output gain is the mean of both channels, clamped to `0.0..=10.0`.
    pub fn set_volume(&mut self, left: f64, right: f64) {
        let mean = (left + right) / 2.0;
        if !mean.is_finite() {
            tracing::warn!(left, right, "volume ignored");
            return;
        }
        self.volume = mean.clamp(0.0, 10.0);
        self.session.volume = self.volume;
        self.apply_volume();
    }

    fn apply_volume(&mut self) {
        if self.graph.is_none() {
            return;
        }
        if let Err(err) = self
            .engine
            .set_property(VOLUME, StageProperty::Volume(self.volume))
        {
            tracing::warn!(error = %err, "could not set volume");
        }
    }

    /// Fix the pre-buffer capacity for this session; 0 restores adaptive sizing.
    pub fn set_buffer_size(&mut self, bytes: u64) {
        let capacity = if bytes == 0 {
            self.session.buffer_override = None;
            self.config.default_buffer_bytes
        } else {
            self.session.buffer_override = Some(bytes);
            bytes
        };
        tracing::info!(bytes = capacity, fixed = bytes != 0, "buffer size set");
        self.resize_prebuffers(capacity);
    }

    fn resize_prebuffers(&mut self, bytes: u64) {
        let Some(live) = self.graph.as_mut() else {
            return;
        };
        for chain in &live.graph.spec.chains {
            if let Err(err) = self
                .engine
                .set_property(&chain.prebuffer, StageProperty::MaxSizeBytes(bytes))
            {
                tracing::warn!(stage = %chain.prebuffer, error = %err, "resize failed");
            }
        }
        live.monitor.clear_history();
    }

    /// Tear everything down and return to the freshly-initialised state.
    pub fn reset(&mut self) {
        tracing::info!("player reset");
        self.drop_graph();
        self.session = Session::default();
        self.emit(PlayerEvent::Ready);
    }

    pub fn network_changed(&mut self, fast: bool) {
        tracing::info!(fast, "network changed");
        self.fast_network = fast;
        self.session.fast_network = fast;
        if self.session.network_error && self.session.target == PipelineState::Playing {
            self.retry_network();
        } else {
            self.advance();
        }
    }

    fn retry_network(&mut self) {
        if self.graph.is_none() {
            return;
        }
        tracing::info!("retrying after network error");
        self.request_state(PipelineState::Playing);
    }

    // ---- start gate -----------------------------------------------------

    /// Move the actual state toward a PLAYING target when the buffer allows.
    fn advance(&mut self) {
        let Some(live) = self.graph.as_ref() else {
            return;
        };
        if self.session.target != PipelineState::Playing
            || self.session.requested == PipelineState::Playing
        {
            return;
        }
        if live.failover.as_ref().is_some_and(|f| f.is_pending()) {
            return;
        }
        let threshold = self
            .session
            .start_percent(self.config.start_percent_slow, self.config.start_percent_fast);
        let percent = live.monitor.percent();
        let waited = live.monitor.buffering_time();
        // seekable sources skip the fill wait on the first start only
        let open = percent >= threshold
            || (self.session.allow_seek && !self.session.started)
            || waited >= self.config.max_start_wait();
        if open {
            tracing::info!(
                percent,
                threshold,
                waited_ms = waited.as_millis() as u64,
                "start gate open"
            );
            self.request_state(PipelineState::Playing);
        } else if self.session.requested < PipelineState::Paused {
            self.request_state(PipelineState::Paused);
        }
    }

    // ---- pipeline events ------------------------------------------------

    pub fn handle_event(&mut self, event: GraphEvent, now: Instant) {
        let current = self.graph.as_ref().map(|g| g.graph.generation);
        if current != Some(event.generation) {
            tracing::trace!(
                generation = event.generation,
                current = ?current,
                "stale pipeline event dropped"
            );
            return;
        }

        match event.event {
            PipelineEvent::StateChanged { old, new } => self.on_state_changed(old, new, now),
            PipelineEvent::Eos => {
                if self.session.target >= PipelineState::Playing {
                    tracing::info!("end of stream");
                    self.session.target = PipelineState::Paused;
                    self.request_state(PipelineState::Paused);
                    self.emit(PlayerEvent::PlayComplete);
                } else {
                    tracing::warn!(target_state = %self.session.target, "end of stream before playback");
                    self.session.target = PipelineState::Null;
                    self.request_state(PipelineState::Null);
                }
            }
            PipelineEvent::Error { message } => match classify_error(&message) {
                ErrorClass::Fatal(code) => {
                    tracing::error!(message = %message, ?code, "pipeline error");
                    self.fail(code);
                }
                ErrorClass::Network => {
                    tracing::warn!(message = %message, "network error, will retry");
                    self.session.network_error = true;
                }
            },
            PipelineEvent::ClockLost => {
                if self.session.target >= PipelineState::Playing {
                    tracing::info!("clock lost, restarting clock");
                    self.request_state(PipelineState::Paused);
                    self.request_state(PipelineState::Playing);
                }
            }
            PipelineEvent::Buffering { percent } => {
                if !self.session.live {
                    if let Some(live) = self.graph.as_mut() {
                        live.monitor.set_percent(percent);
                    }
                }
                self.advance();
            }
            PipelineEvent::DurationChanged => {
                self.session.duration_ns = self.engine.duration_ns();
            }
            PipelineEvent::Tag { text } => {
                if self.session.last_metadata.as_deref() != Some(text.as_str()) {
                    if let Some((artist, title)) = split_stream_title(&text) {
                        tracing::info!(artist, title, "now playing");
                    }
                    self.session.last_metadata = Some(text.clone());
                    self.emit(PlayerEvent::Metadata { text });
                }
            }
            PipelineEvent::AudioFormat(format) => {
                tracing::debug!(
                    rate = format.sample_rate,
                    channels = format.channels,
                    bits = format.bit_width,
                    "audio format"
                );
                self.session.format = Some(format);
            }
            PipelineEvent::PadLinked { chain } => {
                tracing::debug!(?chain, "source pad linked");
                self.complete_failover(Some(chain));
            }
            PipelineEvent::PadLinkFailed { chain, reason } => {
                tracing::error!(?chain, reason = %reason, "source pad link failed");
                self.fail(ErrorCode::Generic);
            }
        }
    }

    fn on_state_changed(&mut self, old: PipelineState, new: PipelineState, now: Instant) {
        if old == new {
            return;
        }
        tracing::info!(from = %old, to = %new, target_state = %self.session.target, "state changed");
        self.session.actual = new;
        self.emit(PlayerEvent::StateChanged { from: old, to: new });

        if old == PipelineState::Ready && new == PipelineState::Paused {
            if self.session.duration_ns.is_none() {
                self.session.duration_ns = self.engine.duration_ns();
            }
            if let Some(pos) = self.seek.take_desired(now) {
                if self.session.allow_seek && !self.session.live {
                    self.execute_seek(pos);
                }
            }
        }
        if new == PipelineState::Playing {
            self.session.started = true;
            self.session.network_error = false;
            if let Some(live) = self.graph.as_mut() {
                live.monitor.reset_buffering_time();
            }
            self.emit(PlayerEvent::PlayStarted);
        }
        self.advance();
    }

    fn complete_failover(&mut self, linked: Option<ChainId>) {
        let steady = self
            .session
            .buffer_override
            .unwrap_or(self.config.default_buffer_bytes);
        let target = self.session.target;
        let Some(live) = self.graph.as_mut() else {
            return;
        };
        let Some(failover) = live.failover.as_mut() else {
            return;
        };
        if let Some(chain) = linked {
            failover.on_pad_linked(chain);
        }
        let result =
            failover.try_complete(&mut self.engine, &live.graph.spec, target, steady, &self.config);
        match result {
            Ok(true) if target == PipelineState::Playing => {
                self.session.requested = PipelineState::Playing;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "failover completion failed");
                self.fail(ErrorCode::Generic);
            }
        }
    }

    // ---- timers ---------------------------------------------------------

    /// Buffer health monitor tick.
    pub fn on_monitor_tick(&mut self) {
        if self.graph.is_none() {
            return;
        }
        if self.session.is_prerolled() && self.session.duration_ns.is_none() {
            self.session.duration_ns = self.engine.duration_ns();
        }
        let active = self.active_chain().unwrap_or(ChainId::Primary);
        let level = self.engine.queue_level(active);
        let sample = TickSample {
            level,
            target: self.session.target,
            actual: self.session.actual,
            duration_ns: self.session.duration_ns,
            position_ns: self
                .session
                .is_prerolled()
                .then(|| self.engine.position_ns())
                .flatten(),
        };
        let network_error = self.session.network_error;
        let (report, covered, resize) = {
            let Some(live) = self.graph.as_mut() else {
                return;
            };
            let report = live.monitor.tick(&sample, network_error, &self.config);
            let covered = live
                .failover
                .as_ref()
                .is_some_and(|f| f.can_take_over(&self.config));
            let resize = level.and_then(|l| {
                live.monitor.resize_target(
                    l.max_bytes,
                    self.session.actual,
                    self.session.duration_ns,
                    self.session.format.as_ref(),
                    self.session.buffer_override.is_some(),
                    &self.config,
                )
            });
            (report, covered, resize)
        };

        if let Some(throughput) = report.throughput {
            let code = match throughput {
                Throughput::Slow => ErrorCode::BufferSlow,
                Throughput::Fast => ErrorCode::BufferFast,
            };
            tracing::info!(?throughput, percent = report.percent, "throughput changed");
            self.emit(PlayerEvent::Error { code });
        }

        if report.stalled {
            if covered {
                tracing::debug!("stall covered by standby source");
            } else {
                tracing::warn!(percent = report.percent, "playback starved");
                self.emit(PlayerEvent::Error {
                    code: ErrorCode::InsufficientBuffering,
                });
                if self.session.requested == PipelineState::Playing {
                    self.request_state(PipelineState::Paused);
                }
            }
        }

        if report.retry_network && self.session.target == PipelineState::Playing {
            self.retry_network();
        }

        if let Some(bytes) = resize {
            tracing::info!(bytes, "adaptive pre-buffer size");
            self.resize_prebuffers(bytes);
        }

        self.advance();
    }

    /// Dual-source failover worker tick.
    pub fn on_failover_tick(&mut self) {
        let steady = self
            .session
            .buffer_override
            .unwrap_or(self.config.default_buffer_bytes);
        let (actual, target) = (self.session.actual, self.session.target);
        let Some(live) = self.graph.as_mut() else {
            return;
        };
        let Some(failover) = live.failover.as_mut() else {
            return;
        };
        let result = failover.tick(
            &mut self.engine,
            &live.graph.spec,
            actual,
            target,
            steady,
            &self.config,
        );
        match result {
            Ok(FailoverOutcome::Swapped { from, to }) => {
                tracing::info!(?from, ?to, "standby source activated");
            }
            Ok(FailoverOutcome::Completed) => {
                if target == PipelineState::Playing {
                    self.session.requested = PipelineState::Playing;
                }
            }
            Ok(FailoverOutcome::Idle) => {}
            Err(err) => {
                tracing::error!(error = %err, "failover failed");
                self.fail(ErrorCode::Generic);
            }
        }
    }

    /// Position notification tick.
    pub fn on_time_tick(&mut self) {
        if self.session.is_prerolled() {
            let ms = self.position_ms();
            self.emit(PlayerEvent::Time { ms });
        }
    }

    pub fn shutdown(&mut self) {
        tracing::info!("player shutting down");
        self.engine.teardown();
        self.graph = None;
    }
}

impl<E: PipelineEngine> std::fmt::Debug for Player<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("generation", &self.generation)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
