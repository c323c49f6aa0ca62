//! Buffer health monitor.
//!
//! Sampled once per monitor tick from the worker loop. Keeps the fill-rate
//! history, classifies throughput as slow/fast, counts starvation and decides
//! when the pre-buffer should be resized. It never touches the engine itself;
//! the controller applies whatever the tick reports.

use std::time::Duration;

use gplayer_types::{AudioFormat, PipelineState};

use crate::config::PlayerConfig;
use crate::pipeline::QueueLevel;
use crate::queue::{FillRateWindow, clip_buffer_bytes};

/// Throughput classification, reported only when it changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Throughput {
    Slow,
    Fast,
}

/// Inputs of one monitor tick.
#[derive(Clone, Debug)]
pub struct TickSample {
    /// `None` when the queue query failed this tick.
    pub level: Option<QueueLevel>,
    pub target: PipelineState,
    pub actual: PipelineState,
    pub duration_ns: Option<u64>,
    pub position_ns: Option<u64>,
}

/// What the controller has to act on after a tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Buffering percentage after this tick (previous value if the query failed).
    pub percent: u8,
    pub throughput: Option<Throughput>,
    /// The starvation window closed with a stall while playback was requested.
    pub stalled: bool,
    /// A pending network error should be retried now.
    pub retry_network: bool,
}

#[derive(Debug)]
pub struct BufferMonitor {
    interval: Duration,
    window: FillRateWindow,
    percent: u8,
    ticks: u64,
    window_ticks: u32,
    starved_ticks: u32,
    slow: bool,
    buffering_time: Duration,
    network_ticks: u32,
}

impl BufferMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window: FillRateWindow::new(),
            percent: 0,
            ticks: 0,
            window_ticks: 0,
            starved_ticks: 0,
            slow: false,
            buffering_time: Duration::ZERO,
            network_ticks: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Override the percentage, for engines that report buffering themselves.
    pub fn set_percent(&mut self, percent: u8) {
        self.percent = percent.min(100);
    }

    /// Time spent waiting for PLAYING since the last start.
    pub fn buffering_time(&self) -> Duration {
        self.buffering_time
    }

    pub fn reset_buffering_time(&mut self) {
        self.buffering_time = Duration::ZERO;
    }

    pub fn starved_ticks(&self) -> u32 {
        self.starved_ticks
    }

    pub fn is_slow(&self) -> bool {
        self.slow
    }

    pub fn window(&self) -> &FillRateWindow {
        &self.window
    }

    /// Drop fill history after a seek or capacity change.
    pub fn clear_history(&mut self) {
        self.window.clear();
    }

    pub fn tick(
        &mut self,
        sample: &TickSample,
        network_error: bool,
        config: &PlayerConfig,
    ) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::default();

        if sample.target == PipelineState::Playing && sample.actual < PipelineState::Playing {
            self.buffering_time += self.interval;
        }

        if network_error {
            self.network_ticks += 1;
            if self.network_ticks >= config.network_retry_ticks.max(1) {
                self.network_ticks = 0;
                report.retry_network = true;
            }
        } else {
            self.network_ticks = 0;
        }

        let Some(level) = sample.level else {
            tracing::trace!(tick = self.ticks, "queue level query failed");
            report.percent = self.percent;
            return report;
        };

        self.percent = level.percent();
        report.percent = self.percent;
        self.window.record(level.current_bytes);
        tracing::trace!(
            tick = self.ticks,
            percent = self.percent,
            bytes = level.current_bytes,
            max = level.max_bytes,
            buffers = level.current_buffers,
            "buffer sample"
        );

        if self.ticks % config.throughput_every_ticks.max(1) as u64 == 0 {
            if let Some(slow) = self.estimate_slow(&level, sample, config) {
                if slow != self.slow {
                    self.slow = slow;
                    report.throughput = Some(if slow {
                        Throughput::Slow
                    } else {
                        Throughput::Fast
                    });
                }
            }
        }

        if sample.target == PipelineState::Playing {
            self.window_ticks += 1;
            if self.percent < config.starvation_low_percent {
                self.starved_ticks += 1;
            }
            if self.window_ticks >= config.starvation_window_ticks {
                report.stalled = self.starved_ticks >= config.starvation_trigger_ticks;
                self.window_ticks = 0;
                self.starved_ticks = 0;
            }
        }

        report
    }

    /// `Some(true)` when download cannot keep up, `None` without enough history.
    fn estimate_slow(
        &self,
        level: &QueueLevel,
        sample: &TickSample,
        config: &PlayerConfig,
    ) -> Option<bool> {
        let net_per_tick = self.window.trimmed_mean()?;
        match sample.duration_ns {
            Some(duration) => {
                if self.percent >= 100 || net_per_tick >= 0.0 {
                    return Some(false);
                }
                let ticks_left = level.current_bytes as f64 / -net_per_tick;
                let buffered_ahead = self.interval.as_secs_f64() * ticks_left;
                let position = sample.position_ns.unwrap_or(0);
                let remaining = Duration::from_nanos(duration.saturating_sub(position));
                Some(buffered_ahead < remaining.as_secs_f64())
            }
            None => {
                let secs = self.interval.as_secs_f64();
                if secs <= 0.0 {
                    return None;
                }
                let per_sec = net_per_tick / secs;
                Some(per_sec < config.live_min_bytes_per_sec as f64 && self.percent < 100)
            }
        }
    }

    /// Capacity the pre-buffer should be resized to, if it should change.
    ///
    /// Only while nothing is draining the queue (actual below PLAYING), with a
    /// known duration and format, and when the capacity was not fixed by the
    /// application.
    pub fn resize_target(
        &self,
        current_max: u64,
        actual: PipelineState,
        duration_ns: Option<u64>,
        format: Option<&AudioFormat>,
        overridden: bool,
        config: &PlayerConfig,
    ) -> Option<u64> {
        if overridden || actual >= PipelineState::Playing {
            return None;
        }
        let duration = Duration::from_nanos(duration_ns?);
        let wanted = clip_buffer_bytes(format?, duration, config)?;
        (wanted != current_max).then_some(wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(250);

    fn level(current: u64, max: u64) -> Option<QueueLevel> {
        Some(QueueLevel {
            current_bytes: current,
            max_bytes: max,
            ..QueueLevel::default()
        })
    }

    fn playing(level: Option<QueueLevel>) -> TickSample {
        TickSample {
            level,
            target: PipelineState::Playing,
            actual: PipelineState::Playing,
            duration_ns: None,
            position_ns: None,
        }
    }

    #[test]
    fn percent_follows_queue_fill() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let r = m.tick(&playing(level(250, 1000)), false, &cfg);
        assert_eq!(r.percent, 25);
        let r = m.tick(&playing(level(10, 0)), false, &cfg);
        assert_eq!(r.percent, 0);
    }

    #[test]
    fn failed_query_keeps_previous_percent() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        m.tick(&playing(level(600, 1000)), false, &cfg);
        let r = m.tick(&playing(None), false, &cfg);
        assert_eq!(r.percent, 60);
        assert!(!r.stalled);
    }

    #[test]
    fn stall_raised_once_per_window_then_counter_resets() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let mut stalls = 0;
        for i in 0..20 {
            let fill = if i < 16 { 1 } else { 500 };
            if m.tick(&playing(level(fill, 1000)), false, &cfg).stalled {
                stalls += 1;
                assert_eq!(i, 19);
            }
        }
        assert_eq!(stalls, 1);
        assert_eq!(m.starved_ticks(), 0);
    }

    #[test]
    fn fifteen_starved_ticks_do_not_stall() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let mut stalled = false;
        for i in 0..20 {
            let fill = if i < 15 { 0 } else { 900 };
            stalled |= m.tick(&playing(level(fill, 1000)), false, &cfg).stalled;
        }
        assert!(!stalled);
    }

    #[test]
    fn starvation_ignored_unless_playing_requested() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let sample = TickSample {
            target: PipelineState::Paused,
            actual: PipelineState::Paused,
            ..playing(level(0, 1000))
        };
        for _ in 0..40 {
            assert!(!m.tick(&sample, false, &cfg).stalled);
        }
    }

    #[test]
    fn draining_bounded_stream_reports_slow_then_fast() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let mut sample = playing(None);
        sample.duration_ns = Some(60_000_000_000);
        sample.position_ns = Some(0);

        // drain 100 bytes per tick from 1000: ~2.5 s buffered, 60 s remain
        let mut reports = Vec::new();
        for i in 0..4u64 {
            sample.level = level(1000 - i * 100, 10_000);
            reports.push(m.tick(&sample, false, &cfg));
        }
        assert_eq!(reports[3].throughput, Some(Throughput::Slow));
        assert!(m.is_slow());

        for i in 0..4u64 {
            sample.level = level(1000 + i * 500, 10_000);
            reports.push(m.tick(&sample, false, &cfg));
        }
        assert_eq!(reports[7].throughput, Some(Throughput::Fast));
    }

    #[test]
    fn throughput_reported_only_on_change() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let mut sample = playing(None);
        sample.duration_ns = Some(10_000_000_000);
        for i in 0..16u64 {
            sample.level = level(i * 100, 10_000);
            let r = m.tick(&sample, false, &cfg);
            assert_eq!(r.throughput, None);
        }
    }

    #[test]
    fn live_stream_slow_when_rate_low_and_not_full() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let mut last = None;
        for i in 0..4u64 {
            // 1000 bytes/tick = 4000 bytes/s, under the live minimum
            last = Some(m.tick(&playing(level(i * 1000, 100_000)), false, &cfg));
        }
        assert_eq!(last.unwrap().throughput, Some(Throughput::Slow));
    }

    #[test]
    fn buffering_time_accumulates_while_waiting_to_play() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let sample = TickSample {
            actual: PipelineState::Paused,
            ..playing(level(0, 1000))
        };
        for _ in 0..4 {
            m.tick(&sample, false, &cfg);
        }
        assert_eq!(m.buffering_time(), Duration::from_secs(1));
        m.reset_buffering_time();
        assert_eq!(m.buffering_time(), Duration::ZERO);
    }

    #[test]
    fn network_retry_every_configured_ticks() {
        let cfg = PlayerConfig::default();
        let mut m = BufferMonitor::new(TICK);
        let retries: Vec<bool> = (0..8)
            .map(|_| m.tick(&playing(None), true, &cfg).retry_network)
            .collect();
        assert_eq!(
            retries,
            vec![false, false, false, true, false, false, false, true]
        );
    }

    #[test]
    fn resize_only_before_playing_and_without_override() {
        let cfg = PlayerConfig::default();
        let m = BufferMonitor::new(TICK);
        let fmt = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
            bit_width: 16,
        };
        let ten_s = Some(10_000_000_000);
        assert_eq!(
            m.resize_target(4_194_304, PipelineState::Paused, ten_s, Some(&fmt), false, &cfg),
            Some(1_764_000)
        );
        assert_eq!(
            m.resize_target(1_764_000, PipelineState::Paused, ten_s, Some(&fmt), false, &cfg),
            None
        );
        assert_eq!(
            m.resize_target(4_194_304, PipelineState::Playing, ten_s, Some(&fmt), false, &cfg),
            None
        );
        assert_eq!(
            m.resize_target(4_194_304, PipelineState::Paused, ten_s, Some(&fmt), true, &cfg),
            None
        );
        assert_eq!(
            m.resize_target(4_194_304, PipelineState::Paused, None, Some(&fmt), false, &cfg),
            None
        );
    }
}
