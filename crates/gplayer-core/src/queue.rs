//! Pre-buffer bookkeeping: rolling fill-rate history and capacity sizing.
//!
//! The queue itself lives inside the pipeline engine; this module only keeps
//! what the controller derives from periodic fill samples.

use std::time::Duration;

use gplayer_types::AudioFormat;

use crate::config::PlayerConfig;

/// Number of deltas kept by [`FillRateWindow`].
pub const WINDOW_SLOTS: usize = 5;

/// Fixed-size circular history of per-tick fill deltas (bytes).
///
/// Holds the most recent [`WINDOW_SLOTS`] deltas; older ones are overwritten.
#[derive(Clone, Debug, Default)]
pub struct FillRateWindow {
    deltas: [i64; WINDOW_SLOTS],
    next: usize,
    len: usize,
    last_bytes: Option<u64>,
}

impl FillRateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the fill observed this tick. The first sample only sets the baseline.
    pub fn record(&mut self, current_bytes: u64) {
        if let Some(prev) = self.last_bytes {
            let delta = current_bytes as i64 - prev as i64;
            self.deltas[self.next] = delta;
            self.next = (self.next + 1) % WINDOW_SLOTS;
            self.len = (self.len + 1).min(WINDOW_SLOTS);
        }
        self.last_bytes = Some(current_bytes);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Held deltas, oldest first.
    pub fn deltas(&self) -> Vec<i64> {
        let start = (self.next + WINDOW_SLOTS - self.len) % WINDOW_SLOTS;
        (0..self.len)
            .map(|i| self.deltas[(start + i) % WINDOW_SLOTS])
            .collect()
    }

    /// Mean delta per tick with the smallest and largest sample dropped.
    ///
    /// With fewer than three samples nothing is dropped. `None` when empty.
    pub fn trimmed_mean(&self) -> Option<f64> {
        let mut values = self.deltas();
        if values.is_empty() {
            return None;
        }
        if values.len() >= 3 {
            values.sort_unstable();
            values.pop();
            values.remove(0);
        }
        let sum: i64 = values.iter().sum();
        Some(sum as f64 / values.len() as f64)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Capacity matching the raw size of a whole clip.
///
/// `None` when the format is unknown or the clip is too large to hold in
/// memory (the caller keeps its default capacity). Small clips are rounded up
/// to `small_buffer_bytes`.
pub fn clip_buffer_bytes(
    format: &AudioFormat,
    duration: Duration,
    config: &PlayerConfig,
) -> Option<u64> {
    let per_sec = format.bytes_per_second();
    if per_sec == 0 || duration.is_zero() {
        return None;
    }
    let bytes = (per_sec as u128 * duration.as_millis() / 1000) as u64;
    if bytes > config.adaptive_max_bytes {
        return None;
    }
    Some(bytes.max(config.small_buffer_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cd_format() -> AudioFormat {
        AudioFormat {
            sample_rate: 44_100,
            channels: 2,
            bit_width: 16,
        }
    }

    #[test]
    fn first_sample_sets_baseline_only() {
        let mut w = FillRateWindow::new();
        w.record(100);
        assert!(w.is_empty());
        assert_eq!(w.trimmed_mean(), None);
        w.record(150);
        assert_eq!(w.deltas(), vec![50]);
    }

    #[test]
    fn window_keeps_five_most_recent_deltas() {
        let mut w = FillRateWindow::new();
        w.record(0);
        for i in 1..=7u64 {
            w.record(i * 10 + i);
        }
        // fills 11,22,...,77
        assert_eq!(w.len(), WINDOW_SLOTS);
        assert_eq!(w.deltas(), vec![11, 11, 11, 11, 11]);
    }

    #[test]
    fn wrap_preserves_chronological_order() {
        let mut w = FillRateWindow::new();
        let fills = [0u64, 1, 3, 6, 10, 15, 21];
        for f in fills {
            w.record(f);
        }
        assert_eq!(w.deltas(), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn trimmed_mean_drops_extremes() {
        let mut w = FillRateWindow::new();
        for f in [1000u64, 1000, 1100, 1150, 2150, 2150] {
            w.record(f);
        }
        // deltas 0,100,50,1000,0 -> drop 0 and 1000 -> (0+100+50)/3
        assert_eq!(w.trimmed_mean(), Some(50.0));
    }

    #[test]
    fn trimmed_mean_with_two_samples_is_plain_mean() {
        let mut w = FillRateWindow::new();
        for f in [100u64, 50, 150] {
            w.record(f);
        }
        assert_eq!(w.trimmed_mean(), Some(25.0));
    }

    #[test]
    fn clip_size_follows_format_and_duration() {
        let cfg = PlayerConfig::default();
        let bytes = clip_buffer_bytes(&cd_format(), Duration::from_secs(10), &cfg);
        assert_eq!(bytes, Some(1_764_000));
    }

    #[test]
    fn tiny_clips_round_up_to_small_buffer() {
        let cfg = PlayerConfig::default();
        let bytes = clip_buffer_bytes(&cd_format(), Duration::from_millis(500), &cfg);
        assert_eq!(bytes, Some(cfg.small_buffer_bytes));
    }

    #[test]
    fn long_clips_and_unknown_format_keep_default() {
        let cfg = PlayerConfig::default();
        assert_eq!(
            clip_buffer_bytes(&cd_format(), Duration::from_secs(600), &cfg),
            None
        );
        assert_eq!(
            clip_buffer_bytes(&AudioFormat::default(), Duration::from_secs(5), &cfg),
            None
        );
    }
}
