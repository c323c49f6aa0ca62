use std::time::Duration;

use serde::Deserialize;

/// Tuning parameters for buffering, seeking and failover.
///
/// Every threshold here is a policy knob. Loaded from TOML by the CLI; missing
/// keys fall back to [`PlayerConfig::default`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    /// Buffer health monitor period.
    pub monitor_interval_ms: u64,
    /// Period of the dual-source failover worker tick.
    pub failover_interval_ms: u64,
    /// Minimum distance between two executed seeks.
    pub seek_min_delay_ms: u64,
    /// Fill percentage under which a tick counts as starved.
    pub starvation_low_percent: u8,
    /// Length of the starvation evaluation window, in ticks.
    pub starvation_window_ticks: u32,
    /// Starved ticks within one window that raise a stall.
    pub starvation_trigger_ticks: u32,
    /// Throughput is re-estimated every this many ticks.
    pub throughput_every_ticks: u32,
    /// Fill needed before PLAYING on slow/default networks.
    pub start_percent_slow: u8,
    /// Fill needed before PLAYING when the fast-network hint is set.
    pub start_percent_fast: u8,
    /// Upper bound on how long `play()` waits for the fill threshold.
    pub max_start_wait_ms: u64,
    /// Steady-state pre-buffer capacity.
    pub default_buffer_bytes: u64,
    /// Smallest capacity adaptive sizing will choose.
    pub small_buffer_bytes: u64,
    /// Clips whose raw size exceeds this keep the default capacity.
    pub adaptive_max_bytes: u64,
    /// Low watermark applied to every pre-buffer.
    pub low_watermark_percent: u8,
    /// Unbounded streams below this net fill rate are reported slow.
    pub live_min_bytes_per_sec: u64,
    /// Ticks between retries while a network error is pending.
    pub network_retry_ticks: u32,
    /// Build two redundant source chains behind a selector.
    pub dual_source: bool,
    /// Active-chain fill under which a failover tick counts as starved.
    pub failover_low_percent: u8,
    /// Standby fill needed before it may take over.
    pub failover_ready_percent: u8,
    /// Fill of the new active chain needed to resume after a swap.
    pub failover_resume_percent: u8,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 250,
            failover_interval_ms: 250,
            seek_min_delay_ms: 500,
            starvation_low_percent: 5,
            starvation_window_ticks: 20,
            starvation_trigger_ticks: 16,
            throughput_every_ticks: 4,
            start_percent_slow: 100,
            start_percent_fast: 50,
            max_start_wait_ms: 8_000,
            default_buffer_bytes: 4_194_304,
            small_buffer_bytes: 370_000,
            adaptive_max_bytes: 33_554_432,
            low_watermark_percent: 25,
            live_min_bytes_per_sec: 16_000,
            network_retry_ticks: 4,
            dual_source: false,
            failover_low_percent: 50,
            failover_ready_percent: 50,
            failover_resume_percent: 25,
        }
    }
}

impl PlayerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn failover_interval(&self) -> Duration {
        Duration::from_millis(self.failover_interval_ms)
    }

    pub fn seek_min_delay(&self) -> Duration {
        Duration::from_millis(self.seek_min_delay_ms)
    }

    pub fn max_start_wait(&self) -> Duration {
        Duration::from_millis(self.max_start_wait_ms)
    }

    /// Reject configurations the worker loop cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.monitor_interval_ms == 0 {
            return Err("monitor_interval_ms must be > 0".to_string());
        }
        if self.dual_source && self.failover_interval_ms == 0 {
            return Err("failover_interval_ms must be > 0".to_string());
        }
        if self.starvation_window_ticks == 0 {
            return Err("starvation_window_ticks must be > 0".to_string());
        }
        if self.starvation_trigger_ticks > self.starvation_window_ticks {
            return Err(format!(
                "starvation_trigger_ticks ({}) exceeds starvation_window_ticks ({})",
                self.starvation_trigger_ticks, self.starvation_window_ticks
            ));
        }
        if self.throughput_every_ticks == 0 {
            return Err("throughput_every_ticks must be > 0".to_string());
        }
        for (name, value) in [
            ("start_percent_slow", self.start_percent_slow),
            ("start_percent_fast", self.start_percent_fast),
            ("low_watermark_percent", self.low_watermark_percent),
            ("failover_low_percent", self.failover_low_percent),
            ("failover_ready_percent", self.failover_ready_percent),
            ("failover_resume_percent", self.failover_resume_percent),
        ] {
            if value > 100 {
                return Err(format!("{name} must be <= 100"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PlayerConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_monitor_interval() {
        let cfg = PlayerConfig {
            monitor_interval_ms: 0,
            ..PlayerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_trigger_above_window() {
        let cfg = PlayerConfig {
            starvation_window_ticks: 10,
            starvation_trigger_ticks: 11,
            ..PlayerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("starvation_trigger_ticks"));
    }

    #[test]
    fn validate_rejects_percent_over_100() {
        let cfg = PlayerConfig {
            start_percent_fast: 101,
            ..PlayerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn durations_follow_millisecond_fields() {
        let cfg = PlayerConfig::default();
        assert_eq!(cfg.monitor_interval(), Duration::from_millis(250));
        assert_eq!(cfg.seek_min_delay(), Duration::from_millis(500));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: PlayerConfig = toml::from_str(
            r#"
            dual_source = true
            start_percent_fast = 40
            "#,
        )
        .unwrap();
        assert!(cfg.dual_source);
        assert_eq!(cfg.start_percent_fast, 40);
        assert_eq!(cfg.default_buffer_bytes, 4_194_304);
        assert!(cfg.validate().is_ok());
    }
}
