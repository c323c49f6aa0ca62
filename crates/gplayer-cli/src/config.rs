use std::path::Path;

use anyhow::{Context, Result};

pub use gplayer_core::PlayerConfig;

/// Everything `gplayer play` needs for one session.
#[derive(Clone, Debug)]
pub struct PlaySessionConfig {
    pub uri: String,
    pub seekable: bool,
    pub fast_network: bool,
    pub seek_ms: Option<u64>,
    pub volume: f64,
    pub notify_ms: u64,
    pub simulate: bool,
    pub player: PlayerConfig,
}

/// Load player tuning from a TOML file; `None` yields the defaults.
pub fn load_player_config(path: Option<&Path>) -> Result<PlayerConfig> {
    let Some(path) = path else {
        return Ok(PlayerConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: PlayerConfig =
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("gplayer-{}-{name}", std::process::id()));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_path_means_defaults() {
        assert_eq!(load_player_config(None).unwrap(), PlayerConfig::default());
    }

    #[test]
    fn loads_partial_file() {
        let path = write_temp("partial.toml", "monitor_interval_ms = 100\ndual_source = true\n");
        let cfg = load_player_config(Some(&path)).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.monitor_interval_ms, 100);
        assert!(cfg.dual_source);
        assert_eq!(cfg.seek_min_delay_ms, 500);
    }

    #[test]
    fn example_file_matches_defaults() {
        let cfg: PlayerConfig = toml::from_str(include_str!("../gplayer.example.toml")).unwrap();
        assert_eq!(cfg, PlayerConfig::default());
    }

    #[test]
    fn example_file_lists_every_key() {
        let table: toml::Table = toml::from_str(include_str!("../gplayer.example.toml")).unwrap();
        for key in [
            "monitor_interval_ms",
            "failover_interval_ms",
            "seek_min_delay_ms",
            "starvation_low_percent",
            "starvation_window_ticks",
            "starvation_trigger_ticks",
            "throughput_every_ticks",
            "start_percent_slow",
            "start_percent_fast",
            "max_start_wait_ms",
            "default_buffer_bytes",
            "small_buffer_bytes",
            "adaptive_max_bytes",
            "low_watermark_percent",
            "live_min_bytes_per_sec",
            "network_retry_ticks",
            "dual_source",
            "failover_low_percent",
            "failover_ready_percent",
            "failover_resume_percent",
        ] {
            assert!(table.contains_key(key), "{key} missing from example");
        }
        assert_eq!(table.len(), 20);
    }

    #[test]
    fn rejects_invalid_values() {
        let path = write_temp("invalid.toml", "monitor_interval_ms = 0\n");
        let err = load_player_config(Some(&path)).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(format!("{err:#}").contains("monitor_interval_ms"));
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = load_player_config(Some(Path::new("/nonexistent/gplayer.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/gplayer.toml"));
    }
}
