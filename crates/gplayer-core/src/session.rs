//! Per-URI playback session state.

use std::path::Path;

use gplayer_types::{AudioFormat, ErrorCode, PipelineState};
use url::Url;

/// Everything the controller knows about the current media load.
///
/// Replaced wholesale on every `set_uri`/`set_url` and on `reset`.
#[derive(Clone, Debug, Default)]
pub struct Session {
    pub uri: Option<String>,
    /// Actual pipeline state, updated from state-change events only.
    pub actual: PipelineState,
    /// State requested by the application.
    pub target: PipelineState,
    /// Last state requested from the engine.
    pub requested: PipelineState,
    pub live: bool,
    pub allow_seek: bool,
    /// PLAYING was reached at least once for this load.
    pub started: bool,
    pub duration_ns: Option<u64>,
    pub position_ns: u64,
    pub network_error: bool,
    pub fast_network: bool,
    pub format: Option<AudioFormat>,
    /// Capacity set by the application; disables adaptive sizing.
    pub buffer_override: Option<u64>,
    pub last_metadata: Option<String>,
    pub volume: f64,
}

impl Session {
    pub fn new(uri: String, allow_seek: bool, fast_network: bool, volume: f64) -> Self {
        Self {
            uri: Some(uri),
            allow_seek,
            fast_network,
            volume,
            ..Self::default()
        }
    }

    pub fn is_prerolled(&self) -> bool {
        self.actual >= PipelineState::Paused
    }

    /// Start threshold for the current network hint.
    pub fn start_percent(&self, slow: u8, fast: u8) -> u8 {
        if self.fast_network { fast } else { slow }
    }
}

/// Turn an application-supplied data source into a pipeline URI.
///
/// `mms://` is refused. Anything carrying a `scheme://` passes through;
/// bare filesystem paths become absolute `file://` URIs.
pub fn normalize_uri(input: &str) -> Result<String, ErrorCode> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ErrorCode::NotFound);
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("mms://") {
        return Err(ErrorCode::NotSupported);
    }
    if lower.contains("://") {
        return Ok(trimmed.to_string());
    }

    let path = Path::new(trimmed);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    file_uri(&absolute)
}

/// Percent-encoded `file://` URI for an absolute path, raw bytes preserved.
fn file_uri(path: &Path) -> Result<String, ErrorCode> {
    Url::from_file_path(path)
        .map(String::from)
        .map_err(|()| ErrorCode::NotFound)
}
