use serde::{Deserialize, Serialize};

/// Execution state of the media pipeline.
///
/// Ordered so that `state >= PipelineState::Paused` reads as "at least prerolled".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// No resources allocated.
    #[default]
    Null,
    /// Graph built and accepting commands, no data flowing.
    Ready,
    /// Data flowing into buffers, clock stopped.
    Paused,
    /// Rendering.
    Playing,
}

impl PipelineState {
    /// Compact encoding used by the lock-free status snapshot.
    pub fn as_u8(self) -> u8 {
        match self {
            PipelineState::Null => 0,
            PipelineState::Ready => 1,
            PipelineState::Paused => 2,
            PipelineState::Playing => 3,
        }
    }

    /// Inverse of [`PipelineState::as_u8`]; unknown values decode as `Null`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Ready,
            2 => PipelineState::Paused,
            3 => PipelineState::Playing,
            _ => PipelineState::Null,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Null => "NULL",
            PipelineState::Ready => "READY",
            PipelineState::Paused => "PAUSED",
            PipelineState::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// Application-visible error and buffering-health codes.
///
/// The integer values are stable and shared with host bindings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unclassified failure.
    Generic,
    /// Resource could not be located.
    NotFound,
    /// Format or codec not supported (missing decoder, unsupported scheme).
    NotSupported,
    /// Stream type could not be determined or did not match the expected media.
    StreamType,
    /// Playback starved for a whole monitor window.
    InsufficientBuffering,
    /// Download is not keeping up with playback.
    BufferSlow,
    /// Download recovered after a slow period.
    BufferFast,
}

impl ErrorCode {
    /// Integer code delivered through `onError`.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Generic => -1,
            ErrorCode::NotFound => -2,
            ErrorCode::NotSupported => -3,
            ErrorCode::StreamType => -4,
            ErrorCode::InsufficientBuffering => 2,
            ErrorCode::BufferSlow => 3,
            ErrorCode::BufferFast => 4,
        }
    }

    /// Map an integer code back to the closed set.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => ErrorCode::Generic,
            -2 => ErrorCode::NotFound,
            -3 => ErrorCode::NotSupported,
            -4 => ErrorCode::StreamType,
            2 => ErrorCode::InsufficientBuffering,
            3 => ErrorCode::BufferSlow,
            4 => ErrorCode::BufferFast,
            _ => return None,
        })
    }

    /// Advisory codes report buffering health and never end the session.
    pub fn is_advisory(self) -> bool {
        matches!(
            self,
            ErrorCode::InsufficientBuffering | ErrorCode::BufferSlow | ErrorCode::BufferFast
        )
    }
}

/// Audio format negotiated at runtime from the decoded stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Bits per sample.
    pub bit_width: u16,
}

impl AudioFormat {
    /// Bytes of raw audio per second, 0 when any field is unknown.
    pub fn bytes_per_second(&self) -> u64 {
        (self.sample_rate as u64)
            .saturating_mul(self.channels as u64)
            .saturating_mul(self.bit_width as u64)
            / 8
    }
}

/// Events delivered to the host application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// Worker loop is running and accepts commands.
    Ready,
    /// A new media URI was accepted and the graph is built.
    Prepared,
    /// Actual state reached PLAYING.
    PlayStarted,
    /// End of stream reached while playback was requested.
    PlayComplete,
    /// Periodic position notification.
    Time { ms: u64 },
    /// Stream metadata (usually "Artist - Title").
    Metadata { text: String },
    /// Classified error or buffering-health code.
    Error { code: ErrorCode },
    /// Actual pipeline state changed.
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
}

/// Read-only snapshot of the player, safe to read from any thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStatus {
    /// Actual pipeline state.
    pub state: PipelineState,
    /// State requested by the application.
    pub target: PipelineState,
    /// Position in milliseconds (0 below PAUSED).
    pub position_ms: u64,
    /// Duration in milliseconds (0 below PAUSED or when unbounded).
    pub duration_ms: u64,
    /// Fill level of the active pre-buffer, 0..=100.
    pub buffering_percent: u8,
    /// `true` when the actual state is PLAYING.
    pub playing: bool,
    /// `true` while a recoverable network error is pending retry.
    pub network_error: bool,
    /// Index of the chain feeding the output (dual-source graphs).
    pub active_chain: Option<u8>,
}
