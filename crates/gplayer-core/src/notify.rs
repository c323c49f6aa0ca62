//! Host-facing event surface and error classification.

use crossbeam_channel::Sender;
use gplayer_types::{ErrorCode, PipelineState, PlayerEvent};

/// Callbacks into the host application.
///
/// Invoked from the worker loop thread only. Every method defaults to a no-op
/// so bindings implement just what they forward.
pub trait HostCallbacks: Send {
    fn on_error(&mut self, _code: ErrorCode) {}
    fn on_time(&mut self, _position_ms: u64) {}
    fn on_play_complete(&mut self) {}
    fn on_play_started(&mut self) {}
    fn on_ready(&mut self) {}
    fn on_prepared(&mut self) {}
    fn on_metadata(&mut self, _text: &str) {}
    fn on_state_changed(&mut self, _from: PipelineState, _to: PipelineState) {}
}

/// Forward every callback as a [`PlayerEvent`] on a channel.
impl HostCallbacks for Sender<PlayerEvent> {
    fn on_error(&mut self, code: ErrorCode) {
        let _ = self.send(PlayerEvent::Error { code });
    }

    fn on_time(&mut self, position_ms: u64) {
        let _ = self.send(PlayerEvent::Time { ms: position_ms });
    }

    fn on_play_complete(&mut self) {
        let _ = self.send(PlayerEvent::PlayComplete);
    }

    fn on_play_started(&mut self) {
        let _ = self.send(PlayerEvent::PlayStarted);
    }

    fn on_ready(&mut self) {
        let _ = self.send(PlayerEvent::Ready);
    }

    fn on_prepared(&mut self) {
        let _ = self.send(PlayerEvent::Prepared);
    }

    fn on_metadata(&mut self, text: &str) {
        let _ = self.send(PlayerEvent::Metadata {
            text: text.to_string(),
        });
    }

    fn on_state_changed(&mut self, from: PipelineState, to: PipelineState) {
        let _ = self.send(PlayerEvent::StateChanged { from, to });
    }
}

/// Dispatches [`PlayerEvent`]s to the registered callbacks.
pub struct Notifier {
    callbacks: Box<dyn HostCallbacks>,
}

impl Notifier {
    pub fn new(callbacks: Box<dyn HostCallbacks>) -> Self {
        Self { callbacks }
    }

    pub fn emit(&mut self, event: PlayerEvent) {
        match &event {
            PlayerEvent::Time { .. } => tracing::trace!(?event, "notify"),
            PlayerEvent::Error { code } if !code.is_advisory() => {
                tracing::error!(code = code.code(), ?code, "player error")
            }
            _ => tracing::debug!(?event, "notify"),
        }
        let cb = self.callbacks.as_mut();
        match event {
            PlayerEvent::Ready => cb.on_ready(),
            PlayerEvent::Prepared => cb.on_prepared(),
            PlayerEvent::PlayStarted => cb.on_play_started(),
            PlayerEvent::PlayComplete => cb.on_play_complete(),
            PlayerEvent::Time { ms } => cb.on_time(ms),
            PlayerEvent::Metadata { text } => cb.on_metadata(&text),
            PlayerEvent::Error { code } => cb.on_error(code),
            PlayerEvent::StateChanged { from, to } => cb.on_state_changed(from, to),
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

/// How a pipeline error message is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Ends the session: target goes to NULL and the code reaches the host.
    Fatal(ErrorCode),
    /// Transient transport failure; retried by the monitor.
    Network,
}

/// Classify a raw pipeline error message.
pub fn classify_error(message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["not found", "404", "no such file", "does not exist"]) {
        ErrorClass::Fatal(ErrorCode::NotFound)
    } else if has(&["codec", "not supported", "missing plugin", "decoder", "unsupported"]) {
        ErrorClass::Fatal(ErrorCode::NotSupported)
    } else if has(&["could not determine type", "wrong type", "stream type", "type not"]) {
        ErrorClass::Fatal(ErrorCode::StreamType)
    } else if has(&[
        "connection",
        "timeout",
        "timed out",
        "could not read",
        "socket",
        "resolve",
        "network",
    ]) {
        ErrorClass::Network
    } else {
        ErrorClass::Fatal(ErrorCode::Generic)
    }
}

/// Split an ICY-style "Artist - Title" string.
///
/// Returns `None` when there is no separator or either side is empty.
pub fn split_stream_title(text: &str) -> Option<(&str, &str)> {
    let (artist, title) = text.split_once(" - ")?;
    let (artist, title) = (artist.trim(), title.trim());
    if artist.is_empty() || title.is_empty() {
        return None;
    }
    Some((artist, title))
}
