//! Seek throttling and deferral.
//!
//! Seeks requested before the pipeline has prerolled are parked and replayed
//! on the READY -> PAUSED transition. Once seekable, seeks closer than the
//! minimum delay to the previous executed one are coalesced: only the latest
//! position is executed, when the delay expires.

use std::time::{Duration, Instant};

use gplayer_types::PipelineState;

/// Outcome of a seek request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekDecision {
    /// Execute now at this position (ns).
    Execute(u64),
    /// Stored until the pipeline reaches PAUSED.
    Deferred,
    /// Stored until the throttle deadline.
    Throttled,
    /// Session cannot seek (live or not permitted).
    Ignored,
}

#[derive(Debug)]
pub struct SeekThrottle {
    min_delay: Duration,
    desired: Option<u64>,
    throttled: Option<u64>,
    last_seek: Option<Instant>,
}

impl SeekThrottle {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            desired: None,
            throttled: None,
            last_seek: None,
        }
    }

    pub fn request(
        &mut self,
        position_ns: u64,
        actual: PipelineState,
        allow_seek: bool,
        live: bool,
        now: Instant,
    ) -> SeekDecision {
        if !allow_seek || live {
            return SeekDecision::Ignored;
        }
        if actual < PipelineState::Paused {
            self.desired = Some(position_ns);
            return SeekDecision::Deferred;
        }
        match self.last_seek {
            Some(last) if now.saturating_duration_since(last) < self.min_delay => {
                self.throttled = Some(position_ns);
                SeekDecision::Throttled
            }
            _ => {
                self.throttled = None;
                self.last_seek = Some(now);
                SeekDecision::Execute(position_ns)
            }
        }
    }

    /// Position parked before preroll; taken on READY -> PAUSED.
    pub fn take_desired(&mut self, now: Instant) -> Option<u64> {
        let pos = self.desired.take()?;
        self.last_seek = Some(now);
        Some(pos)
    }

    pub fn desired(&self) -> Option<u64> {
        self.desired
    }

    /// When the coalesced seek becomes due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.throttled?;
        self.last_seek.map(|last| last + self.min_delay)
    }

    /// Execute the coalesced seek if its deadline has passed.
    pub fn on_timer(&mut self, now: Instant) -> Option<u64> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let pos = self.throttled.take()?;
        self.last_seek = Some(now);
        Some(pos)
    }

    /// Forget pending positions and the last-seek timestamp (new session).
    pub fn reset(&mut self) {
        self.desired = None;
        self.throttled = None;
        self.last_seek = None;
    }
}
