//! Media pipeline engine abstraction.
//!
//! The controller never talks to a multimedia framework directly. It drives an
//! implementation of [`PipelineEngine`], which:
//! - instantiates and links the stages described by a [`GraphSpec`]
//! - reports execution state, position, duration and queue fill on request
//! - posts asynchronous [`PipelineEvent`]s (bus messages, pad negotiation) into
//!   the worker loop through an [`EventSink`]
//!
//! Two engines ship with the crate: [`sim::SimulatedEngine`] (scriptable, used
//! by tests and the CLI `--simulate` mode) and, behind the `gstreamer` feature,
//! [`gst::GstEngine`].

use crossbeam_channel::Sender;

use crate::graph::GraphSpec;
pub use gplayer_types::{AudioFormat, PipelineState};

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod sim;

/// One of the (at most two) source chains feeding the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainId {
    Primary,
    Secondary,
}

impl ChainId {
    pub const ALL: [ChainId; 2] = [ChainId::Primary, ChainId::Secondary];

    pub fn index(self) -> usize {
        match self {
            ChainId::Primary => 0,
            ChainId::Secondary => 1,
        }
    }

    /// The opposite chain of a dual-source pair.
    pub fn other(self) -> Self {
        match self {
            ChainId::Primary => ChainId::Secondary,
            ChainId::Secondary => ChainId::Primary,
        }
    }
}

/// Fill of a pre-buffer queue as reported by the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueLevel {
    pub current_bytes: u64,
    pub max_bytes: u64,
    pub current_buffers: u32,
    pub max_buffers: u32,
}

impl QueueLevel {
    /// `current_bytes * 100 / max_bytes`, clamped to 100; 0 when the capacity is 0.
    pub fn percent(&self) -> u8 {
        if self.max_bytes == 0 {
            return 0;
        }
        let pct = self.current_bytes.saturating_mul(100) / self.max_bytes;
        pct.min(100) as u8
    }
}

/// Outcome of a successful state change request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateChange {
    /// Reached synchronously.
    Success,
    /// Will complete later; a `StateChanged` event follows.
    Async,
    /// Reached, but the source is live and cannot preroll.
    NoPreroll,
}

/// Typed stage properties the controller may adjust at runtime.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StageProperty {
    /// Pre-buffer capacity in bytes.
    MaxSizeBytes(u64),
    /// Gate drop probability, 0.0 passes everything, 1.0 mutes.
    DropProbability(f32),
    /// Whether a gate synchronises buffers to the clock.
    Sync(bool),
    /// Output volume (1.0 is unity).
    Volume(f64),
    /// Selector input feeding the output.
    ActiveInput(ChainId),
}

/// Asynchronous notifications from the pipeline to the worker loop.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// The top-level pipeline changed execution state.
    StateChanged {
        old: PipelineState,
        new: PipelineState,
    },
    Eos,
    /// Error message raised by a stage. The text stays inside the crate.
    Error { message: String },
    ClockLost,
    /// Buffering level reported by the engine itself (for engines that do).
    Buffering { percent: u8 },
    DurationChanged,
    /// Title-like tag discovered in the stream.
    Tag { text: String },
    /// Raw audio format negotiated on a source pad.
    AudioFormat(AudioFormat),
    /// A dynamically added audio pad was linked to its chain.
    PadLinked { chain: ChainId },
    /// Completing the dynamic link of a chain failed.
    PadLinkFailed { chain: ChainId, reason: String },
}

/// A pipeline event tagged with the graph generation that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphEvent {
    pub generation: u64,
    pub event: PipelineEvent,
}

/// Handle engines use to post events into the worker loop.
///
/// Each graph build receives a sink stamped with a fresh generation so events
/// from a torn-down graph can be recognised and dropped.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Sender<GraphEvent>,
    generation: u64,
}

impl EventSink {
    pub fn new(tx: Sender<GraphEvent>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post an event; returns `false` if the worker loop is gone.
    pub fn post(&self, event: PipelineEvent) -> bool {
        self.tx
            .send(GraphEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Failures reported by a pipeline engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine initialisation failed: {0}")]
    Init(String),
    #[error("could not create stage {stage}: {reason}")]
    StageCreation { stage: String, reason: String },
    #[error("could not link {from} -> {to}: {reason}")]
    Link {
        from: String,
        to: String,
        reason: String,
    },
    #[error("state change to {state} failed: {reason}")]
    StateChange {
        state: PipelineState,
        reason: String,
    },
    #[error("no graph is built")]
    NoGraph,
    #[error("unknown stage {0}")]
    UnknownStage(String),
    #[error("setting property on {stage} failed: {reason}")]
    Property { stage: String, reason: String },
    #[error("seek failed: {0}")]
    Seek(String),
}

/// Operations the controller consumes from the multimedia framework.
///
/// All methods are called from the worker loop thread only.
pub trait PipelineEngine: Send {
    /// Instantiate and statically link every stage of `spec`.
    ///
    /// Dynamic links are completed later by the engine, which reports the
    /// outcome as `PadLinked`/`PadLinkFailed` through `events`.
    fn build(&mut self, spec: &GraphSpec, events: EventSink) -> Result<(), EngineError>;

    /// Stop execution and release every stage. Idempotent.
    fn teardown(&mut self);

    fn set_state(&mut self, state: PipelineState) -> Result<StateChange, EngineError>;

    /// Bring the source and pre-buffer of one chain to `state`.
    fn set_chain_state(
        &mut self,
        chain: ChainId,
        state: PipelineState,
    ) -> Result<StateChange, EngineError>;

    fn position_ns(&self) -> Option<u64>;

    /// `None` when unknown or unbounded.
    fn duration_ns(&self) -> Option<u64>;

    /// `None` when the query fails for this tick.
    fn queue_level(&self, chain: ChainId) -> Option<QueueLevel>;

    fn set_property(&mut self, stage: &str, property: StageProperty) -> Result<(), EngineError>;

    /// Flushing, keyframe-aligned seek.
    fn seek(&mut self, position_ns: u64) -> Result<(), EngineError>;
}

impl<E: PipelineEngine + ?Sized> PipelineEngine for Box<E> {
    fn build(&mut self, spec: &GraphSpec, events: EventSink) -> Result<(), EngineError> {
        (**self).build(spec, events)
    }

    fn teardown(&mut self) {
        (**self).teardown()
    }

    fn set_state(&mut self, state: PipelineState) -> Result<StateChange, EngineError> {
        (**self).set_state(state)
    }

    fn set_chain_state(
        &mut self,
        chain: ChainId,
        state: PipelineState,
    ) -> Result<StateChange, EngineError> {
        (**self).set_chain_state(chain, state)
    }

    fn position_ns(&self) -> Option<u64> {
        (**self).position_ns()
    }

    fn duration_ns(&self) -> Option<u64> {
        (**self).duration_ns()
    }

    fn queue_level(&self, chain: ChainId) -> Option<QueueLevel> {
        (**self).queue_level(chain)
    }

    fn set_property(&mut self, stage: &str, property: StageProperty) -> Result<(), EngineError> {
        (**self).set_property(stage, property)
    }

    fn seek(&mut self, position_ns: u64) -> Result<(), EngineError> {
        (**self).seek(position_ns)
    }
}

/// Nanoseconds to milliseconds, rounded to nearest.
pub fn ns_to_ms(ns: u64) -> u64 {
    ns.saturating_add(500_000) / 1_000_000
}

pub fn ms_to_ns(ms: u64) -> u64 {
    ms.saturating_mul(1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_percent_handles_zero_capacity() {
        let level = QueueLevel {
            current_bytes: 10,
            ..QueueLevel::default()
        };
        assert_eq!(level.percent(), 0);
    }

    #[test]
    fn queue_percent_clamps_overfill() {
        let level = QueueLevel {
            current_bytes: 150,
            max_bytes: 100,
            ..QueueLevel::default()
        };
        assert_eq!(level.percent(), 100);
        let half = QueueLevel {
            current_bytes: 50,
            max_bytes: 100,
            ..QueueLevel::default()
        };
        assert_eq!(half.percent(), 50);
    }

    #[test]
    fn chain_other_swaps() {
        assert_eq!(ChainId::Primary.other(), ChainId::Secondary);
        assert_eq!(ChainId::Secondary.other(), ChainId::Primary);
    }

    #[test]
    fn ns_to_ms_rounds_to_nearest() {
        assert_eq!(ns_to_ms(1_499_999), 1);
        assert_eq!(ns_to_ms(1_500_000), 2);
        assert_eq!(ns_to_ms(0), 0);
        assert_eq!(ms_to_ns(3), 3_000_000);
    }

    #[test]
    fn event_sink_stamps_generation() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = EventSink::new(tx, 7);
        assert!(sink.post(PipelineEvent::Eos));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.generation, 7);
        assert_eq!(ev.event, PipelineEvent::Eos);
    }

    #[test]
    fn event_sink_reports_closed_loop() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let sink = EventSink::new(tx, 1);
        assert!(!sink.post(PipelineEvent::ClockLost));
    }
}
