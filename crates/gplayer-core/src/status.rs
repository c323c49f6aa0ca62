use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use gplayer_types::{PipelineState, PlayerStatus};

const NO_CHAIN: u8 = u8::MAX;

/// Lock-free status shared between the worker loop and caller threads.
///
/// The worker is the only writer; readers get a tear-free value per field.
#[derive(Debug)]
pub struct PlayerStatusState {
    state: AtomicU8,
    target: AtomicU8,
    position_ms: AtomicU64,
    duration_ms: AtomicU64,
    buffering_percent: AtomicU8,
    network_error: AtomicBool,
    active_chain: AtomicU8,
}

impl Default for PlayerStatusState {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Null.as_u8()),
            target: AtomicU8::new(PipelineState::Null.as_u8()),
            position_ms: AtomicU64::new(0),
            duration_ms: AtomicU64::new(0),
            buffering_percent: AtomicU8::new(0),
            network_error: AtomicBool::new(false),
            active_chain: AtomicU8::new(NO_CHAIN),
        }
    }
}

impl PlayerStatusState {
    /// Create a shared status store.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a snapshot produced by the worker loop.
    pub fn publish(&self, status: &PlayerStatus) {
        self.state.store(status.state.as_u8(), Ordering::Relaxed);
        self.target.store(status.target.as_u8(), Ordering::Relaxed);
        self.position_ms.store(status.position_ms, Ordering::Relaxed);
        self.duration_ms.store(status.duration_ms, Ordering::Relaxed);
        self.buffering_percent
            .store(status.buffering_percent.min(100), Ordering::Relaxed);
        self.network_error
            .store(status.network_error, Ordering::Relaxed);
        self.active_chain
            .store(status.active_chain.unwrap_or(NO_CHAIN), Ordering::Relaxed);
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// 0 below PAUSED, whatever was last published.
    pub fn position_ms(&self) -> u64 {
        if self.state() < PipelineState::Paused {
            return 0;
        }
        self.position_ms.load(Ordering::Relaxed)
    }

    pub fn duration_ms(&self) -> u64 {
        if self.state() < PipelineState::Paused {
            return 0;
        }
        self.duration_ms.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PipelineState::Playing
    }

    /// Return a snapshot suitable for host queries.
    pub fn snapshot(&self) -> PlayerStatus {
        let chain = self.active_chain.load(Ordering::Relaxed);
        let state = self.state();
        PlayerStatus {
            state,
            target: PipelineState::from_u8(self.target.load(Ordering::Relaxed)),
            position_ms: self.position_ms(),
            duration_ms: self.duration_ms(),
            buffering_percent: self.buffering_percent.load(Ordering::Relaxed),
            playing: state == PipelineState::Playing,
            network_error: self.network_error.load(Ordering::Relaxed),
            active_chain: (chain != NO_CHAIN).then_some(chain),
        }
    }

    /// Back to the idle snapshot.
    pub fn clear(&self) {
        self.publish(&PlayerStatus::default());
    }
}
