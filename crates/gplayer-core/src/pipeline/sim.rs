//! Scriptable in-process pipeline engine.
//!
//! [`SimulatedEngine`] implements [`PipelineEngine`] without any multimedia
//! framework. A cloneable [`SimControl`] shares its state so tests (and the CLI
//! `--simulate` mode) can set queue fill, duration and position, post pipeline
//! events, inject failures, and inspect every request the controller issued.
//!
//! With a [`SimNetwork`] installed the engine also runs a crude network model:
//! pre-buffers fill at the download rate, the active chain drains while
//! PLAYING, position follows wall time and EOS is posted at the duration.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::graph::{GraphSpec, StageKind};
use crate::pipeline::{
    AudioFormat, ChainId, EngineError, EventSink, PipelineEngine, PipelineEvent, PipelineState,
    QueueLevel, StageProperty, StateChange,
};

/// Parameters of the self-running network model.
#[derive(Clone, Debug, PartialEq)]
pub struct SimNetwork {
    pub download_bytes_per_sec: u64,
    pub consume_bytes_per_sec: u64,
    pub duration_ns: Option<u64>,
    /// Chain whose download never progresses.
    pub stalled_chain: Option<ChainId>,
    pub format: AudioFormat,
}

impl Default for SimNetwork {
    fn default() -> Self {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
            bit_width: 16,
        };
        Self {
            download_bytes_per_sec: format.bytes_per_second() * 2,
            consume_bytes_per_sec: format.bytes_per_second(),
            duration_ns: Some(30_000_000_000),
            stalled_chain: None,
            format,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    spec: Option<GraphSpec>,
    events: Option<EventSink>,
    state: PipelineState,
    requested: PipelineState,
    state_requests: Vec<PipelineState>,
    chain_requests: Vec<(ChainId, PipelineState)>,
    live: bool,
    auto_pads: bool,
    position_ns: u64,
    duration_ns: Option<u64>,
    queues: [QueueLevel; 2],
    queue_query_fails: [bool; 2],
    properties: Vec<(String, StageProperty)>,
    active_input: Option<ChainId>,
    seeks: Vec<u64>,
    teardowns: u32,
    builds: u32,
    fail_stage: Option<String>,
    fail_link: Option<String>,
    fail_seek: bool,
    network: Option<SimNetwork>,
    last_advance: Option<Instant>,
    eos_posted: bool,
}

impl SimState {
    fn post(&self, event: PipelineEvent) {
        if let Some(sink) = self.events.as_ref() {
            sink.post(event);
        }
    }

    fn chain_of_stage(&self, stage: &str) -> Option<ChainId> {
        self.spec.as_ref().and_then(|spec| {
            spec.chains
                .iter()
                .find(|c| c.prebuffer == stage || c.source == stage || c.gate.as_deref() == Some(stage))
                .map(|c| c.id)
        })
    }

    fn active_chain(&self) -> ChainId {
        self.active_input.unwrap_or(ChainId::Primary)
    }

    fn advance(&mut self, now: Instant) {
        let Some(net) = self.network.clone() else {
            return;
        };
        let Some(last) = self.last_advance.replace(now) else {
            return;
        };
        if self.spec.is_none() {
            return;
        }
        let dt = now.saturating_duration_since(last);
        let dt_ns = dt.as_nanos().min(u64::MAX as u128) as u64;
        let downloaded = (net.download_bytes_per_sec as u128 * dt_ns as u128 / 1_000_000_000) as u64;
        let consumed = (net.consume_bytes_per_sec as u128 * dt_ns as u128 / 1_000_000_000) as u64;
        let chains = self.spec.as_ref().map(|s| s.chains.len()).unwrap_or(0);
        let active = self.active_chain();

        for chain in ChainId::ALL.iter().take(chains) {
            let flowing = self.state >= PipelineState::Paused
                || self.chain_requests.iter().rev().find(|(c, _)| c == chain).map(|(_, s)| *s)
                    >= Some(PipelineState::Paused);
            if !flowing || net.stalled_chain == Some(*chain) {
                continue;
            }
            let q = &mut self.queues[chain.index()];
            q.current_bytes = q.current_bytes.saturating_add(downloaded).min(q.max_bytes);
        }

        if self.state == PipelineState::Playing {
            let q = &mut self.queues[active.index()];
            let drained = consumed.min(q.current_bytes);
            q.current_bytes -= drained;
            if net.consume_bytes_per_sec > 0 {
                let played_ns =
                    (drained as u128 * 1_000_000_000 / net.consume_bytes_per_sec as u128) as u64;
                self.position_ns = self.position_ns.saturating_add(played_ns);
            }
            if let Some(duration) = self.duration_ns {
                if self.position_ns >= duration {
                    self.position_ns = duration;
                    if !self.eos_posted {
                        self.eos_posted = true;
                        self.post(PipelineEvent::Eos);
                    }
                }
            }
        }
    }

    /// Walk one state at a time toward `target`, posting each transition.
    fn step_to(&mut self, target: PipelineState) {
        while self.state != target {
            let old = self.state;
            let next = if target > old {
                PipelineState::from_u8(old.as_u8() + 1)
            } else {
                PipelineState::from_u8(old.as_u8() - 1)
            };
            self.state = next;
            self.post(PipelineEvent::StateChanged { old, new: next });
        }
    }
}

/// Scriptable [`PipelineEngine`].
#[derive(Debug, Default)]
pub struct SimulatedEngine {
    shared: Arc<Mutex<SimState>>,
}

/// Shared handle to a [`SimulatedEngine`]'s state.
#[derive(Clone, Debug)]
pub struct SimControl {
    shared: Arc<Mutex<SimState>>,
}

fn lock(shared: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedEngine {
    pub fn new() -> Self {
        let engine = Self::default();
        lock(&engine.shared).auto_pads = true;
        engine
    }

    /// Engine running the network model from the start.
    pub fn with_network(network: SimNetwork) -> Self {
        let engine = Self::new();
        engine.control().set_network(network);
        engine
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            shared: self.shared.clone(),
        }
    }
}

impl PipelineEngine for SimulatedEngine {
    fn build(&mut self, spec: &GraphSpec, events: EventSink) -> Result<(), EngineError> {
        let mut st = lock(&self.shared);
        if let Some(stage) = st.fail_stage.clone() {
            if spec.stage(&stage).is_some() {
                return Err(EngineError::StageCreation {
                    stage,
                    reason: "simulated factory failure".to_string(),
                });
            }
        }
        if let Some(stage) = st.fail_link.clone() {
            if let Some(link) = spec.links.iter().find(|l| l.from == stage) {
                return Err(EngineError::Link {
                    from: link.from.clone(),
                    to: link.to.clone(),
                    reason: "simulated link failure".to_string(),
                });
            }
        }

        st.builds += 1;
        st.queues = [QueueLevel::default(); 2];
        for chain in &spec.chains {
            if let Some(StageKind::PreBuffer { max_bytes, .. }) =
                spec.stage(&chain.prebuffer).map(|s| &s.kind)
            {
                st.queues[chain.id.index()].max_bytes = *max_bytes;
                st.queues[chain.id.index()].max_buffers = 100;
            }
        }
        st.spec = Some(spec.clone());
        st.events = Some(events);
        st.state = PipelineState::Null;
        st.active_input = None;
        st.position_ns = 0;
        st.eos_posted = false;
        st.last_advance = None;
        if let Some(net) = st.network.clone() {
            st.duration_ns = net.duration_ns;
        }
        if st.auto_pads {
            for chain in &spec.chains {
                st.post(PipelineEvent::PadLinked { chain: chain.id });
            }
            if let Some(net) = st.network.as_ref() {
                st.post(PipelineEvent::AudioFormat(net.format));
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        let mut st = lock(&self.shared);
        st.teardowns += 1;
        if st.spec.take().is_some() {
            st.state = PipelineState::Null;
            st.requested = PipelineState::Null;
        }
        st.events = None;
    }

    fn set_state(&mut self, state: PipelineState) -> Result<StateChange, EngineError> {
        let mut st = lock(&self.shared);
        if st.spec.is_none() {
            return Err(EngineError::NoGraph);
        }
        let now = Instant::now();
        st.advance(now);
        if st.network.is_some() && st.last_advance.is_none() {
            st.last_advance = Some(now);
        }
        st.requested = state;
        st.state_requests.push(state);
        st.step_to(state);
        if st.live && state >= PipelineState::Paused {
            Ok(StateChange::NoPreroll)
        } else {
            Ok(StateChange::Success)
        }
    }

    fn set_chain_state(
        &mut self,
        chain: ChainId,
        state: PipelineState,
    ) -> Result<StateChange, EngineError> {
        let mut st = lock(&self.shared);
        if st.spec.is_none() {
            return Err(EngineError::NoGraph);
        }
        st.chain_requests.push((chain, state));
        if state == PipelineState::Null {
            st.queues[chain.index()].current_bytes = 0;
        } else if st.auto_pads && state >= PipelineState::Paused {
            st.post(PipelineEvent::PadLinked { chain });
        }
        Ok(StateChange::Success)
    }

    fn position_ns(&self) -> Option<u64> {
        let mut st = lock(&self.shared);
        st.spec.as_ref()?;
        st.advance(Instant::now());
        Some(st.position_ns)
    }

    fn duration_ns(&self) -> Option<u64> {
        let st = lock(&self.shared);
        st.spec.as_ref()?;
        st.duration_ns
    }

    fn queue_level(&self, chain: ChainId) -> Option<QueueLevel> {
        let mut st = lock(&self.shared);
        let chains = st.spec.as_ref()?.chains.len();
        if chain.index() >= chains || st.queue_query_fails[chain.index()] {
            return None;
        }
        st.advance(Instant::now());
        Some(st.queues[chain.index()])
    }

    fn set_property(&mut self, stage: &str, property: StageProperty) -> Result<(), EngineError> {
        let mut st = lock(&self.shared);
        let Some(spec) = st.spec.as_ref() else {
            return Err(EngineError::NoGraph);
        };
        if spec.stage(stage).is_none() {
            return Err(EngineError::UnknownStage(stage.to_string()));
        }
        match property {
            StageProperty::MaxSizeBytes(bytes) => {
                if let Some(chain) = st.chain_of_stage(stage) {
                    let q = &mut st.queues[chain.index()];
                    q.max_bytes = bytes;
                    q.current_bytes = q.current_bytes.min(bytes);
                }
            }
            StageProperty::ActiveInput(chain) => st.active_input = Some(chain),
            _ => {}
        }
        st.properties.push((stage.to_string(), property));
        Ok(())
    }

    fn seek(&mut self, position_ns: u64) -> Result<(), EngineError> {
        let mut st = lock(&self.shared);
        if st.spec.is_none() {
            return Err(EngineError::NoGraph);
        }
        if st.fail_seek {
            return Err(EngineError::Seek("simulated seek failure".to_string()));
        }
        st.seeks.push(position_ns);
        st.position_ns = position_ns;
        st.eos_posted = false;
        Ok(())
    }
}

impl SimControl {
    pub fn set_live(&self, live: bool) {
        lock(&self.shared).live = live;
    }

    /// Post `PadLinked` for every chain at build time (default on).
    pub fn set_auto_pads(&self, enabled: bool) {
        lock(&self.shared).auto_pads = enabled;
    }

    pub fn set_network(&self, network: SimNetwork) {
        let mut st = lock(&self.shared);
        st.duration_ns = network.duration_ns;
        st.network = Some(network);
    }

    pub fn fail_stage(&self, stage: &str) {
        lock(&self.shared).fail_stage = Some(stage.to_string());
    }

    /// Fail the first link leaving `stage`.
    pub fn fail_link(&self, stage: &str) {
        lock(&self.shared).fail_link = Some(stage.to_string());
    }

    pub fn fail_seek(&self, fail: bool) {
        lock(&self.shared).fail_seek = fail;
    }

    pub fn fail_queue_query(&self, chain: ChainId, fail: bool) {
        lock(&self.shared).queue_query_fails[chain.index()] = fail;
    }

    pub fn set_duration_ns(&self, duration: Option<u64>) {
        lock(&self.shared).duration_ns = duration;
    }

    pub fn set_position_ns(&self, position: u64) {
        lock(&self.shared).position_ns = position;
    }

    pub fn set_queue_bytes(&self, chain: ChainId, current_bytes: u64, max_bytes: u64) {
        let mut st = lock(&self.shared);
        let q = &mut st.queues[chain.index()];
        q.current_bytes = current_bytes;
        q.max_bytes = max_bytes;
        q.current_buffers = if max_bytes == 0 {
            0
        } else {
            (current_bytes.saturating_mul(100) / max_bytes).min(100) as u32
        };
    }

    /// Set fill to `percent` of the current capacity (capacity 100 bytes if unset).
    pub fn set_fill_percent(&self, chain: ChainId, percent: u8) {
        let max = {
            let st = lock(&self.shared);
            match st.queues[chain.index()].max_bytes {
                0 => 100,
                m => m,
            }
        };
        self.set_queue_bytes(chain, max * percent.min(100) as u64 / 100, max);
    }

    /// Post an event as if the pipeline raised it on the current graph.
    pub fn post(&self, event: PipelineEvent) -> bool {
        let st = lock(&self.shared);
        match st.events.as_ref() {
            Some(sink) => sink.post(event),
            None => false,
        }
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.shared).state
    }

    pub fn requested_state(&self) -> PipelineState {
        lock(&self.shared).requested
    }

    pub fn state_requests(&self) -> Vec<PipelineState> {
        lock(&self.shared).state_requests.clone()
    }

    pub fn clear_requests(&self) {
        let mut st = lock(&self.shared);
        st.state_requests.clear();
        st.chain_requests.clear();
        st.properties.clear();
        st.seeks.clear();
    }

    pub fn chain_requests(&self) -> Vec<(ChainId, PipelineState)> {
        lock(&self.shared).chain_requests.clone()
    }

    pub fn seeks(&self) -> Vec<u64> {
        lock(&self.shared).seeks.clone()
    }

    pub fn properties(&self) -> Vec<(String, StageProperty)> {
        lock(&self.shared).properties.clone()
    }

    /// Last value set for `stage`, filtered by `pick`.
    pub fn last_property<T>(
        &self,
        stage: &str,
        pick: impl Fn(&StageProperty) -> Option<T>,
    ) -> Option<T> {
        lock(&self.shared)
            .properties
            .iter()
            .rev()
            .filter(|(s, _)| s == stage)
            .find_map(|(_, p)| pick(p))
    }

    pub fn queue(&self, chain: ChainId) -> QueueLevel {
        lock(&self.shared).queues[chain.index()]
    }

    pub fn spec(&self) -> Option<GraphSpec> {
        lock(&self.shared).spec.clone()
    }

    pub fn builds(&self) -> u32 {
        lock(&self.shared).builds
    }

    pub fn teardowns(&self) -> u32 {
        lock(&self.shared).teardowns
    }

    pub fn generation(&self) -> Option<u64> {
        lock(&self.shared).events.as_ref().map(|s| s.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GraphEvent;

    fn built() -> (SimulatedEngine, SimControl, crossbeam_channel::Receiver<GraphEvent>) {
        let mut engine = SimulatedEngine::new();
        let control = engine.control();
        let (tx, rx) = crossbeam_channel::unbounded();
        engine
            .build(&GraphSpec::single("file:///a.wav", 1000, 25), EventSink::new(tx, 1))
            .unwrap();
        (engine, control, rx)
    }

    #[test]
    fn set_state_posts_each_intermediate_transition() {
        let (mut engine, _control, rx) = built();
        let _ = rx.try_recv(); // PadLinked
        engine.set_state(PipelineState::Playing).unwrap();
        let states: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e.event {
                PipelineEvent::StateChanged { old, new } => Some((old, new)),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                (PipelineState::Null, PipelineState::Ready),
                (PipelineState::Ready, PipelineState::Paused),
                (PipelineState::Paused, PipelineState::Playing),
            ]
        );
    }

    #[test]
    fn repeated_state_request_posts_nothing() {
        let (mut engine, _control, rx) = built();
        engine.set_state(PipelineState::Paused).unwrap();
        let _: Vec<_> = rx.try_iter().collect();
        engine.set_state(PipelineState::Paused).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn queue_query_failure_is_reported_as_none() {
        let (engine, control, _rx) = built();
        assert!(engine.queue_level(ChainId::Primary).is_some());
        control.fail_queue_query(ChainId::Primary, true);
        assert!(engine.queue_level(ChainId::Primary).is_none());
        assert!(engine.queue_level(ChainId::Secondary).is_none());
    }

    #[test]
    fn max_size_property_resizes_owning_queue() {
        let (mut engine, control, _rx) = built();
        control.set_queue_bytes(ChainId::Primary, 900, 1000);
        engine
            .set_property("prebuffer", StageProperty::MaxSizeBytes(500))
            .unwrap();
        let q = control.queue(ChainId::Primary);
        assert_eq!(q.max_bytes, 500);
        assert_eq!(q.current_bytes, 500);
    }

    #[test]
    fn unknown_stage_property_is_rejected() {
        let (mut engine, _control, _rx) = built();
        let err = engine
            .set_property("nope", StageProperty::Volume(1.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStage(_)));
    }

    #[test]
    fn operations_without_graph_fail() {
        let mut engine = SimulatedEngine::new();
        assert!(matches!(
            engine.set_state(PipelineState::Ready),
            Err(EngineError::NoGraph)
        ));
        assert!(engine.position_ns().is_none());
        assert!(engine.seek(1).is_err());
    }
}
