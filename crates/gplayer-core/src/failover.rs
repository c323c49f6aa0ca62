//! Dual-source failover coordinator.
//!
//! Two redundant source chains feed an input selector through gates. The
//! active chain's gate passes everything, the standby's drops everything while
//! it pre-buffers in the background. When the active chain starves for most of
//! a window and the standby has enough data, the gates flip and the selector
//! switches; once the new chain's pad is linked and it holds enough data, clock
//! sync is released and playback resumes.

use gplayer_types::PipelineState;

use crate::config::PlayerConfig;
use crate::graph::{GraphSpec, SELECTOR};
use crate::pipeline::{ChainId, EngineError, PipelineEngine, StageProperty};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainRole {
    Active,
    Standby,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChainStatus {
    role: ChainRole,
    awaiting_pad: bool,
    percent: u8,
}

/// Result of one failover tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailoverOutcome {
    Idle,
    Swapped { from: ChainId, to: ChainId },
    Completed,
}

#[derive(Debug)]
pub struct FailoverCoordinator {
    chains: [ChainStatus; 2],
    pending: bool,
    window_ticks: u32,
    low_ticks: u32,
    swaps: u32,
}

impl Default for FailoverCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl FailoverCoordinator {
    pub fn new() -> Self {
        let chain = |role| ChainStatus {
            role,
            awaiting_pad: false,
            percent: 0,
        };
        Self {
            chains: [chain(ChainRole::Active), chain(ChainRole::Standby)],
            pending: false,
            window_ticks: 0,
            low_ticks: 0,
            swaps: 0,
        }
    }

    pub fn active(&self) -> ChainId {
        if self.chains[0].role == ChainRole::Active {
            ChainId::Primary
        } else {
            ChainId::Secondary
        }
    }

    pub fn standby(&self) -> ChainId {
        self.active().other()
    }

    pub fn role(&self, chain: ChainId) -> ChainRole {
        self.chains[chain.index()].role
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn swaps(&self) -> u32 {
        self.swaps
    }

    pub fn percent(&self, chain: ChainId) -> u8 {
        self.chains[chain.index()].percent
    }

    pub fn awaiting_pad(&self, chain: ChainId) -> bool {
        self.chains[chain.index()].awaiting_pad
    }

    /// Refresh per-chain fill; a failed query keeps the previous value.
    pub fn sample<E: PipelineEngine + ?Sized>(&mut self, engine: &E) {
        for chain in ChainId::ALL {
            if let Some(level) = engine.queue_level(chain) {
                self.chains[chain.index()].percent = level.percent();
            }
        }
    }

    /// The standby could take over right now.
    ///
    /// When both chains are above the ready threshold the active one wins and
    /// no swap happens.
    pub fn can_take_over(&self, config: &PlayerConfig) -> bool {
        let active = &self.chains[self.active().index()];
        let standby = &self.chains[self.standby().index()];
        !self.pending
            && !standby.awaiting_pad
            && standby.percent >= config.failover_ready_percent
            && active.percent < config.failover_ready_percent
    }

    pub fn tick<E: PipelineEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        spec: &GraphSpec,
        actual: PipelineState,
        target: PipelineState,
        steady_bytes: u64,
        config: &PlayerConfig,
    ) -> Result<FailoverOutcome, EngineError> {
        self.sample(engine);

        if self.pending {
            let done = self.try_complete(engine, spec, target, steady_bytes, config)?;
            return Ok(if done {
                FailoverOutcome::Completed
            } else {
                FailoverOutcome::Idle
            });
        }

        self.window_ticks += 1;
        if self.chains[self.active().index()].percent < config.failover_low_percent {
            self.low_ticks += 1;
        }
        if self.window_ticks < config.starvation_window_ticks {
            return Ok(FailoverOutcome::Idle);
        }
        let starved = self.low_ticks >= config.starvation_trigger_ticks;
        self.window_ticks = 0;
        self.low_ticks = 0;

        if starved && target == PipelineState::Playing && self.can_take_over(config) {
            let (from, to) = self.swap(engine, spec, actual)?;
            return Ok(FailoverOutcome::Swapped { from, to });
        }
        Ok(FailoverOutcome::Idle)
    }

    fn swap<E: PipelineEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        spec: &GraphSpec,
        actual: PipelineState,
    ) -> Result<(ChainId, ChainId), EngineError> {
        let from = self.active();
        let to = from.other();
        self.pending = true;

        if let Some(gate) = spec.chain(from).and_then(|c| c.gate.as_deref()) {
            engine.set_property(gate, StageProperty::DropProbability(1.0))?;
        }
        if let Some(gate) = spec.chain(to).and_then(|c| c.gate.as_deref()) {
            engine.set_property(gate, StageProperty::DropProbability(0.0))?;
        }
        engine.set_property(SELECTOR, StageProperty::ActiveInput(to))?;

        self.chains[from.index()].role = ChainRole::Standby;
        self.chains[to.index()].role = ChainRole::Active;

        let running = actual.max(PipelineState::Paused);
        engine.set_chain_state(to, running)?;
        engine.set_chain_state(from, PipelineState::Null)?;
        engine.set_chain_state(from, running)?;
        self.chains[from.index()].percent = 0;
        self.chains[from.index()].awaiting_pad = true;
        self.chains[to.index()].awaiting_pad = true;
        self.swaps += 1;

        tracing::warn!(
            from = ?from,
            to = ?to,
            standby_percent = self.chains[to.index()].percent,
            "active source starved, failing over"
        );
        Ok((from, to))
    }

    pub fn on_pad_linked(&mut self, chain: ChainId) {
        self.chains[chain.index()].awaiting_pad = false;
    }

    /// Finish a pending failover once the new chain is linked and filled.
    pub fn try_complete<E: PipelineEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        spec: &GraphSpec,
        target: PipelineState,
        steady_bytes: u64,
        config: &PlayerConfig,
    ) -> Result<bool, EngineError> {
        let active = self.chains[self.active().index()];
        if !self.pending
            || active.awaiting_pad
            || active.percent < config.failover_resume_percent
        {
            return Ok(false);
        }

        for chain in &spec.chains {
            if let Some(gate) = chain.gate.as_deref() {
                engine.set_property(gate, StageProperty::Sync(false))?;
            }
            engine.set_property(&chain.prebuffer, StageProperty::MaxSizeBytes(steady_bytes))?;
        }
        self.pending = false;
        if target == PipelineState::Playing {
            engine.set_state(PipelineState::Playing)?;
        }
        tracing::info!(active = ?self.active(), "failover complete");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sim::{SimControl, SimulatedEngine};
    use crate::pipeline::{EventSink, PipelineEngine};

    fn dual() -> (SimulatedEngine, SimControl, GraphSpec) {
        let mut engine = SimulatedEngine::new();
        let control = engine.control();
        let spec = GraphSpec::dual("http://radio/live", 1000, 25);
        let (tx, _rx) = crossbeam_channel::unbounded();
        engine.build(&spec, EventSink::new(tx, 1)).unwrap();
        engine.set_state(PipelineState::Playing).unwrap();
        (engine, control, spec)
    }

    fn run_window(
        coord: &mut FailoverCoordinator,
        engine: &mut SimulatedEngine,
        control: &SimControl,
        spec: &GraphSpec,
        active_pct: u8,
        standby_pct: u8,
    ) -> Vec<FailoverOutcome> {
        let cfg = PlayerConfig::default();
        (0..20)
            .map(|_| {
                control.set_fill_percent(coord.active(), active_pct);
                control.set_fill_percent(coord.standby(), standby_pct);
                coord
                    .tick(engine, spec, PipelineState::Playing, PipelineState::Playing, 1000, &cfg)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn starved_active_chain_swaps_once_to_ready_standby() {
        let (mut engine, control, spec) = dual();
        let mut coord = FailoverCoordinator::new();
        let outcomes = run_window(&mut coord, &mut engine, &control, &spec, 0, 60);

        let swaps: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o, FailoverOutcome::Swapped { .. }))
            .collect();
        assert_eq!(swaps.len(), 1);
        assert_eq!(coord.active(), ChainId::Secondary);
        assert_eq!(coord.role(ChainId::Primary), ChainRole::Standby);
        assert!(coord.is_pending());
        assert_eq!(
            control.last_property("gate_a", |p| match p {
                StageProperty::DropProbability(d) => Some(*d),
                _ => None,
            }),
            Some(1.0)
        );
        assert_eq!(
            control.last_property("gate_b", |p| match p {
                StageProperty::DropProbability(d) => Some(*d),
                _ => None,
            }),
            Some(0.0)
        );
        assert_eq!(
            control.last_property(SELECTOR, |p| match p {
                StageProperty::ActiveInput(c) => Some(*c),
                _ => None,
            }),
            Some(ChainId::Secondary)
        );
        assert!(control
            .chain_requests()
            .contains(&(ChainId::Primary, PipelineState::Null)));
    }

    #[test]
    fn no_swap_when_standby_not_ready() {
        let (mut engine, control, spec) = dual();
        let mut coord = FailoverCoordinator::new();
        let outcomes = run_window(&mut coord, &mut engine, &control, &spec, 0, 30);
        assert!(outcomes.iter().all(|o| *o == FailoverOutcome::Idle));
        assert_eq!(coord.active(), ChainId::Primary);
    }

    #[test]
    fn both_chains_eligible_keeps_active() {
        let (mut engine, control, spec) = dual();
        // 55% counts as starved under a 60% low mark yet is above the ready mark.
        let cfg = PlayerConfig {
            failover_low_percent: 60,
            ..PlayerConfig::default()
        };
        let mut coord = FailoverCoordinator::new();
        for _ in 0..20 {
            control.set_fill_percent(ChainId::Primary, 55);
            control.set_fill_percent(ChainId::Secondary, 90);
            let out = coord
                .tick(&mut engine, &spec, PipelineState::Playing, PipelineState::Playing, 1000, &cfg)
                .unwrap();
            assert_eq!(out, FailoverOutcome::Idle);
        }
        assert_eq!(coord.active(), ChainId::Primary);
    }

    #[test]
    fn completion_waits_for_pad_and_fill() {
        let (mut engine, control, spec) = dual();
        let cfg = PlayerConfig::default();
        let mut coord = FailoverCoordinator::new();
        run_window(&mut coord, &mut engine, &control, &spec, 0, 60);
        assert!(coord.awaiting_pad(ChainId::Secondary));

        control.set_fill_percent(ChainId::Secondary, 60);
        let out = coord
            .tick(&mut engine, &spec, PipelineState::Playing, PipelineState::Playing, 4096, &cfg)
            .unwrap();
        assert_eq!(out, FailoverOutcome::Idle);

        coord.on_pad_linked(ChainId::Secondary);
        control.set_fill_percent(ChainId::Secondary, 10);
        coord.sample(&engine);
        assert!(!coord
            .try_complete(&mut engine, &spec, PipelineState::Playing, 4096, &cfg)
            .unwrap());
        control.set_fill_percent(ChainId::Secondary, 30);
        control.clear_requests();
        let out = coord
            .tick(&mut engine, &spec, PipelineState::Playing, PipelineState::Playing, 4096, &cfg)
            .unwrap();
        assert_eq!(out, FailoverOutcome::Completed);
        assert!(!coord.is_pending());
        assert_eq!(
            control.last_property("gate_a", |p| match p {
                StageProperty::Sync(s) => Some(*s),
                _ => None,
            }),
            Some(false)
        );
        assert_eq!(
            control.last_property("prebuffer_b", |p| match p {
                StageProperty::MaxSizeBytes(b) => Some(*b),
                _ => None,
            }),
            Some(4096)
        );
        assert_eq!(control.state_requests(), vec![PipelineState::Playing]);
    }

    #[test]
    fn no_swap_while_playback_not_requested() {
        let (mut engine, control, spec) = dual();
        let cfg = PlayerConfig::default();
        let mut coord = FailoverCoordinator::new();
        for _ in 0..40 {
            control.set_fill_percent(ChainId::Primary, 0);
            control.set_fill_percent(ChainId::Secondary, 80);
            let out = coord
                .tick(&mut engine, &spec, PipelineState::Paused, PipelineState::Paused, 1000, &cfg)
                .unwrap();
            assert_eq!(out, FailoverOutcome::Idle);
        }
    }
}
