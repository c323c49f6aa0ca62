//! Pipeline graph description and builder.
//!
//! Topology (single source):
//! `source ~> prebuffer -> convert -> resample -> volume -> sink`
//!
//! Topology (dual source):
//! `source_a ~> prebuffer_a -> gate_a -> selector`
//! `source_b ~> prebuffer_b -> gate_b -> selector`
//! `selector -> convert -> resample -> volume -> sink`
//!
//! `~>` marks a dynamic link: the source exposes its pad only once the stream
//! type is known, and the engine completes the link from its pad-availability
//! callback (non-audio pads are rejected).

use crate::config::PlayerConfig;
use crate::pipeline::{ChainId, EngineError, EventSink, PipelineEngine, PipelineState, StateChange};

pub const SELECTOR: &str = "selector";
pub const CONVERT: &str = "convert";
pub const RESAMPLE: &str = "resample";
pub const VOLUME: &str = "volume";
pub const SINK: &str = "sink";

/// What a stage does; engines map each kind to a concrete element.
#[derive(Clone, Debug, PartialEq)]
pub enum StageKind {
    /// Dynamically-typed network/file source that decodes to raw audio.
    UriSource { uri: String },
    /// Bounded byte queue absorbing network jitter.
    PreBuffer { max_bytes: u64, low_percent: u8 },
    /// Pass-through stage that can drop everything (mute) and sync to the clock.
    Gate { drop_probability: f32, sync: bool },
    /// N-to-1 input selector.
    Selector,
    Convert,
    Resample,
    Volume,
    Sink,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// Linked while building.
    Static,
    /// Completed once the upstream pad appears.
    Dynamic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub from: String,
    pub to: String,
    pub kind: LinkKind,
}

/// Stage names belonging to one source chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainStages {
    pub id: ChainId,
    pub source: String,
    pub prebuffer: String,
    pub gate: Option<String>,
}

/// Complete description of one graph instance.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphSpec {
    pub stages: Vec<Stage>,
    pub links: Vec<Link>,
    pub chains: Vec<ChainStages>,
}

impl GraphSpec {
    /// Single source chain straight into the converter.
    pub fn single(uri: &str, buffer_bytes: u64, low_percent: u8) -> Self {
        let mut spec = GraphSpec {
            stages: Vec::new(),
            links: Vec::new(),
            chains: Vec::new(),
        };
        let chain = spec.push_chain(ChainId::Primary, "", uri, buffer_bytes, low_percent, None);
        spec.push_output(&chain.prebuffer);
        spec.chains.push(chain);
        spec
    }

    /// Two redundant source chains gated into a selector.
    ///
    /// The primary chain starts active (gate open); the secondary pre-buffers
    /// behind a closed gate. Both gates sync to the clock until the first
    /// failover completes.
    pub fn dual(uri: &str, buffer_bytes: u64, low_percent: u8) -> Self {
        let mut spec = GraphSpec {
            stages: Vec::new(),
            links: Vec::new(),
            chains: Vec::new(),
        };
        spec.stages.push(Stage {
            name: SELECTOR.to_string(),
            kind: StageKind::Selector,
        });
        for (id, suffix, drop_probability) in [
            (ChainId::Primary, "_a", 0.0),
            (ChainId::Secondary, "_b", 1.0),
        ] {
            let chain = spec.push_chain(
                id,
                suffix,
                uri,
                buffer_bytes,
                low_percent,
                Some(drop_probability),
            );
            if let Some(gate) = chain.gate.as_ref() {
                spec.link(gate, SELECTOR, LinkKind::Static);
            }
            spec.chains.push(chain);
        }
        spec.push_output(SELECTOR);
        spec
    }

    fn push_chain(
        &mut self,
        id: ChainId,
        suffix: &str,
        uri: &str,
        buffer_bytes: u64,
        low_percent: u8,
        gate_drop: Option<f32>,
    ) -> ChainStages {
        let source = format!("source{suffix}");
        let prebuffer = format!("prebuffer{suffix}");
        self.stages.push(Stage {
            name: source.clone(),
            kind: StageKind::UriSource {
                uri: uri.to_string(),
            },
        });
        self.stages.push(Stage {
            name: prebuffer.clone(),
            kind: StageKind::PreBuffer {
                max_bytes: buffer_bytes,
                low_percent,
            },
        });
        self.link(&source, &prebuffer, LinkKind::Dynamic);
        let gate = gate_drop.map(|drop_probability| {
            let gate = format!("gate{suffix}");
            self.stages.push(Stage {
                name: gate.clone(),
                kind: StageKind::Gate {
                    drop_probability,
                    sync: true,
                },
            });
            self.link(&prebuffer, &gate, LinkKind::Static);
            gate
        });
        ChainStages {
            id,
            source,
            prebuffer,
            gate,
        }
    }

    fn push_output(&mut self, upstream: &str) {
        for (name, kind) in [
            (CONVERT, StageKind::Convert),
            (RESAMPLE, StageKind::Resample),
            (VOLUME, StageKind::Volume),
            (SINK, StageKind::Sink),
        ] {
            self.stages.push(Stage {
                name: name.to_string(),
                kind,
            });
        }
        self.link(upstream, CONVERT, LinkKind::Static);
        self.link(CONVERT, RESAMPLE, LinkKind::Static);
        self.link(RESAMPLE, VOLUME, LinkKind::Static);
        self.link(VOLUME, SINK, LinkKind::Static);
    }

    fn link(&mut self, from: &str, to: &str, kind: LinkKind) {
        self.links.push(Link {
            from: from.to_string(),
            to: to.to_string(),
            kind,
        });
    }

    pub fn is_dual(&self) -> bool {
        self.chains.len() == 2
    }

    pub fn chain(&self, id: ChainId) -> Option<&ChainStages> {
        self.chains.iter().find(|c| c.id == id)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage that receives the dynamic link of `source`, if any.
    pub fn dynamic_target(&self, source: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.kind == LinkKind::Dynamic && l.from == source)
            .map(|l| l.to.as_str())
    }
}

/// One built graph; its lifetime is exactly one media load.
#[derive(Debug)]
pub struct Graph {
    pub spec: GraphSpec,
    pub generation: u64,
    /// The source reported that it cannot preroll (live stream).
    pub live: bool,
}

/// Tear down whatever the engine currently holds and build a fresh graph for `uri`.
///
/// Leaves the new graph in READY.
pub fn build_graph<E: PipelineEngine + ?Sized>(
    engine: &mut E,
    uri: &str,
    config: &PlayerConfig,
    buffer_bytes: u64,
    events: EventSink,
) -> Result<Graph, EngineError> {
    engine.teardown();

    let spec = if config.dual_source {
        GraphSpec::dual(uri, buffer_bytes, config.low_watermark_percent)
    } else {
        GraphSpec::single(uri, buffer_bytes, config.low_watermark_percent)
    };
    let generation = events.generation();
    engine.build(&spec, events)?;

    let live = match engine.set_state(PipelineState::Ready) {
        Ok(StateChange::NoPreroll) => true,
        Ok(_) => false,
        Err(e) => {
            engine.teardown();
            return Err(e);
        }
    };
    tracing::info!(
        uri = %uri,
        dual = spec.is_dual(),
        stages = spec.stages.len(),
        generation,
        "pipeline graph built"
    );
    Ok(Graph {
        spec,
        generation,
        live,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sim::SimulatedEngine;

    fn names(spec: &GraphSpec) -> Vec<&str> {
        spec.stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn single_topology_is_linear() {
        let spec = GraphSpec::single("http://x/a.mp3", 1000, 25);
        assert_eq!(
            names(&spec),
            vec!["source", "prebuffer", "convert", "resample", "volume", "sink"]
        );
        assert!(!spec.is_dual());
        assert_eq!(spec.dynamic_target("source"), Some("prebuffer"));
        assert_eq!(
            spec.links
                .iter()
                .filter(|l| l.kind == LinkKind::Dynamic)
                .count(),
            1
        );
    }

    #[test]
    fn dual_topology_gates_both_chains_into_selector() {
        let spec = GraphSpec::dual("http://x/live", 1000, 25);
        assert!(spec.is_dual());
        let a = spec.chain(ChainId::Primary).unwrap();
        let b = spec.chain(ChainId::Secondary).unwrap();
        assert_eq!(a.gate.as_deref(), Some("gate_a"));
        assert_eq!(b.gate.as_deref(), Some("gate_b"));
        assert!(spec
            .links
            .iter()
            .any(|l| l.from == "gate_b" && l.to == SELECTOR));
        assert!(spec
            .links
            .iter()
            .any(|l| l.from == SELECTOR && l.to == CONVERT));
        match &spec.stage("gate_b").unwrap().kind {
            StageKind::Gate {
                drop_probability,
                sync,
            } => {
                assert_eq!(*drop_probability, 1.0);
                assert!(*sync);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn build_graph_leaves_engine_ready() {
        let mut engine = SimulatedEngine::new();
        let control = engine.control();
        let (tx, rx) = crossbeam_channel::unbounded();
        let graph = build_graph(
            &mut engine,
            "file:///tmp/a.ogg",
            &PlayerConfig::default(),
            4096,
            EventSink::new(tx, 3),
        )
        .unwrap();
        assert_eq!(graph.generation, 3);
        assert!(!graph.live);
        assert_eq!(control.requested_state(), PipelineState::Ready);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.generation, 3);
    }

    #[test]
    fn live_sources_are_not_detected_at_ready() {
        let mut engine = SimulatedEngine::new();
        engine.control().set_live(true);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let graph = build_graph(
            &mut engine,
            "http://radio/stream",
            &PlayerConfig::default(),
            4096,
            EventSink::new(tx, 1),
        )
        .unwrap();
        assert!(!graph.live);
        assert_eq!(
            engine.set_state(PipelineState::Paused).unwrap(),
            StateChange::NoPreroll
        );
    }

    #[test]
    fn build_graph_propagates_stage_failure() {
        let mut engine = SimulatedEngine::new();
        engine.control().fail_stage("resample");
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = build_graph(
            &mut engine,
            "http://x/a.mp3",
            &PlayerConfig::default(),
            4096,
            EventSink::new(tx, 1),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::StageCreation { .. }));
    }
}
