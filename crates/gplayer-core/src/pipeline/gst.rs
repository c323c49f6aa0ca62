//! GStreamer-backed [`PipelineEngine`].
//!
//! Stage kinds map onto stock elements:
//! `uridecodebin`, `queue2`, `identity`, `input-selector`, `audioconvert`,
//! `audioresample`, `volume`, `autoaudiosink`. Bus messages are converted to
//! [`PipelineEvent`]s in a sync handler, so they reach the worker loop without
//! a GLib main loop.

use std::collections::HashMap;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_audio as gst_audio;

use crate::graph::{ChainStages, GraphSpec, LinkKind, SELECTOR, StageKind};
use crate::pipeline::{
    AudioFormat, ChainId, EngineError, EventSink, PipelineEngine, PipelineEvent, PipelineState,
    QueueLevel, StageProperty, StateChange,
};

const PIPELINE_NAME: &str = "gplayer";

pub struct GstEngine {
    pipeline: Option<gst::Pipeline>,
    elements: HashMap<String, gst::Element>,
    chains: Vec<ChainStages>,
    selector_pads: HashMap<ChainId, gst::Pad>,
}

impl GstEngine {
    pub fn new() -> Result<Self, EngineError> {
        gst::init().map_err(|e| EngineError::Init(e.to_string()))?;
        Ok(Self {
            pipeline: None,
            elements: HashMap::new(),
            chains: Vec::new(),
            selector_pads: HashMap::new(),
        })
    }

    fn element(&self, name: &str) -> Result<&gst::Element, EngineError> {
        self.elements
            .get(name)
            .ok_or_else(|| EngineError::UnknownStage(name.to_string()))
    }

    fn pipeline(&self) -> Result<&gst::Pipeline, EngineError> {
        self.pipeline.as_ref().ok_or(EngineError::NoGraph)
    }
}

impl std::fmt::Debug for GstEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GstEngine")
            .field("built", &self.pipeline.is_some())
            .field("stages", &self.elements.len())
            .finish()
    }
}

fn to_gst(state: PipelineState) -> gst::State {
    match state {
        PipelineState::Null => gst::State::Null,
        PipelineState::Ready => gst::State::Ready,
        PipelineState::Paused => gst::State::Paused,
        PipelineState::Playing => gst::State::Playing,
    }
}

fn from_gst(state: gst::State) -> PipelineState {
    match state {
        gst::State::Ready => PipelineState::Ready,
        gst::State::Paused => PipelineState::Paused,
        gst::State::Playing => PipelineState::Playing,
        _ => PipelineState::Null,
    }
}

fn make_stage(name: &str, kind: &StageKind) -> Result<gst::Element, EngineError> {
    let built = match kind {
        StageKind::UriSource { uri } => gst::ElementFactory::make("uridecodebin")
            .name(name)
            .property("uri", uri.as_str())
            .build(),
        StageKind::PreBuffer {
            max_bytes,
            low_percent,
        } => gst::ElementFactory::make("queue2")
            .name(name)
            .property("max-size-bytes", (*max_bytes).min(u32::MAX as u64) as u32)
            .property("max-size-buffers", 0u32)
            .property("max-size-time", 0u64)
            .property("low-watermark", *low_percent as f64 / 100.0)
            .build(),
        StageKind::Gate {
            drop_probability,
            sync,
        } => gst::ElementFactory::make("identity")
            .name(name)
            .property("drop-probability", *drop_probability)
            .property("sync", *sync)
            .build(),
        StageKind::Selector => gst::ElementFactory::make("input-selector").name(name).build(),
        StageKind::Convert => gst::ElementFactory::make("audioconvert").name(name).build(),
        StageKind::Resample => gst::ElementFactory::make("audioresample").name(name).build(),
        StageKind::Volume => gst::ElementFactory::make("volume").name(name).build(),
        StageKind::Sink => gst::ElementFactory::make("autoaudiosink").name(name).build(),
    };
    built.map_err(|e| EngineError::StageCreation {
        stage: name.to_string(),
        reason: e.to_string(),
    })
}

/// Translate a bus message; `None` for messages the controller ignores.
fn translate(msg: &gst::Message) -> Option<PipelineEvent> {
    use gst::MessageView;

    match msg.view() {
        MessageView::Eos(..) => Some(PipelineEvent::Eos),
        MessageView::Error(err) => {
            let src = msg
                .src()
                .map(|s| s.path_string().to_string())
                .unwrap_or_default();
            tracing::debug!(src = %src, debug = ?err.debug(), "bus error");
            Some(PipelineEvent::Error {
                message: err.error().to_string(),
            })
        }
        MessageView::StateChanged(sc) => {
            let from_pipeline = msg.src().is_some_and(|s| s.name() == PIPELINE_NAME);
            from_pipeline.then(|| PipelineEvent::StateChanged {
                old: from_gst(sc.old()),
                new: from_gst(sc.current()),
            })
        }
        MessageView::ClockLost(..) => Some(PipelineEvent::ClockLost),
        MessageView::Buffering(b) => Some(PipelineEvent::Buffering {
            percent: b.percent().clamp(0, 100) as u8,
        }),
        MessageView::DurationChanged(..) => Some(PipelineEvent::DurationChanged),
        MessageView::Tag(tag) => {
            let tags = tag.tags();
            tags.get::<gst::tags::Title>()
                .map(|title| PipelineEvent::Tag {
                    text: title.get().to_string(),
                })
        }
        _ => None,
    }
}

/// Complete the dynamic link of a decoded source pad, rejecting non-audio pads.
fn link_source_pad(
    pad: &gst::Pad,
    target: &gst::Element,
    chain: ChainId,
    events: &EventSink,
) {
    let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
    let is_audio = caps
        .structure(0)
        .is_some_and(|s| s.name().as_str().starts_with("audio/"));
    if !is_audio {
        tracing::debug!(?chain, caps = %caps, "ignoring non-audio pad");
        return;
    }
    let Some(sink_pad) = target.static_pad("sink") else {
        events.post(PipelineEvent::PadLinkFailed {
            chain,
            reason: "downstream stage has no sink pad".to_string(),
        });
        return;
    };
    if sink_pad.is_linked() {
        return;
    }
    if let Ok(info) = gst_audio::AudioInfo::from_caps(&caps) {
        events.post(PipelineEvent::AudioFormat(AudioFormat {
            sample_rate: info.rate(),
            channels: info.channels() as u16,
            bit_width: info.width() as u16,
        }));
    }
    match pad.link(&sink_pad) {
        Ok(_) => {
            events.post(PipelineEvent::PadLinked { chain });
        }
        Err(err) => {
            events.post(PipelineEvent::PadLinkFailed {
                chain,
                reason: format!("{err:?}"),
            });
        }
    }
}

impl PipelineEngine for GstEngine {
    fn build(&mut self, spec: &GraphSpec, events: EventSink) -> Result<(), EngineError> {
        self.teardown();
        let pipeline = gst::Pipeline::with_name(PIPELINE_NAME);

        let mut elements = HashMap::new();
        for stage in &spec.stages {
            let element = make_stage(&stage.name, &stage.kind)?;
            pipeline
                .add(&element)
                .map_err(|e| EngineError::StageCreation {
                    stage: stage.name.clone(),
                    reason: e.to_string(),
                })?;
            elements.insert(stage.name.clone(), element);
        }

        let mut selector_pads = HashMap::new();
        for link in spec.links.iter().filter(|l| l.kind == LinkKind::Static) {
            let link_err = |reason: String| EngineError::Link {
                from: link.from.clone(),
                to: link.to.clone(),
                reason,
            };
            let from = elements
                .get(&link.from)
                .ok_or_else(|| EngineError::UnknownStage(link.from.clone()))?;
            let to = elements
                .get(&link.to)
                .ok_or_else(|| EngineError::UnknownStage(link.to.clone()))?;
            if link.to == SELECTOR {
                let src = from
                    .static_pad("src")
                    .ok_or_else(|| link_err("no src pad".to_string()))?;
                let sink = to
                    .request_pad_simple("sink_%u")
                    .ok_or_else(|| link_err("selector refused a sink pad".to_string()))?;
                src.link(&sink).map_err(|e| link_err(format!("{e:?}")))?;
                if let Some(chain) = spec
                    .chains
                    .iter()
                    .find(|c| c.gate.as_deref() == Some(link.from.as_str()))
                {
                    selector_pads.insert(chain.id, sink);
                }
            } else {
                from.link(to).map_err(|e| link_err(e.to_string()))?;
            }
        }

        for chain in &spec.chains {
            let Some(target_name) = spec.dynamic_target(&chain.source) else {
                continue;
            };
            let source = elements
                .get(&chain.source)
                .ok_or_else(|| EngineError::UnknownStage(chain.source.clone()))?;
            let target_weak = elements
                .get(target_name)
                .ok_or_else(|| EngineError::UnknownStage(target_name.to_string()))?
                .downgrade();
            let chain_id = chain.id;
            let pad_events = events.clone();
            source.connect_pad_added(move |_src, pad| {
                if let Some(target) = target_weak.upgrade() {
                    link_source_pad(pad, &target, chain_id, &pad_events);
                }
            });
        }

        if let Some(selector) = elements.get(SELECTOR) {
            if let Some(pad) = selector_pads.get(&ChainId::Primary) {
                selector.set_property("active-pad", pad.to_value());
            }
        }

        let bus = pipeline
            .bus()
            .ok_or_else(|| EngineError::Init("pipeline has no bus".to_string()))?;
        bus.set_sync_handler(move |_bus, msg| {
            if let Some(event) = translate(msg) {
                events.post(event);
            }
            gst::BusSyncReply::Drop
        });

        self.pipeline = Some(pipeline);
        self.elements = elements;
        self.chains = spec.chains.clone();
        self.selector_pads = selector_pads;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
            if let Some(bus) = pipeline.bus() {
                bus.unset_sync_handler();
            }
        }
        self.elements.clear();
        self.chains.clear();
        self.selector_pads.clear();
    }

    fn set_state(&mut self, state: PipelineState) -> Result<StateChange, EngineError> {
        let pipeline = self.pipeline()?;
        match pipeline.set_state(to_gst(state)) {
            Ok(gst::StateChangeSuccess::Success) => Ok(StateChange::Success),
            Ok(gst::StateChangeSuccess::Async) => Ok(StateChange::Async),
            Ok(gst::StateChangeSuccess::NoPreroll) => Ok(StateChange::NoPreroll),
            Err(err) => Err(EngineError::StateChange {
                state,
                reason: err.to_string(),
            }),
        }
    }

    fn set_chain_state(
        &mut self,
        chain: ChainId,
        state: PipelineState,
    ) -> Result<StateChange, EngineError> {
        let stages = self
            .chains
            .iter()
            .find(|c| c.id == chain)
            .cloned()
            .ok_or(EngineError::NoGraph)?;
        let mut outcome = StateChange::Success;
        for name in [&stages.source, &stages.prebuffer] {
            let element = self.element(name)?;
            match element.set_state(to_gst(state)) {
                Ok(gst::StateChangeSuccess::Async) => outcome = StateChange::Async,
                Ok(gst::StateChangeSuccess::NoPreroll) => outcome = StateChange::NoPreroll,
                Ok(_) => {}
                Err(err) => {
                    return Err(EngineError::StateChange {
                        state,
                        reason: format!("{name}: {err}"),
                    });
                }
            }
        }
        Ok(outcome)
    }

    fn position_ns(&self) -> Option<u64> {
        self.pipeline
            .as_ref()?
            .query_position::<gst::ClockTime>()
            .map(|t| t.nseconds())
    }

    fn duration_ns(&self) -> Option<u64> {
        self.pipeline
            .as_ref()?
            .query_duration::<gst::ClockTime>()
            .map(|t| t.nseconds())
    }

    fn queue_level(&self, chain: ChainId) -> Option<QueueLevel> {
        let stages = self.chains.iter().find(|c| c.id == chain)?;
        let queue = self.elements.get(&stages.prebuffer)?;
        Some(QueueLevel {
            current_bytes: queue.property::<u32>("current-level-bytes") as u64,
            max_bytes: queue.property::<u32>("max-size-bytes") as u64,
            current_buffers: queue.property::<u32>("current-level-buffers"),
            max_buffers: queue.property::<u32>("max-size-buffers"),
        })
    }

    fn set_property(&mut self, stage: &str, property: StageProperty) -> Result<(), EngineError> {
        let element = self.element(stage)?;
        match property {
            StageProperty::MaxSizeBytes(bytes) => {
                element.set_property("max-size-bytes", bytes.min(u32::MAX as u64) as u32)
            }
            StageProperty::DropProbability(p) => {
                element.set_property("drop-probability", p.clamp(0.0, 1.0))
            }
            StageProperty::Sync(sync) => element.set_property("sync", sync),
            StageProperty::Volume(v) => element.set_property("volume", v),
            StageProperty::ActiveInput(chain) => {
                let pad = self.selector_pads.get(&chain).ok_or_else(|| {
                    EngineError::Property {
                        stage: stage.to_string(),
                        reason: format!("no selector pad for {chain:?}"),
                    }
                })?;
                element.set_property("active-pad", pad.to_value());
            }
        }
        tracing::trace!(stage, ?property, "stage property set");
        Ok(())
    }

    fn seek(&mut self, position_ns: u64) -> Result<(), EngineError> {
        self.pipeline()?
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::from_nseconds(position_ns),
            )
            .map_err(|e| EngineError::Seek(e.to_string()))
    }
}

impl Drop for GstEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
