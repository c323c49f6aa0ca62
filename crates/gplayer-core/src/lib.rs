//! Buffering, state and failover controller for streamed audio playback.
//!
//! The controller owns one pipeline graph per loaded URI and drives it through
//! a [`PipelineEngine`]. Applications interact through [`PlayerHandle`], which
//! forwards commands to a single worker thread and reads a lock-free status
//! snapshot.

pub mod config;
pub mod controller;
pub mod failover;
pub mod graph;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod seek;
pub mod session;
pub mod status;
pub mod worker;

pub use config::PlayerConfig;
pub use controller::Player;
pub use gplayer_types::{AudioFormat, ErrorCode, PipelineState, PlayerEvent, PlayerStatus};
pub use notify::HostCallbacks;
pub use pipeline::sim::{SimControl, SimNetwork, SimulatedEngine};
pub use pipeline::{EngineError, PipelineEngine};
pub use worker::{PlayerCommand, PlayerError, PlayerHandle, spawn_player};

#[cfg(feature = "gstreamer")]
pub use pipeline::gst::GstEngine;
