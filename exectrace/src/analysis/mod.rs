//! Analysis logic for recorded trace logs
//!
//! This module contains pure business logic for reading trace logs back and
//! aggregating them, separated from the CLI presentation layer.

pub mod hotspot_analyzer;
pub mod replay;

pub use hotspot_analyzer::{analyze_hotspots, FunctionHotspot, HotspotStats};
pub use replay::{Replay, ReplayedSample};
