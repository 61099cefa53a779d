//! Consumer-side intake, spill store, LOD index, timeline navigation and
//! the profiler aggregate for the `hop` tracing profiler.
//!
//! Drives the pull side of the producer/consumer protocol `hop` defines:
//! [`intake::drain`] reads [`hop::segment::Segment`]'s ring and feeds
//! [`profiler::Profiler`], whose per-thread [`thread_timeline::ThreadTimeline`]s
//! hold traces (spilled to disk past budget via [`spill`]), lock-wait and
//! unlock events, and a [`lod::LodIndex`] for constant-cost rendering
//! across zoom levels. [`timeline::Timeline`] tracks the navigation/cursor
//! state a GUI would query against the LOD index.

pub mod error;
pub mod intake;
pub mod lod;
pub mod profiler;
pub mod spill;
pub mod thread_timeline;
pub mod timeline;

pub use error::IntakeError;
pub use lod::{LodIndex, LodInfo};
pub use profiler::{Profiler, Source};
pub use spill::{SpillStore, SpillView};
pub use thread_timeline::ThreadTimeline;
pub use timeline::Timeline;
