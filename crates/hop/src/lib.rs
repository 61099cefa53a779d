//! Shared-memory transport for an in-process tracing profiler.
//!
//! An application links this crate in as the *producer*: it creates a
//! named shared-memory segment ([`segment::Segment::create`]), and each
//! thread that calls [`producer::enter`]/[`producer::leave`] lazily
//! acquires a slot in the segment's MPSC [`ring::Ring`] and batches its
//! trace data onto it. A separate consumer process attaches to the same
//! segment ([`segment::Segment::attach`]) and drains the ring; that side
//! lives in the `hop-viewer` crate.
//!
//! Module map:
//! - [`strings`] — string interning and the per-thread string database (C1)
//! - [`ring`] — the MPSC ring buffer (C2)
//! - [`segment`] — the named shared segment the ring lives in (C3)
//! - [`shm`] — the `shm_open`/`mmap` OS layer under `segment`
//! - [`producer`] — per-thread state and the public tracing API (C4/C5)
//! - [`wire`] — message framing and SoA payload codecs (§6)
//! - [`clock`], [`config`], [`error`], [`metrics`] — ambient support
//! - [`backoff`] — spin/yield backoff shared by the ring's CAS loops
//! - [`invariants`] — debug-only correctness assertions

mod backoff;
pub mod clock;
pub mod config;
pub mod error;
mod invariants;
pub mod metrics;
pub mod producer;
pub mod ring;
pub mod segment;
mod shm;
pub mod strings;
pub mod wire;

pub use clock::{ClockSource, Timestamp};
pub use config::{Config, HIGH_THROUGHPUT_CONFIG, LOW_LATENCY_CONFIG};
pub use error::HopError;
pub use metrics::Metrics;
pub use producer::{
    acquire_lock, enter, enter_dynamic, initialize, leave, lock_acquired, release_lock,
    set_thread_name, shutdown,
};
pub use ring::{Reservation, Ring};
pub use segment::Segment;
pub use strings::StrId;
