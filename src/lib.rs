//! StripeGuard - Parity RAID Recovery-Verify Core
//!
//! The state-machine core of a parity RAID group's verify, recovery, and
//! small-read paths: cooperative per-stripe-range machines that read a
//! stripe, validate checksums and coherency through a pluggable XOR
//! engine, reconstruct what redundancy allows, invalidate what it does
//! not, and report everything through deduplicated log events.
//!
//! # Architecture
//!
//! One siots per in-flight stripe range; parallelism is many independent
//! machines, never threads inside one:
//!
//! ```text
//! request ──▶ Siots ──▶ Fru Planner ──▶ Arena ──▶ fruts chain ──▶ disks
//!               │                                      │
//!               │◀──────────── Eboard ◀── completions ─┘
//!               ▼
//!          XOR engine ──▶ error regions ──▶ event reporting
//! ```
//!
//! # Modules
//!
//! - [`geometry`] - RAID geometry and position bitmaps
//! - [`arena`] - Deferred-completion buffer allocator boundary
//! - [`fru`] - Per-disk I/O descriptors and the resource planner
//! - [`eboard`] - Per-position error classification
//! - [`xor`] - Checksum, coherency, and reconstruction engine
//! - [`siots`] - The verify, small-read, and check-zeroed state machines
//! - [`report`] - Error-region and eboard event reporting
//! - [`error`] - Error types

pub mod arena;
pub mod eboard;
pub mod error;
pub mod fru;
pub mod geometry;
pub mod report;
pub mod siots;
pub mod xor;

// Re-export commonly used types
pub use arena::{AllocOutcome, Arena, BufferGrant, ImmediateArena, TrackingArena};
pub use eboard::FruEboard;
pub use error::{Error, Result};
pub use fru::{DiskEdge, Fruts, FrutsChain, FrutsResult, Opcode, ResourcePlan};
pub use geometry::{BlockCount, Lba, PositionBitmap, RaidGeometry};
pub use report::{EventKind, EventRecord, EventSink, RecordingSink, Severity, TracingSink};
pub use siots::{
    Algorithm, CheckZeroedCompletion, CheckZeroedMachine, ChainRole, RecoveryHandoff,
    RequestOpcode, Siots, SmallReadCompletion, SmallReadMachine, StateStatus, StepCtx,
    VerifyCompletion, VerifyMachine,
};
pub use xor::{ErrorRegion, ErrorRegionList, RowParityEngine, Strip, XorEngine, XorStatus};
