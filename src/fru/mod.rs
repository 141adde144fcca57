//! Per-disk-position I/O: fruts descriptors, chains, and resource planning
//!
//! A fruts is one pending or completed I/O against a single disk position.
//! A siots owns one fruts chain per role (read, second read, write) and
//! dispatches the chain through the [`DiskEdge`] below it. Before any fruts
//! exists, the resource planner in [`info`] sizes buffers and scatter-gather
//! lists for the whole operation.

pub mod fruts;
pub mod info;

#[cfg(test)]
mod proptest;

pub use fruts::{Fruts, FrutsChain, FrutsResult, Opcode, SuccessQualifier};
pub use info::{FruInfo, ResourcePlan, SG_BUCKET_CAPACITIES};

use crate::error::Result;

/// Asynchronous per-position I/O submission boundary.
///
/// `submit` returns an error only on a synchronous submission failure;
/// completions arrive later and are injected into the owning state machine
/// by whoever drives the edge.
pub trait DiskEdge {
    fn submit(&mut self, fruts: &Fruts) -> Result<()>;
}
