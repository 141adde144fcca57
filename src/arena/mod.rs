//! Buffer arena contract and allocation tracking
//!
//! State machines never own their buffer pool; they borrow an [`Arena`]
//! through the step context. An allocation either completes immediately or
//! goes pending, in which case the owner delivers the grant later and the
//! machine resumes from its allocate-wait state.
//!
//! [`TrackingArena`] wraps any inner arena with per-allocation accounting so
//! leaked grants are visible in tests and diagnostics.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::geometry::BlockCount;

// =============================================================================
// Allocation contract
// =============================================================================

/// A delivered buffer allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferGrant {
    /// Arena-unique allocation id, used for release and tracking
    pub id: u64,
    /// Number of blocks backed by this grant
    pub blocks: BlockCount,
}

/// Ticket for an allocation that could not complete synchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocTicket {
    pub id: u64,
    pub blocks: BlockCount,
}

/// Outcome of an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    /// The arena satisfied the request inline
    Immediate(BufferGrant),
    /// The arena will deliver the grant later; the requester must park
    Pending(AllocTicket),
}

/// Deferred-completion buffer allocator.
///
/// Each request is independent and self-contained; the arena's own
/// accounting is the only shared state, held only for O(1) bookkeeping.
pub trait Arena {
    /// Request `blocks` worth of buffer pages
    fn allocate(&self, blocks: BlockCount) -> Result<AllocOutcome>;

    /// Return a grant to the pool
    fn release(&self, grant: BufferGrant);
}

// =============================================================================
// Immediate arena
// =============================================================================

/// Arena that always satisfies requests inline.
///
/// The termination properties of every state machine are checked against
/// this arena; it can also be configured to fail a specific request.
#[derive(Debug, Default)]
pub struct ImmediateArena {
    next_id: AtomicU64,
    /// When set, the request with this ordinal (0-based) fails
    fail_request: Option<u64>,
    requests: AtomicU64,
}

impl ImmediateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena that fails the `n`th allocation request (0-based)
    pub fn failing_at(n: u64) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            fail_request: Some(n),
            requests: AtomicU64::new(0),
        }
    }
}

impl Arena for ImmediateArena {
    fn allocate(&self, blocks: BlockCount) -> Result<AllocOutcome> {
        let ordinal = self.requests.fetch_add(1, Ordering::Relaxed);
        if self.fail_request == Some(ordinal) {
            return Err(Error::AllocationFailed {
                blocks,
                reason: "arena exhausted".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(AllocOutcome::Immediate(BufferGrant { id, blocks }))
    }

    fn release(&self, _grant: BufferGrant) {}
}

// =============================================================================
// Tracking arena
// =============================================================================

/// Snapshot of arena accounting, serializable for diagnostics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ArenaStats {
    pub total_allocations: u64,
    pub total_releases: u64,
    pub outstanding_allocations: u64,
    pub outstanding_blocks: u64,
    pub peak_outstanding_blocks: u64,
}

#[derive(Debug, Clone, Copy)]
struct AllocationRecord {
    blocks: BlockCount,
}

/// Leak-detecting wrapper around any [`Arena`].
///
/// Keeps one record per outstanding grant keyed by allocation id, plus
/// running totals. Injected wherever the process wants outstanding-
/// allocation diagnostics instead of a process-wide static table.
pub struct TrackingArena<A: Arena> {
    inner: A,
    outstanding: DashMap<u64, AllocationRecord>,
    stats: Mutex<ArenaStats>,
}

impl<A: Arena> TrackingArena<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            outstanding: DashMap::new(),
            stats: Mutex::new(ArenaStats::default()),
        }
    }

    /// Current accounting snapshot
    pub fn stats(&self) -> ArenaStats {
        *self.stats.lock()
    }

    /// Ids of grants that were never released
    pub fn leaked_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.outstanding.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn record_grant(&self, id: u64, blocks: BlockCount) {
        self.outstanding.insert(id, AllocationRecord { blocks });
        let mut stats = self.stats.lock();
        stats.total_allocations += 1;
        stats.outstanding_allocations += 1;
        stats.outstanding_blocks += blocks;
        stats.peak_outstanding_blocks = stats.peak_outstanding_blocks.max(stats.outstanding_blocks);
    }
}

impl<A: Arena> Arena for TrackingArena<A> {
    fn allocate(&self, blocks: BlockCount) -> Result<AllocOutcome> {
        let outcome = self.inner.allocate(blocks)?;
        match outcome {
            AllocOutcome::Immediate(grant) => self.record_grant(grant.id, grant.blocks),
            AllocOutcome::Pending(ticket) => self.record_grant(ticket.id, ticket.blocks),
        }
        Ok(outcome)
    }

    fn release(&self, grant: BufferGrant) {
        if let Some((_, record)) = self.outstanding.remove(&grant.id) {
            let mut stats = self.stats.lock();
            stats.total_releases += 1;
            stats.outstanding_allocations = stats.outstanding_allocations.saturating_sub(1);
            stats.outstanding_blocks = stats.outstanding_blocks.saturating_sub(record.blocks);
        }
        self.inner.release(grant);
    }
}

// =============================================================================
// Tests
// =============================================================================
