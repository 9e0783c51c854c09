//! The execution-block cache: translated blocks keyed by guest address,
//! with deferred-flush invalidation.
//!
//! Grounded on QBDI's `ExecBlockManager` (`src/ExecBlock/ExecBlockManager.h`):
//! invalidating a range while a block is executing cannot free that
//! block's memory out from under the running trampoline, so invalidation
//! is split into "mark pending" (safe at any time) and "commit" (only
//! called by the engine at a safe point between block executions). The
//! teacher crate's `Interpreter::receipts`/append-only storage pattern
//! informed keeping `blocks` append-only and referencing entries by a
//! generation-checked handle rather than relocating them in a `Vec`.

use alloc::vec::Vec;

use crate::{
    exec_block::ExecBlock,
    range::{GuestAddr, Range, RangeSet},
};

/// A reference to a cached block, checked against a generation counter so
/// a handle obtained before a flush can't silently resolve to an unrelated
/// block that was later built in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    index: usize,
    generation: u64,
}

struct Slot {
    block: Option<ExecBlock>,
    generation: u64,
}

/// The execution-block cache.
pub struct ExecBlockManager {
    slots: Vec<Slot>,
    by_start: hashbrown::HashMap<GuestAddr, usize>,
    pending_invalidations: RangeSet<GuestAddr>,
    flush_pending: bool,
}

impl Default for ExecBlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecBlockManager {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_start: hashbrown::HashMap::new(),
            pending_invalidations: RangeSet::new(),
            flush_pending: false,
        }
    }

    /// Look up the block translated from `addr`, if cached and not
    /// pending invalidation.
    pub fn lookup(&self, addr: GuestAddr) -> Option<(BlockHandle, &ExecBlock)> {
        let &index = self.by_start.get(&addr)?;
        let slot = &self.slots[index];
        let block = slot.block.as_ref()?;
        if self
            .pending_invalidations
            .overlaps(&Range::new(block.guest_start, block.guest_end))
        {
            return None;
        }
        Some((
            BlockHandle {
                index,
                generation: slot.generation,
            },
            block,
        ))
    }

    /// Resolve a previously obtained handle, returning `None` if the slot
    /// has since been flushed (stale generation) or emptied.
    pub fn resolve(&self, handle: BlockHandle) -> Option<&ExecBlock> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.block.as_ref()
    }

    /// Insert a freshly built block, returning a handle to it.
    pub fn insert(&mut self, block: ExecBlock) -> BlockHandle {
        let start = block.guest_start;
        let index = self.slots.len();
        self.slots.push(Slot {
            block: Some(block),
            generation: 0,
        });
        self.by_start.insert(start, index);
        BlockHandle {
            index,
            generation: 0,
        }
    }

    /// Mark `range` for invalidation. Safe to call at any time, including
    /// from within a callback invoked mid-execution: the actual eviction
    /// is deferred to [`Self::commit_pending_invalidations`], so a block
    /// currently executing is never freed out from under itself.
    ///
    /// From the moment this returns, [`Self::lookup`] stops returning
    /// blocks overlapping `range`, even though their memory is not yet
    /// reclaimed.
    pub fn invalidate_range(&mut self, range: Range<GuestAddr>) {
        self.pending_invalidations.add(range);
        self.flush_pending = true;
    }

    /// Mark every cached block for invalidation.
    pub fn invalidate_all(&mut self) {
        for slot in &self.slots {
            if let Some(block) = &slot.block {
                self.pending_invalidations
                    .add(Range::new(block.guest_start, block.guest_end));
            }
        }
        self.flush_pending = true;
    }

    /// `true` if a flush has been requested and not yet committed. The
    /// engine checks this once per run-loop iteration, between block
    /// executions, and calls [`Self::commit_pending_invalidations`] when
    /// it's set.
    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Evict every block overlapping a pending invalidation range, and
    /// clear the pending set. Must only be called when no block is
    /// currently executing.
    pub fn commit_pending_invalidations(&mut self) {
        if !self.flush_pending {
            return;
        }
        let starts: Vec<GuestAddr> = self.by_start.keys().copied().collect();
        for start in starts {
            let index = self.by_start[&start];
            let overlaps = self.slots[index]
                .block
                .as_ref()
                .is_some_and(|block| {
                    self.pending_invalidations
                        .overlaps(&Range::new(block.guest_start, block.guest_end))
                });
            if overlaps {
                self.by_start.remove(&start);
                let slot = &mut self.slots[index];
                slot.block = None;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.pending_invalidations.clear();
        self.flush_pending = false;
    }

    /// Number of live (non-evicted) cached blocks.
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    /// `true` if no blocks are cached.
    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec_block::ExecBlock;

    #[test]
    fn invalidation_is_deferred_until_committed() {
        let mut mgr = ExecBlockManager::new();
        mgr.insert(ExecBlock::empty(0x1000));
        assert!(mgr.lookup(0x1000).is_some());

        mgr.invalidate_range(Range::new(0x1000, 0x1010));
        assert!(mgr.flush_pending());
        assert!(
            mgr.lookup(0x1000).is_none(),
            "lookup must stop serving a pending-invalidated block immediately"
        );

        mgr.commit_pending_invalidations();
        assert!(!mgr.flush_pending());
        assert!(mgr.is_empty());
    }

    #[test]
    fn stale_handle_does_not_resolve_after_flush() {
        let mut mgr = ExecBlockManager::new();
        let handle = mgr.insert(ExecBlock::empty(0x2000));
        mgr.invalidate_range(Range::new(0x2000, 0x2010));
        mgr.commit_pending_invalidations();
        assert!(mgr.resolve(handle).is_none());
    }

    #[test]
    fn invalidation_evicts_blocks_overlapping_only_their_body() {
        // A block spanning [0x3000, 0x3020) whose start address itself
        // falls outside the invalidated range: eviction must key off the
        // block's full covered range, not just the address it's indexed
        // under.
        let mut block = ExecBlock::empty(0x3000);
        block.guest_end = 0x3020;
        let mut mgr = ExecBlockManager::new();
        mgr.insert(block);
        assert!(mgr.lookup(0x3000).is_some());

        mgr.invalidate_range(Range::new(0x3010, 0x3015));
        assert!(
            mgr.lookup(0x3000).is_none(),
            "a range overlapping only the block's body must still invalidate it"
        );

        mgr.commit_pending_invalidations();
        assert!(mgr.is_empty());
    }
}
