//! The execution broker: decides, at every control-flow transfer, whether
//! the destination should run instrumented or native.
//!
//! Grounded on QBDI's `ExecBroker` (`src/ExecBroker/ExecBroker.h`):
//! maintains the set of guest ranges under instrumentation and a small
//! table of transfer "shellcodes" (trampolines) bridging host-native and
//! translated execution; generalized here to a plain decision function
//! plus a pluggable transfer hook, since the actual trampoline bytes are
//! an assembler-facade concern. The teacher crate's `ecal`-handler
//! indirection (`interpreter::ecal`) grounds keeping the transfer hook as
//! a boxed trait object the broker calls rather than matching on an enum.

use alloc::boxed::Box;

use crate::range::{GuestAddr, Range, RangeSet};

/// Why execution is transferring between native and instrumented code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReason {
    /// A call instruction's target lies outside the instrumented set.
    Call,
    /// A return is unwinding into a frame outside the instrumented set.
    Return,
    /// A jump (not a call) crosses the instrumented boundary.
    Jump,
}

/// Handles the actual native/instrumented hand-off: saving/restoring host
/// state and jumping. Out of scope for this crate in the same way
/// [`crate::assembler::CodeAssembler::execute_block`] is: the real
/// implementation needs `unsafe` and architecture-specific calling
/// convention knowledge neither of which this crate provides itself.
pub trait TransferHandler {
    /// Perform the transfer, returning once native execution (if any)
    /// returns control back to the engine, or `None` if this transfer
    /// doesn't return (a tail call, `exit`).
    fn transfer(
        &self,
        reason: TransferReason,
        target: GuestAddr,
        registers: &mut crate::registers::GuestRegisters,
    ) -> Option<GuestAddr>;

    /// `true` if this handler is willing to take the transfer at all. Runs
    /// before [`Self::transfer`] is ever called, so a handler can refuse a
    /// target (e.g. one outside a sandboxed region) without side effects.
    /// Default `true`: most handlers accept every transfer they're asked
    /// to perform.
    fn can_transfer(&self, _reason: TransferReason, _target: GuestAddr) -> bool {
        true
    }
}

/// Tracks which guest ranges run instrumented, and dispatches transfers at
/// the boundary between them and everything else.
#[derive(Default)]
pub struct ExecBroker {
    instrumented: RangeSet<GuestAddr>,
    handler: Option<Box<dyn TransferHandler>>,
}

impl ExecBroker {
    /// A broker instrumenting nothing, with no transfer handler attached.
    pub fn new() -> Self {
        Self {
            instrumented: RangeSet::new(),
            handler: None,
        }
    }

    /// Attach the handler used for actual native/instrumented hand-off.
    pub fn set_transfer_handler(&mut self, handler: Box<dyn TransferHandler>) {
        self.handler = Some(handler);
    }

    /// Add `range` to the instrumented set.
    pub fn add_instrumented_range(&mut self, range: Range<GuestAddr>) {
        self.instrumented.add(range);
    }

    /// Remove `range` from the instrumented set.
    pub fn remove_instrumented_range(&mut self, range: Range<GuestAddr>) {
        self.instrumented.remove(range);
    }

    /// Remove every range from the instrumented set.
    pub fn remove_all_instrumented_ranges(&mut self) {
        self.instrumented.clear();
    }

    /// `true` if `addr` falls within an instrumented range.
    pub fn is_instrumented(&self, addr: GuestAddr) -> bool {
        self.instrumented.contains(addr)
    }

    /// The instrumented ranges, for `VM::get_instrumented_range`-style
    /// queries.
    pub fn instrumented_ranges(&self) -> &RangeSet<GuestAddr> {
        &self.instrumented
    }

    /// `true` if control can continue running instrumented after landing
    /// at `target` for `reason`. When `false`, the engine must call
    /// [`Self::transfer_execution`] instead of re-entering the
    /// translation pipeline.
    pub fn can_continue_instrumented(&self, target: GuestAddr) -> bool {
        self.is_instrumented(target)
    }

    /// `true` if the broker can attempt a transfer to `target` for
    /// `reason` at all. A DBI build with no transfer handler attached has
    /// nowhere to send a transfer, so this is the structural gate spec.md
    /// §4.6 names — distinct from [`Self::transfer_execution`] returning
    /// `None`, which means a handler ran but declined to resume, not that
    /// no transfer was attempted.
    ///
    /// With no handler attached this returns `true`: the engine still
    /// needs to signal the transfer event and stop the run, it just has
    /// nothing to hand control off to. With a handler attached, this
    /// delegates to [`TransferHandler::can_transfer`].
    pub fn can_transfer_execution(&self, reason: TransferReason, target: GuestAddr) -> bool {
        match &self.handler {
            Some(handler) => handler.can_transfer(reason, target),
            None => true,
        }
    }

    /// Hand execution off to native code at `target`, returning the guest
    /// address execution should resume translating from once native code
    /// returns (or `None` if it doesn't return).
    ///
    /// Requires a transfer handler to have been attached; without one this
    /// is a logged no-op returning `None`, since a DBI build running with
    /// no native escape configured has nothing sensible to do but stop.
    pub fn transfer_execution(
        &self,
        reason: TransferReason,
        target: GuestAddr,
        registers: &mut crate::registers::GuestRegisters,
    ) -> Option<GuestAddr> {
        match &self.handler {
            Some(handler) => handler.transfer(reason, target, registers),
            None => {
                tracing::warn!(
                    target,
                    ?reason,
                    "transfer_execution: no transfer handler attached"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrumented_ranges_gate_continuation() {
        let mut broker = ExecBroker::new();
        broker.add_instrumented_range(Range::new(0x1000, 0x2000));
        assert!(broker.can_continue_instrumented(0x1500));
        assert!(!broker.can_continue_instrumented(0x2500));
    }

    #[test]
    fn transfer_without_handler_returns_none() {
        let broker = ExecBroker::new();
        let mut regs = crate::registers::GuestRegisters::new(4, 4);
        assert_eq!(
            broker.transfer_execution(TransferReason::Call, 0xdead, &mut regs),
            None
        );
    }
}
