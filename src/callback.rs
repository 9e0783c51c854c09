//! Callback identities, positions, and the events the engine can signal to
//! them.
//!
//! Grounded on QBDI's `Callback.h` (`VMAction`, `InstPosition`, `VMEvent`,
//! `VMState`) almost verbatim — this header *is* the public instrumentation
//! surface the specification distills — carried over in the teacher crate's
//! idiom: `bitflags` for the flag sets (as the teacher does for its own
//! event-shaped enums), plain C-like enums elsewhere, `strum::Display` for
//! logging.

use alloc::string::String;

use crate::{
    consts,
    range::{GuestAddr, Range},
};

/// Identifies one registered callback (an instrumentation rule, a VM event
/// callback, or a memory-range callback) for later deletion.
///
/// The top two bits of the value partition the id space by callback kind so
/// `delete_instrumentation` can dispatch on a bare id without a side table;
/// see the `consts::EVENTID_BAND_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u32);

/// The kind of callback an [`EventId`] refers to, recovered from its band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIdBand {
    /// An instrumentation rule registered via `add_instr_rule` or one of
    /// its convenience wrappers.
    InstrRule,
    /// A VM event callback registered via `add_vm_event_cb`.
    VmEvent,
    /// A memory-range (read/write/access) callback.
    MemRange,
}

impl EventId {
    /// The sentinel returned when registration fails.
    pub const INVALID: EventId = EventId(consts::INVALID_EVENTID);

    /// Construct an id in a given band from a band-local index. Panics if
    /// `index` doesn't fit in the remaining bits; callers are the
    /// engine's own monotonic counters, which never approach that limit in
    /// practice.
    pub(crate) fn new(band: EventIdBand, index: u32) -> Self {
        assert!(
            index & !consts::EVENTID_INDEX_MASK == 0,
            "event id index overflowed its band"
        );
        let band_bits = match band {
            EventIdBand::InstrRule => consts::EVENTID_BAND_INSTR_RULE,
            EventIdBand::VmEvent => consts::EVENTID_BAND_VM_EVENT,
            EventIdBand::MemRange => consts::EVENTID_BAND_MEM_RANGE,
        };
        Self(band_bits | index)
    }

    /// Which band this id was allocated from.
    pub fn band(self) -> EventIdBand {
        match self.0 & consts::EVENTID_BAND_MASK {
            consts::EVENTID_BAND_INSTR_RULE => EventIdBand::InstrRule,
            consts::EVENTID_BAND_VM_EVENT => EventIdBand::VmEvent,
            _ => EventIdBand::MemRange,
        }
    }

    /// `true` if this is the invalid sentinel.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// The raw id value, as handed to callers.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for EventId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// What the engine should do once a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum VMAction {
    /// Resume translated execution normally.
    Continue,
    /// Abort the current sequence and return to the broker, as if a
    /// `STOP` event had fired.
    Stop,
    /// Discard the current basic block's cached translation and
    /// re-translate it before resuming (used by instrumentation that
    /// changed what would be spliced in for this block).
    BreakToVm,
}

/// Where, relative to a guest instruction, an instrumentation callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum InstPosition {
    /// Before the instrumented instruction executes.
    Pre,
    /// After the instrumented instruction executes.
    Post,
}

bitflags::bitflags! {
    /// Engine-lifecycle and block-lifecycle events a [`VMCallback`] can be
    /// registered against.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VMEvent: u32 {
        /// A new basic block is about to be translated.
        const BASIC_BLOCK_NEW = 1 << 0;
        /// Execution is about to transfer into a freshly translated basic
        /// block for the first time.
        const BASIC_BLOCK_ENTRY = 1 << 1;
        /// Execution is leaving a basic block (falling through or via
        /// branch) for the host trampoline.
        const BASIC_BLOCK_EXIT = 1 << 2;
        /// A cached basic block is being evicted or invalidated.
        const BASIC_BLOCK_REMOVED = 1 << 3;
        /// Execution is transferring from native to instrumented, or back.
        const EXEC_TRANSFER_CALL = 1 << 4;
        /// The counterpart return-transfer event.
        const EXEC_TRANSFER_RETURN = 1 << 5;
        /// The run loop is about to process a `Stop` signal.
        const SEQUENCE_ENTRY = 1 << 6;
        /// The run loop finished processing the current sequence.
        const SEQUENCE_EXIT = 1 << 7;
        /// Reserved for a future syscall-entry event. Never raised by this
        /// engine; kept in the bitflag set for ABI stability (see the
        /// "signals during an instrumented run" open question).
        const SYSCALL_ENTRY = 1 << 8;
        /// Reserved counterpart of `SYSCALL_ENTRY`. Never raised.
        const SYSCALL_EXIT = 1 << 9;
        /// Reserved for a future signal-delivery event. Never raised.
        const SIGNAL = 1 << 10;
    }
}

/// A snapshot of why a [`VMCallback`] is firing, passed alongside the
/// current register state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VMState {
    /// The event that triggered this callback invocation.
    pub event: VMEvent,
    /// Address of the basic block the event concerns.
    pub basic_block_addr: GuestAddr,
    /// Size in bytes of that basic block's guest code.
    pub basic_block_size: usize,
    /// Address of the sequence (run of basic blocks translated together)
    /// the event concerns.
    pub sequence_start: GuestAddr,
}

/// A point inside a running [`crate::exec_block::ExecBlock`] where the host
/// trampoline yields back to the engine to run callback dispatch, carried
/// across the [`crate::assembler::CodeAssembler`] boundary so the facade
/// never needs to know which callbacks exist, only that *some* dispatch
/// point was reached.
///
/// Grounded on QBDI's per-instruction callback trampoline: the generated
/// host code doesn't call Rust closures directly (it can't, without the
/// `unsafe` this crate forbids), it calls a fixed trampoline that carries
/// `(address, position)`, and the engine resolves which registered
/// callbacks apply once control returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTrigger {
    /// Address of the instruction this dispatch point was spliced around.
    pub address: GuestAddr,
    /// Where, relative to that instruction, this dispatch point sits.
    pub position: InstPosition,
}

/// Signature of an instrumentation-rule callback: runs at a specific
/// [`InstPosition`] relative to one guest instruction.
pub type InstCallback = alloc::boxed::Box<
    dyn Fn(&mut crate::vm::CallbackContext<'_>) -> VMAction + Send + Sync,
>;

/// Signature of a VM-event callback: runs on engine/block lifecycle events
/// not tied to a single instruction.
pub type VMCallback = alloc::boxed::Box<
    dyn Fn(&mut crate::vm::CallbackContext<'_>, &VMState) -> VMAction + Send + Sync,
>;

/// Signature of a memory-access callback: runs when a shadow-recorded
/// access falls within a registered range.
pub type InstrumentCallback = alloc::boxed::Box<
    dyn Fn(&mut crate::vm::CallbackContext<'_>, &crate::memory_access::MemoryAccess) -> VMAction
        + Send
        + Sync,
>;

/// What a filtered instruction callback matches against, for the
/// `add_code_cb`/`add_code_addr_cb`/`add_code_range_cb`/`add_mnemonic_cb`
/// family (spec §6): these register a plain [`InstCallback`] without going
/// through a full [`crate::rules::InstrRule`], filtered only by address or
/// mnemonic rather than by arbitrary operand shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstFilter {
    /// Matches every instruction (`add_code_cb`).
    All,
    /// Matches only the instruction at this exact address
    /// (`add_code_addr_cb`).
    Address(GuestAddr),
    /// Matches every instruction within this guest range
    /// (`add_code_range_cb`).
    InRange(Range<GuestAddr>),
    /// Matches instructions whose mnemonic equals this string, case
    /// insensitively (`add_mnemonic_cb`). The spec's `"CALL*"`-style
    /// prefix families collapse to an exact match here; this crate's
    /// `CodeAssembler` has no notion of mnemonic wildcards, so a caller
    /// wanting a family match filters again inside the callback body.
    Mnemonic(String),
}

impl InstFilter {
    /// `true` if this filter accepts the instruction at `address` with
    /// the given `mnemonic`. Callers that already know the filter can't be
    /// [`InstFilter::Mnemonic`] may pass an empty `mnemonic` rather than
    /// paying for a lookup; see `Engine::splice_instrumentation`.
    pub fn matches(&self, address: GuestAddr, mnemonic: &str) -> bool {
        match self {
            InstFilter::All => true,
            InstFilter::Address(a) => *a == address,
            InstFilter::InRange(r) => r.contains(address),
            InstFilter::Mnemonic(m) => m.eq_ignore_ascii_case(mnemonic),
        }
    }

    /// `true` if matching this filter ever requires a mnemonic lookup.
    pub fn needs_mnemonic(&self) -> bool {
        matches!(self, InstFilter::Mnemonic(_))
    }
}

/// A registered callback, in whichever of the three shapes it was added as,
/// along with the bookkeeping needed to splice or invoke it.
pub enum CallbackRegistration {
    /// An instrumentation-rule callback, filtered by mnemonic or address
    /// range at registration time.
    Instruction {
        /// Where it runs relative to the matched instruction.
        position: InstPosition,
        /// Which instructions this callback applies to.
        filter: InstFilter,
        /// The callback body.
        callback: InstCallback,
    },
    /// A VM-event callback.
    Event {
        /// Which events it fires on.
        events: VMEvent,
        /// The callback body.
        callback: VMCallback,
    },
    /// A memory-range callback.
    MemoryRange {
        /// The guest range it watches.
        range: crate::range::Range<GuestAddr>,
        /// Which access types it watches.
        access_type: crate::memory_access::MemoryAccessType,
        /// The callback body.
        callback: InstrumentCallback,
    },
}
