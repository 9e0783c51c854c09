//! Engine error taxonomy.
//!
//! Recoverable conditions (invalid registration, invalid state access, cache
//! inconsistency, broker refusal) never produce an [`EngineError`]; they are
//! reported through the return value of the operation that hit them
//! (`INVALID_EVENTID`, `None`, `false`, a dropped record) and logged via
//! `tracing`. Only conditions the engine cannot recover from — a decoder
//! failure, no matching patch rule, an arena allocation failure, or an
//! internal invariant violation — become an `Err`.

use alloc::string::String;

use crate::range::GuestAddr;

/// Top-level error returned by fallible engine operations.
#[derive(Debug, derive_more::Display)]
pub enum EngineError {
    /// The assembler facade failed to decode an instruction while
    /// translating a basic block starting at the given address.
    #[display(fmt = "failed to decode guest instruction at {_0:#x}")]
    Decode(GuestAddr),
    /// No patch rule in the architecture's rule table matched a decoded
    /// instruction. Per spec this is treated as an implementation bug, not
    /// a user error, but it is still reported through the `Err` channel
    /// rather than aborting the process.
    #[display(fmt = "no patch rule matched the instruction at {_0:#x}")]
    NoMatchingPatchRule(GuestAddr),
    /// Allocating the RX or RW arena for a new `ExecBlock` failed.
    #[display(fmt = "failed to allocate execution block arena: {_0}")]
    Alloc(String),
    /// An internal invariant was violated; the engine is now poisoned and
    /// must not be used further.
    #[display(fmt = "internal invariant violated: {_0}")]
    Bug(Bug),
}

impl EngineError {
    /// `true` for errors that leave the engine in a well-defined, usable
    /// state (currently none: every [`EngineError`] poisons the engine).
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EngineError {}

/// An internal invariant violation, carrying the specific invariant that
/// broke so logs and tests can distinguish failure modes without parsing a
/// message string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "{variant}")]
pub struct Bug {
    /// Which invariant was violated.
    pub variant: BugVariant,
}

impl Bug {
    /// Construct a new [`Bug`] for the given variant.
    pub const fn new(variant: BugVariant) -> Self {
        Self { variant }
    }
}

impl From<BugVariant> for Bug {
    fn from(variant: BugVariant) -> Self {
        Self::new(variant)
    }
}

impl From<BugVariant> for EngineError {
    fn from(variant: BugVariant) -> Self {
        EngineError::Bug(Bug::new(variant))
    }
}

/// Named internal invariants. Each corresponds to an invariant stated
/// explicitly in the design: violating one means the engine's own
/// bookkeeping is wrong, not that the guest program or the embedder misused
/// the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BugVariant {
    /// `BlockManager` handed out a `BlockHandle` whose generation doesn't
    /// match the slot it indexes; a deferred flush raced a lookup.
    #[display(fmt = "stale block handle (generation mismatch)")]
    StaleBlockHandle,
    /// The engine tried to sync register state into a block context that no
    /// block currently owns.
    #[display(fmt = "no execution block is current")]
    NoCurrentExecBlock,
    /// A shadow-slot address tag was not immediately followed by its value
    /// tag (or vice versa) inside the same sequence.
    #[display(fmt = "unpaired memory-access shadow record")]
    UnpairedShadowRecord,
    /// `flush_commit` ran while a block was still marked as executing.
    #[display(fmt = "flush committed while a block was executing")]
    FlushDuringExecution,
    /// A rule marked `merge = true` was the last patch produced for a basic
    /// block; there was no following instruction to merge with.
    #[display(fmt = "dangling merge-pending patch at end of basic block")]
    DanglingMergePatch,
    /// The broker attempted to pop a transfer-hook frame from an empty
    /// stack.
    #[display(fmt = "execution transfer stack underflow")]
    TransferStackUnderflow,
}

#[cfg(feature = "std")]
impl std::error::Error for Bug {}

/// Result of an operation that cannot partially fail: either it produced a
/// value, or the engine is poisoned.
pub type EngineResult<T> = Result<T, EngineError>;
