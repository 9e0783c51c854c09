//! The guest register file and the canonical/live storage discipline.
//!
//! Two copies of `{gpr, fpr}` exist at any time: the *canonical* copy owned
//! by the [`crate::engine::Engine`], and the *live* copy embedded in the
//! currently-executing block's context. Outside of `ExecBlock::execute`,
//! callers read and write through whichever copy is currently active;
//! `setGPRState`/`setFPRState` called from a user callback during execution
//! write the live copy so the block observes the change on resume.
//!
//! Grounded on the teacher crate's register-file conventions
//! (`constraints::reg_key`, `Interpreter::registers`): a flat array of
//! fixed-width integers, no pointers, indexed by a small typed id rather
//! than a bare integer.

use alloc::vec::Vec;

/// A single general-purpose or floating-point register value. Always a
/// fixed-width integer; floating-point registers are carried as their bit
/// pattern.
pub type RegValue = u64;

/// Index of a register within a bank. Distinct from a raw `usize` so GPR
/// and FPR indices can't be confused at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegId(pub u16);

/// Pointer-authentication state, present only on architectures that
/// support it (e.g. AArch64). The core never interprets this; it is
/// forwarded so instrumentation rules and patch rules on those
/// architectures can read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtrAuthState {
    /// Opaque per-architecture authentication code bits.
    pub code: u64,
}

/// The guest register file: general-purpose registers plus a
/// floating-point bank, sized for the architecture the engine was
/// constructed for.
///
/// Every field is a fixed-width integer; there are no pointers, so this
/// type is freely `Clone` and safe to keep two independent copies of (the
/// canonical and live copies described above).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRegisters {
    gpr: Vec<RegValue>,
    fpr: Vec<RegValue>,
    /// Program counter. Kept out of the `gpr` bank so the engine can read
    /// and write it without indexing through an architecture-specific
    /// alias table.
    pub pc: RegValue,
    /// Pointer-authentication state, if the architecture has it.
    pub ptr_auth: Option<PtrAuthState>,
}

impl GuestRegisters {
    /// A zeroed register file with `gpr_count` general-purpose registers
    /// and `fpr_count` floating-point registers.
    pub fn new(gpr_count: usize, fpr_count: usize) -> Self {
        Self {
            gpr: alloc::vec![0; gpr_count],
            fpr: alloc::vec![0; fpr_count],
            pc: 0,
            ptr_auth: None,
        }
    }

    /// Read a general-purpose register.
    pub fn gpr(&self, id: RegId) -> RegValue {
        self.gpr.get(id.0 as usize).copied().unwrap_or(0)
    }

    /// Write a general-purpose register. Out-of-range ids are ignored
    /// rather than panicking: per the error taxonomy, invalid state access
    /// is a logged no-op, not a fatal error.
    pub fn set_gpr(&mut self, id: RegId, value: RegValue) {
        if let Some(slot) = self.gpr.get_mut(id.0 as usize) {
            *slot = value;
        } else {
            tracing::warn!(reg = id.0, "set_gpr: register index out of range");
        }
    }

    /// Read a floating-point register.
    pub fn fpr(&self, id: RegId) -> RegValue {
        self.fpr.get(id.0 as usize).copied().unwrap_or(0)
    }

    /// Write a floating-point register.
    pub fn set_fpr(&mut self, id: RegId, value: RegValue) {
        if let Some(slot) = self.fpr.get_mut(id.0 as usize) {
            *slot = value;
        } else {
            tracing::warn!(reg = id.0, "set_fpr: register index out of range");
        }
    }

    /// Number of general-purpose registers in this file.
    pub fn gpr_count(&self) -> usize {
        self.gpr.len()
    }

    /// Number of floating-point registers in this file.
    pub fn fpr_count(&self) -> usize {
        self.fpr.len()
    }
}

/// Which copy of `{gpr, fpr}` reads and writes should currently target.
///
/// The engine flips this exactly around `ExecBlock::execute`: `Live` while
/// a block is executing (including during any callback it invokes),
/// `Canonical` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStorage {
    /// The engine's own copy, read/written between block executions.
    Canonical,
    /// The copy embedded in the currently-executing block's context.
    Live,
}
