//! Engine-wide configuration.
//!
//! Grounded on QBDI's per-architecture `Options.h` bitmasks
//! (`original_source/include/QBDI/arch/*/Options.h`): a small set of
//! engine-wide toggles, represented as a `bitflags` set the way the
//! teacher crate represents its own bitflag-shaped enums (`VMEvent`-like
//! types via `bitflags = { workspace = true }`).

use alloc::{
    string::String,
    vec::Vec,
};

bitflags::bitflags! {
    /// Engine-wide behavior toggles. Unset bits mean "architecture
    /// default".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineOptions: u32 {
        /// Disable the local exclusive-monitor emulation used for atomic
        /// instruction idioms (load-linked/store-conditional pairs).
        const DISABLE_LOCAL_MONITOR = 1 << 0;
        /// Disable floating-point register recording on memory-access
        /// instrumentation, even if the access touches an FPR.
        const DISABLE_MEMORYACCESS_FPR = 1 << 1;
        /// Disable optimizations that skip re-reading the flags register
        /// between ALU instructions that don't touch it.
        const DISABLE_FPR_OPTIMIZATION = 1 << 2;
        /// Opt into pointer-authentication-aware patch rules on
        /// architectures that support it.
        const ENABLE_PTR_AUTH = 1 << 3;
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::empty()
    }
}

/// Construction-time engine configuration: which CPU to translate for, and
/// engine-wide limits.
///
/// Grounded on the teacher crate's `InterpreterParams` (a small bundle of
/// construction-time parameters the `Interpreter` is built from, rather
/// than ambient globals read inside the core).
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// CPU model name passed to the assembler facade, e.g. `"x86_64"`,
    /// `"cortex-a72"`. Opaque to the core.
    pub cpu_name: String,
    /// Additional assembler feature strings, e.g. `"+avx2"`.
    pub features: Vec<String>,
    /// Number of general-purpose registers in the guest register file.
    pub gpr_count: usize,
    /// Number of floating-point registers in the guest register file.
    pub fpr_count: usize,
    /// Engine-wide behavior toggles.
    pub options: EngineOptions,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            cpu_name: String::new(),
            features: Vec::new(),
            gpr_count: 16,
            fpr_count: 16,
            options: EngineOptions::default(),
        }
    }
}
