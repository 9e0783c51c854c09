//! Core engine for dynamic binary instrumentation.
//!
//! This crate implements the translation pipeline, execution-block cache,
//! execution broker and instrumentation dispatch layer of a DBI virtual
//! machine: it re-executes guest machine code belonging to the host process
//! under controlled translation so that user callbacks fire around
//! instructions, memory accesses, basic-block boundaries and control-flow
//! transfers. It is a library, not a standalone process; the public entry
//! points, process/module enumeration, the preload shim and language
//! bindings all live outside this crate and are consumed here only through
//! narrow trait seams.
#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![deny(
    clippy::arithmetic_side_effects,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

#[doc(hidden)] // Needed by some of the exported macros
pub extern crate alloc;

extern crate core;

#[cfg(test)]
use criterion as _;
#[cfg(test)]
use quickcheck_macros as _;

pub mod analysis;
pub mod assembler;
pub mod block_manager;
pub mod broker;
pub mod callback;
pub mod consts;
pub mod engine;
pub mod error;
pub mod exec_block;
pub mod memory_access;
pub mod options;
pub mod patch;
pub mod range;
pub mod registers;
pub mod rules;
pub mod vm;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub mod prelude {
    //! Everything needed to embed the engine.
    pub use crate::{
        analysis::{
            AnalysisType,
            InstAnalysis,
            Operand,
            OperandFlag,
            OperandType,
            RegisterAccessType,
            SymbolInfo,
            SymbolResolver,
        },
        assembler::{
            CodeAssembler,
            DecodedInst,
        },
        block_manager::{
            BlockHandle,
            ExecBlockManager,
        },
        broker::{
            ExecBroker,
            TransferHandler,
        },
        callback::{
            DispatchTrigger,
            EventId,
            InstCallback,
            InstFilter,
            InstPosition,
            InstrumentCallback,
            VMAction,
            VMCallback,
            VMEvent,
            VMState,
        },
        engine::{
            Engine,
            RunOutcome,
        },
        exec_block::{
            BlockContext,
            BlockExit,
            ExecBlock,
        },
        error::{
            Bug,
            BugVariant,
            EngineError,
        },
        memory_access::{
            MemoryAccess,
            MemoryAccessType,
        },
        options::{
            EngineOptions,
            EngineParams,
        },
        patch::{
            Patch,
            RelocInst,
        },
        range::{
            GuestAddr,
            Range,
            RangeSet,
        },
        registers::{
            GuestRegisters,
            RegId,
            RegValue,
        },
        rules::{
            InstrRule,
            MemoryShadowRule,
            Pass,
            PatchRule,
        },
        vm::{
            CallArg,
            CallbackContext,
            VM,
        },
    };
}
