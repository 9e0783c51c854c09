//! A toy, fixed-width fake ISA implementing [`CodeAssembler`], used only to
//! exercise the translation pipeline end to end without a real disassembler
//! or host code emitter.
//!
//! Grounded on `SPEC_FULL.md`'s description of this crate's `test-helpers`
//! feature: "a tiny fixed-width fake ISA: `MOV`, `ADD`, `LOAD`, `STORE`,
//! `CALL`, `RET`, `JMP`, `JCC`", the same role the teacher crate's
//! `storage::MemoryStorage` plays as an in-memory `InterpreterStorage`
//! double. Every "host instruction" this facade emits is just the guest
//! instruction bytes themselves, reinterpreted directly by
//! [`ToyAssembler::execute_block`]: this crate forbids `unsafe` and has no
//! real JIT backend, so there is nothing to actually branch host control
//! flow into.
//!
//! # Instruction encoding
//!
//! Every instruction is 16 bytes:
//!
//! | offset | 0   | 1   | 2    | 3    | 4..12         | 12..16    |
//! |--------|-----|-----|------|------|---------------|-----------|
//! | field  | op  | dst | src1 | src2 | imm (i64, LE) | aux (u32) |
//!
//! `aux` carries a truncated-to-32-bit guest address for the handful of
//! ops that need one at execution time ([`ToyOp::Dispatch`],
//! [`ToyOp::ShadowRead`], [`ToyOp::ShadowWrite`]) — acceptable for a test
//! double whose guest programs live at small addresses.
//!
//! # Calling convention
//!
//! Argument and return value: `R0`. Stack pointer: the last general-purpose
//! register (`SP_REG`, see [`ToyAssembler::sp_reg`]), grows down, addressed
//! into the same flat memory `Load`/`Store` touch. `Call`/`Ret` thread
//! return addresses through an internal shadow stack instead of writing
//! them through guest memory, since the real return-address convention is
//! architecture-specific and out of this crate's scope.

#![allow(missing_docs)]

use alloc::{
    rc::Rc,
    string::{String, ToString},
    vec,
    vec::Vec,
};
use core::cell::RefCell;

use crate::{
    analysis::{Operand, OperandFlag, OperandType, RegisterAccessType},
    assembler::{CodeAssembler, ControlFlow, DecodedInst},
    callback::{DispatchTrigger, InstPosition, VMAction},
    error::EngineError,
    exec_block::{BlockContext, BlockExit},
    memory_access::{MemoryAccessFlags, MemoryAccessType},
    patch::{Patch, RelocInst},
    range::GuestAddr,
    registers::RegId,
    rules::PatchRule,
};

/// Width, in bytes, of every toy instruction.
pub const INST_WIDTH: u8 = 16;

/// Opcode discriminants for the toy ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ToyOp {
    Nop = 0,
    MovReg = 1,
    MovImm = 2,
    Add = 3,
    AddImm = 4,
    Sub = 5,
    Jmp = 6,
    Jz = 7,
    Jnz = 8,
    Call = 9,
    Ret = 10,
    Load = 11,
    Store = 12,
    Push = 13,
    Pop = 14,
    /// `dst = sum of count(src2) consecutive 8-byte words starting at
    /// memory[base(src1) + offset(imm)]`: a REP-prefixed string read whose
    /// access count is only known at runtime.
    LoadRep = 18,
    /// `memory[base(src1) + offset(imm)..+16] = (src2, src2+1)`: a 16-byte
    /// wide-vector store, writing two consecutive registers as one access
    /// wider than a guest word.
    StoreVec = 19,
    /// Internal: a spliced instrumentation dispatch point. Never produced
    /// by [`ToyProgram`]; only by [`ToyAssembler::gen_dispatch_marker`].
    Dispatch = 15,
    /// Internal: spliced PRE memory-read shadow recording.
    ShadowRead = 16,
    /// Internal: spliced POST memory-write shadow recording.
    ShadowWrite = 17,
    /// Internal: spliced PRE shadow recording of a REP read's first access,
    /// size unknown.
    ShadowRepFirst = 20,
    /// Internal: spliced POST shadow recording of a REP read's total byte
    /// count.
    ShadowRepTotal = 21,
    /// Internal: spliced POST shadow recording of a wide-vector store's
    /// address, without its value.
    ShadowVec = 22,
}

impl ToyOp {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Nop,
            1 => Self::MovReg,
            2 => Self::MovImm,
            3 => Self::Add,
            4 => Self::AddImm,
            5 => Self::Sub,
            6 => Self::Jmp,
            7 => Self::Jz,
            8 => Self::Jnz,
            9 => Self::Call,
            10 => Self::Ret,
            11 => Self::Load,
            12 => Self::Store,
            13 => Self::Push,
            14 => Self::Pop,
            15 => Self::Dispatch,
            16 => Self::ShadowRead,
            17 => Self::ShadowWrite,
            18 => Self::LoadRep,
            19 => Self::StoreVec,
            20 => Self::ShadowRepFirst,
            21 => Self::ShadowRepTotal,
            22 => Self::ShadowVec,
            _ => return None,
        })
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::MovReg => "MOV",
            Self::MovImm => "MOVI",
            Self::Add => "ADD",
            Self::AddImm => "ADDI",
            Self::Sub => "SUB",
            Self::Jmp => "JMP",
            Self::Jz => "JZ",
            Self::Jnz => "JNZ",
            Self::Call => "CALL",
            Self::Ret => "RET",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::LoadRep => "LOADREP",
            Self::StoreVec => "STOREVEC",
            Self::Dispatch => "__DISPATCH",
            Self::ShadowRead => "__SHADOW_READ",
            Self::ShadowWrite => "__SHADOW_WRITE",
            Self::ShadowRepFirst => "__SHADOW_REP_FIRST",
            Self::ShadowRepTotal => "__SHADOW_REP_TOTAL",
            Self::ShadowVec => "__SHADOW_VEC",
        }
    }

    fn ends_basic_block(self) -> bool {
        matches!(
            self,
            Self::Jmp | Self::Jz | Self::Jnz | Self::Call | Self::Ret
        )
    }
}

/// One decoded toy instruction's fields, parsed out of its 16-byte
/// encoding. Kept separate from [`DecodedInst`] (which stays opaque to the
/// rest of the core) so this module's own codegen can read operand values
/// back out of a [`DecodedInst`]'s raw `bytes`.
#[derive(Debug, Clone, Copy)]
struct ToyFields {
    op: ToyOp,
    dst: u8,
    src1: u8,
    src2: u8,
    imm: i64,
    aux: u32,
}

fn encode(fields: ToyFields) -> Vec<u8> {
    let mut bytes = vec![0u8; INST_WIDTH as usize];
    bytes[0] = fields.op as u8;
    bytes[1] = fields.dst;
    bytes[2] = fields.src1;
    bytes[3] = fields.src2;
    bytes[4..12].copy_from_slice(&fields.imm.to_le_bytes());
    bytes[12..16].copy_from_slice(&fields.aux.to_le_bytes());
    bytes
}

fn decode_fields(bytes: &[u8]) -> Option<ToyFields> {
    if bytes.len() < INST_WIDTH as usize {
        return None;
    }
    let op = ToyOp::from_u8(bytes[0])?;
    let imm = i64::from_le_bytes(bytes[4..12].try_into().ok()?);
    let aux = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
    Some(ToyFields {
        op,
        dst: bytes[1],
        src1: bytes[2],
        src2: bytes[3],
        imm,
        aux,
    })
}

/// Builds a guest code image (a flat byte buffer at a base address) out of
/// toy instructions, the "scripted guest code builder" named in
/// `SPEC_FULL.md`.
#[derive(Debug, Clone)]
pub struct ToyProgram {
    base: GuestAddr,
    bytes: Vec<u8>,
}

impl ToyProgram {
    /// A program with no instructions yet, to be placed at `base`.
    pub fn new(base: GuestAddr) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    /// Guest address of the next instruction this builder will emit.
    pub fn here(&self) -> GuestAddr {
        self.base + self.bytes.len() as GuestAddr
    }

    fn push(&mut self, fields: ToyFields) -> &mut Self {
        self.bytes.extend(encode(fields));
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Nop,
            dst: 0,
            src1: 0,
            src2: 0,
            imm: 0,
            aux: 0,
        })
    }

    pub fn mov_reg(&mut self, dst: RegId, src: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::MovReg,
            dst: dst.0 as u8,
            src1: src.0 as u8,
            src2: 0,
            imm: 0,
            aux: 0,
        })
    }

    pub fn mov_imm(&mut self, dst: RegId, imm: i64) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::MovImm,
            dst: dst.0 as u8,
            src1: 0,
            src2: 0,
            imm,
            aux: 0,
        })
    }

    pub fn add(&mut self, dst: RegId, src1: RegId, src2: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Add,
            dst: dst.0 as u8,
            src1: src1.0 as u8,
            src2: src2.0 as u8,
            imm: 0,
            aux: 0,
        })
    }

    pub fn add_imm(&mut self, dst: RegId, src1: RegId, imm: i64) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::AddImm,
            dst: dst.0 as u8,
            src1: src1.0 as u8,
            src2: 0,
            imm,
            aux: 0,
        })
    }

    pub fn sub(&mut self, dst: RegId, src1: RegId, src2: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Sub,
            dst: dst.0 as u8,
            src1: src1.0 as u8,
            src2: src2.0 as u8,
            imm: 0,
            aux: 0,
        })
    }

    pub fn jmp(&mut self, target: GuestAddr) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Jmp,
            dst: 0,
            src1: 0,
            src2: 0,
            imm: target as i64,
            aux: 0,
        })
    }

    /// Jump to `target` if `reg == 0`.
    pub fn jz(&mut self, reg: RegId, target: GuestAddr) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Jz,
            dst: 0,
            src1: reg.0 as u8,
            src2: 0,
            imm: target as i64,
            aux: 0,
        })
    }

    /// Jump to `target` if `reg != 0`.
    pub fn jnz(&mut self, reg: RegId, target: GuestAddr) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Jnz,
            dst: 0,
            src1: reg.0 as u8,
            src2: 0,
            imm: target as i64,
            aux: 0,
        })
    }

    /// Call `target`; the return address (this instruction's own address
    /// plus its size) is threaded through the assembler's internal shadow
    /// call stack, not through a guest-visible register.
    pub fn call(&mut self, target: GuestAddr) -> &mut Self {
        let return_addr = self.here() + INST_WIDTH as GuestAddr;
        self.push(ToyFields {
            op: ToyOp::Call,
            dst: 0,
            src1: 0,
            src2: 0,
            imm: target as i64,
            aux: return_addr as u32,
        })
    }

    pub fn ret(&mut self) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Ret,
            dst: 0,
            src1: 0,
            src2: 0,
            imm: 0,
            aux: 0,
        })
    }

    /// `dst = memory[base + offset]`.
    pub fn load(&mut self, dst: RegId, base: RegId, offset: i64) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Load,
            dst: dst.0 as u8,
            src1: base.0 as u8,
            src2: 0,
            imm: offset,
            aux: 0,
        })
    }

    /// `memory[base + offset] = src`.
    pub fn store(&mut self, base: RegId, offset: i64, src: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Store,
            dst: 0,
            src1: base.0 as u8,
            src2: src.0 as u8,
            imm: offset,
            aux: 0,
        })
    }

    /// `dst = sum of `count` consecutive 8-byte words starting at
    /// `memory[base + offset]``; `count` is read from a register, not an
    /// immediate, so the access count is only known at runtime, the way a
    /// REP-prefixed string instruction's is.
    pub fn load_rep(&mut self, dst: RegId, base: RegId, offset: i64, count: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::LoadRep,
            dst: dst.0 as u8,
            src1: base.0 as u8,
            src2: count.0 as u8,
            imm: offset,
            aux: 0,
        })
    }

    /// `memory[base + offset..+16] = (lo, hi)`: a 16-byte wide-vector
    /// store of two consecutive registers.
    pub fn store_vec(&mut self, base: RegId, offset: i64, lo: RegId, hi: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::StoreVec,
            dst: hi.0 as u8,
            src1: base.0 as u8,
            src2: lo.0 as u8,
            imm: offset,
            aux: 0,
        })
    }

    pub fn push_reg(&mut self, src: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Push,
            dst: 0,
            src1: src.0 as u8,
            src2: 0,
            imm: 0,
            aux: 0,
        })
    }

    pub fn pop_reg(&mut self, dst: RegId) -> &mut Self {
        self.push(ToyFields {
            op: ToyOp::Pop,
            dst: dst.0 as u8,
            src1: 0,
            src2: 0,
            imm: 0,
            aux: 0,
        })
    }

    /// Finish building, producing the image and its base address.
    pub fn build(&self) -> GuestImage {
        GuestImage {
            base: self.base,
            bytes: self.bytes.clone(),
        }
    }
}

/// A flat guest code (and, conveniently, data) image, readable through the
/// `fetch` closure every `Engine`/`VM` entry point takes.
#[derive(Debug, Clone)]
pub struct GuestImage {
    base: GuestAddr,
    bytes: Vec<u8>,
}

impl GuestImage {
    /// Read `len` bytes starting at `addr`, zero-padding past the end of
    /// the image.
    pub fn read(&self, addr: GuestAddr, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        if addr < self.base {
            return out;
        }
        let offset = (addr - self.base) as usize;
        for (i, slot) in out.iter_mut().enumerate() {
            if let Some(&b) = self.bytes.get(offset + i) {
                *slot = b;
            }
        }
        out
    }

    /// A boxed closure suitable for `Engine::run`/`VM::run`'s `fetch`
    /// parameter.
    pub fn fetcher(&self) -> impl Fn(GuestAddr, usize) -> Vec<u8> + '_ {
        move |addr, len| self.read(addr, len)
    }

    /// Base address of this image.
    pub fn base(&self) -> GuestAddr {
        self.base
    }

    /// One past the last address covered by this image.
    pub fn end(&self) -> GuestAddr {
        self.base + self.bytes.len() as GuestAddr
    }
}

/// The toy machine's addressable data memory, independent of the code
/// image(s) fetched for translation (a real DBI engine re-executes
/// instructions against the guest's actual memory; this crate owns no
/// guest memory of its own, so the toy double models one explicitly).
#[derive(Debug, Clone)]
pub struct ToyMemory {
    bytes: RefCell<Vec<u8>>,
}

impl ToyMemory {
    /// `size` bytes of zeroed memory.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: RefCell::new(vec![0u8; size]),
        }
    }

    fn read_u64(&self, addr: GuestAddr) -> u64 {
        let mem = self.bytes.borrow();
        let idx = addr as usize;
        if idx + 8 > mem.len() {
            tracing::warn!(addr, "toy memory read out of bounds");
            return 0;
        }
        u64::from_le_bytes(mem[idx..idx + 8].try_into().unwrap_or([0; 8]))
    }

    fn write_u64(&self, addr: GuestAddr, value: u64) {
        let mut mem = self.bytes.borrow_mut();
        let idx = addr as usize;
        if idx + 8 > mem.len() {
            tracing::warn!(addr, "toy memory write out of bounds");
            return;
        }
        mem[idx..idx + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a single byte, for tests asserting on written content directly.
    pub fn read_byte(&self, addr: GuestAddr) -> u8 {
        self.bytes.borrow().get(addr as usize).copied().unwrap_or(0)
    }
}

/// The toy assembler facade: decodes/encodes the ISA above and interprets
/// it directly in [`Self::execute_block`].
///
/// Holds its data memory and call-return shadow stack behind
/// [`RefCell`]/[`Rc`] rather than requiring `&mut self` on `CodeAssembler`
/// methods, mirroring how the real assembler facade this trait stands in
/// for is a shared, long-lived collaborator rather than something the
/// engine exclusively owns.
#[derive(Clone)]
pub struct ToyAssembler {
    memory: Rc<ToyMemory>,
    call_stack: Rc<RefCell<Vec<GuestAddr>>>,
    sp_reg: RegId,
}

impl ToyAssembler {
    /// A fresh assembler with `memory_size` bytes of data memory and
    /// `sp_reg` reserved as the stack pointer (convention: the last
    /// general-purpose register in the file).
    pub fn new(memory_size: usize, sp_reg: RegId) -> Self {
        Self {
            memory: Rc::new(ToyMemory::new(memory_size)),
            call_stack: Rc::new(RefCell::new(Vec::new())),
            sp_reg,
        }
    }

    /// The stack pointer register, by convention the last GPR.
    pub fn sp_reg(&self) -> RegId {
        self.sp_reg
    }

    /// Direct access to data memory, for tests seeding input or asserting
    /// on output.
    pub fn memory(&self) -> &ToyMemory {
        &self.memory
    }

    /// Depth of the internal call-return shadow stack, for tests asserting
    /// every call was matched by a return.
    pub fn call_depth(&self) -> usize {
        self.call_stack.borrow().len()
    }

    fn reg(id: u8) -> RegId {
        RegId(id as u16)
    }
}

/// A catch-all [`PatchRule`] translating every decodable toy instruction as
/// an opaque relocatable copy of itself, ending the basic block exactly at
/// control-flow instructions. Registered once per engine; see
/// `Engine::patch_rules_mut`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToyPatchRule;

impl PatchRule for ToyPatchRule {
    fn matches(&self, inst: &DecodedInst, _assembler: &dyn CodeAssembler) -> bool {
        decode_fields(&inst.bytes).is_some()
    }

    fn generate(
        &self,
        inst: &DecodedInst,
        _assembler: &dyn CodeAssembler,
    ) -> Result<Patch, EngineError> {
        let fields = decode_fields(&inst.bytes).ok_or(EngineError::Decode(inst.address))?;
        let mut patch = Patch::new(
            inst.address,
            inst.size,
            inst.clone(),
            vec![RelocInst {
                template: inst.bytes.clone(),
                pc_relative: false,
            }],
        );
        if fields.op.ends_basic_block() {
            patch = patch.ends_basic_block();
        }
        Ok(patch)
    }
}

impl CodeAssembler for ToyAssembler {
    fn decode(&self, bytes: &[u8], addr: GuestAddr) -> Result<DecodedInst, EngineError> {
        let fields = decode_fields(bytes).ok_or(EngineError::Decode(addr))?;
        Ok(DecodedInst {
            address: addr,
            size: INST_WIDTH,
            bytes: encode(fields),
            opcode: fields.op as u32,
        })
    }

    fn mnemonic(&self, inst: &DecodedInst) -> String {
        decode_fields(&inst.bytes)
            .map(|f| f.op.mnemonic().to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    fn control_flow(&self, inst: &DecodedInst) -> ControlFlow {
        match decode_fields(&inst.bytes).map(|f| f.op) {
            Some(ToyOp::Jmp) => ControlFlow::Jump,
            Some(ToyOp::Jz) | Some(ToyOp::Jnz) => ControlFlow::Branch,
            Some(ToyOp::Call) => ControlFlow::Call,
            Some(ToyOp::Ret) => ControlFlow::Return,
            _ => ControlFlow::Sequential,
        }
    }

    fn reads_memory(&self, inst: &DecodedInst) -> bool {
        matches!(
            decode_fields(&inst.bytes).map(|f| f.op),
            Some(ToyOp::Load) | Some(ToyOp::LoadRep)
        )
    }

    fn writes_memory(&self, inst: &DecodedInst) -> bool {
        matches!(
            decode_fields(&inst.bytes).map(|f| f.op),
            Some(ToyOp::Store) | Some(ToyOp::StoreVec)
        )
    }

    fn operands(&self, inst: &DecodedInst) -> Vec<Operand> {
        let Some(fields) = decode_fields(&inst.bytes) else {
            return Vec::new();
        };

        let reg_op = |id: u8, access: RegisterAccessType| Operand {
            kind: OperandType::Register,
            flags: match access {
                RegisterAccessType::Read => OperandFlag::READ,
                RegisterAccessType::Write => OperandFlag::WRITE,
                RegisterAccessType::ReadWrite => OperandFlag::READ | OperandFlag::WRITE,
            },
            reg_id: Some(Self::reg(id)),
            value: 0,
            reg_access: Some(access),
        };
        let imm_op = |value: i64| Operand {
            kind: OperandType::Immediate,
            flags: OperandFlag::READ,
            reg_id: None,
            value,
            reg_access: None,
        };

        match fields.op {
            ToyOp::Nop | ToyOp::Ret => Vec::new(),
            ToyOp::MovReg => vec![
                reg_op(fields.dst, RegisterAccessType::Write),
                reg_op(fields.src1, RegisterAccessType::Read),
            ],
            ToyOp::MovImm => vec![
                reg_op(fields.dst, RegisterAccessType::Write),
                imm_op(fields.imm),
            ],
            ToyOp::Add | ToyOp::Sub => vec![
                reg_op(fields.dst, RegisterAccessType::Write),
                reg_op(fields.src1, RegisterAccessType::Read),
                reg_op(fields.src2, RegisterAccessType::Read),
            ],
            ToyOp::AddImm => vec![
                reg_op(fields.dst, RegisterAccessType::Write),
                reg_op(fields.src1, RegisterAccessType::Read),
                imm_op(fields.imm),
            ],
            ToyOp::Jmp => vec![imm_op(fields.imm)],
            ToyOp::Jz | ToyOp::Jnz => vec![
                reg_op(fields.src1, RegisterAccessType::Read),
                imm_op(fields.imm),
            ],
            ToyOp::Call => vec![imm_op(fields.imm)],
            ToyOp::Load => vec![
                reg_op(fields.dst, RegisterAccessType::Write),
                reg_op(fields.src1, RegisterAccessType::Read),
                imm_op(fields.imm),
            ],
            ToyOp::Store => vec![
                reg_op(fields.src1, RegisterAccessType::Read),
                reg_op(fields.src2, RegisterAccessType::Read),
                imm_op(fields.imm),
            ],
            ToyOp::Push => vec![reg_op(fields.src1, RegisterAccessType::Read)],
            ToyOp::Pop => vec![reg_op(fields.dst, RegisterAccessType::Write)],
            ToyOp::LoadRep => vec![
                reg_op(fields.dst, RegisterAccessType::Write),
                reg_op(fields.src1, RegisterAccessType::Read),
                reg_op(fields.src2, RegisterAccessType::Read),
                imm_op(fields.imm),
            ],
            ToyOp::StoreVec => vec![
                reg_op(fields.src1, RegisterAccessType::Read),
                reg_op(fields.src2, RegisterAccessType::Read),
                reg_op(fields.dst, RegisterAccessType::Read),
                imm_op(fields.imm),
            ],
            ToyOp::Dispatch
            | ToyOp::ShadowRead
            | ToyOp::ShadowWrite
            | ToyOp::ShadowRepFirst
            | ToyOp::ShadowRepTotal
            | ToyOp::ShadowVec => Vec::new(),
        }
    }

    fn is_rep_prefixed(&self, inst: &DecodedInst) -> bool {
        matches!(
            decode_fields(&inst.bytes).map(|f| f.op),
            Some(ToyOp::LoadRep)
        )
    }

    fn is_wide_vector_access(&self, inst: &DecodedInst) -> bool {
        matches!(
            decode_fields(&inst.bytes).map(|f| f.op),
            Some(ToyOp::StoreVec)
        )
    }

    fn encode(&self, reloc: &RelocInst, _load_addr: u64) -> Result<Vec<u8>, EngineError> {
        Ok(reloc.template.clone())
    }

    fn gen_dispatch_marker(&self, trigger: DispatchTrigger) -> RelocInst {
        RelocInst {
            template: encode(ToyFields {
                op: ToyOp::Dispatch,
                dst: 0,
                src1: match trigger.position {
                    InstPosition::Pre => 0,
                    InstPosition::Post => 1,
                },
                src2: 0,
                imm: 0,
                aux: trigger.address as u32,
            }),
            pc_relative: false,
        }
    }

    fn supports_memory_shadow(&self) -> bool {
        true
    }

    fn gen_memory_shadow_code(
        &self,
        inst: &DecodedInst,
        position: InstPosition,
        access_type: MemoryAccessType,
    ) -> Vec<RelocInst> {
        let Some(fields) = decode_fields(&inst.bytes) else {
            return Vec::new();
        };
        let op = match (position, access_type) {
            (InstPosition::Pre, MemoryAccessType::READ) if fields.op == ToyOp::Load => {
                ToyOp::ShadowRead
            }
            (InstPosition::Post, MemoryAccessType::WRITE) if fields.op == ToyOp::Store => {
                ToyOp::ShadowWrite
            }
            (InstPosition::Pre, MemoryAccessType::READ) if fields.op == ToyOp::LoadRep => {
                ToyOp::ShadowRepFirst
            }
            (InstPosition::Post, MemoryAccessType::READ) if fields.op == ToyOp::LoadRep => {
                ToyOp::ShadowRepTotal
            }
            (InstPosition::Post, MemoryAccessType::WRITE) if fields.op == ToyOp::StoreVec => {
                ToyOp::ShadowVec
            }
            _ => return Vec::new(),
        };
        vec![RelocInst {
            template: encode(ToyFields {
                op,
                dst: 0,
                src1: fields.src1,
                src2: fields.src2,
                imm: fields.imm,
                aux: inst.address as u32,
            }),
            pc_relative: false,
        }]
    }

    fn execute_block(
        &self,
        code: &[u8],
        ctx: &mut BlockContext,
        dispatch: &mut dyn FnMut(DispatchTrigger, &mut BlockContext) -> VMAction,
    ) -> BlockExit {
        let mut exit = BlockExit::BranchOut;
        let mut cursor = 0usize;

        while cursor + INST_WIDTH as usize <= code.len() {
            let Some(fields) = decode_fields(&code[cursor..cursor + INST_WIDTH as usize]) else {
                break;
            };
            cursor += INST_WIDTH as usize;

            match fields.op {
                ToyOp::Nop => {}
                ToyOp::MovReg => {
                    let v = ctx.registers.gpr(Self::reg(fields.src1));
                    ctx.registers.set_gpr(Self::reg(fields.dst), v);
                }
                ToyOp::MovImm => {
                    ctx.registers.set_gpr(Self::reg(fields.dst), fields.imm as u64);
                }
                ToyOp::Add => {
                    let v = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(ctx.registers.gpr(Self::reg(fields.src2)));
                    ctx.registers.set_gpr(Self::reg(fields.dst), v);
                }
                ToyOp::AddImm => {
                    let v = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    ctx.registers.set_gpr(Self::reg(fields.dst), v);
                }
                ToyOp::Sub => {
                    let v = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_sub(ctx.registers.gpr(Self::reg(fields.src2)));
                    ctx.registers.set_gpr(Self::reg(fields.dst), v);
                }
                ToyOp::Jmp => {
                    ctx.next_pc = fields.imm as u64;
                    exit = BlockExit::BranchOut;
                }
                ToyOp::Jz => {
                    let taken = ctx.registers.gpr(Self::reg(fields.src1)) == 0;
                    ctx.next_pc = if taken {
                        fields.imm as u64
                    } else {
                        cursor as u64
                    };
                    exit = BlockExit::BranchOut;
                }
                ToyOp::Jnz => {
                    let taken = ctx.registers.gpr(Self::reg(fields.src1)) != 0;
                    ctx.next_pc = if taken {
                        fields.imm as u64
                    } else {
                        cursor as u64
                    };
                    exit = BlockExit::BranchOut;
                }
                ToyOp::Call => {
                    self.call_stack.borrow_mut().push(fields.aux as GuestAddr);
                    ctx.next_pc = fields.imm as u64;
                    exit = BlockExit::BranchOut;
                }
                ToyOp::Ret => {
                    ctx.next_pc = self.call_stack.borrow_mut().pop().unwrap_or(0);
                    exit = BlockExit::BranchOut;
                }
                ToyOp::Load => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let value = self.memory.read_u64(addr);
                    ctx.registers.set_gpr(Self::reg(fields.dst), value);
                }
                ToyOp::Store => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let value = ctx.registers.gpr(Self::reg(fields.src2));
                    self.memory.write_u64(addr, value);
                }
                ToyOp::LoadRep => {
                    let base = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let count = ctx.registers.gpr(Self::reg(fields.src2));
                    let mut sum = 0u64;
                    for i in 0..count {
                        sum = sum.wrapping_add(self.memory.read_u64(base.wrapping_add(i * 8)));
                    }
                    ctx.registers.set_gpr(Self::reg(fields.dst), sum);
                }
                ToyOp::StoreVec => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let lo = ctx.registers.gpr(Self::reg(fields.src2));
                    let hi = ctx.registers.gpr(Self::reg(fields.dst));
                    self.memory.write_u64(addr, lo);
                    self.memory.write_u64(addr.wrapping_add(8), hi);
                }
                ToyOp::Push => {
                    let sp = ctx.registers.gpr(self.sp_reg).wrapping_sub(8);
                    ctx.registers.set_gpr(self.sp_reg, sp);
                    let value = ctx.registers.gpr(Self::reg(fields.src1));
                    self.memory.write_u64(sp, value);
                }
                ToyOp::Pop => {
                    let sp = ctx.registers.gpr(self.sp_reg);
                    let value = self.memory.read_u64(sp);
                    ctx.registers.set_gpr(Self::reg(fields.dst), value);
                    ctx.registers.set_gpr(self.sp_reg, sp.wrapping_add(8));
                }
                ToyOp::Dispatch => {
                    let trigger = DispatchTrigger {
                        address: fields.aux as GuestAddr,
                        position: if fields.src1 == 0 {
                            InstPosition::Pre
                        } else {
                            InstPosition::Post
                        },
                    };
                    match dispatch(trigger, ctx) {
                        VMAction::Continue => {}
                        VMAction::Stop => return BlockExit::Stopped,
                        VMAction::BreakToVm => return BlockExit::BreakToVm,
                    }
                }
                ToyOp::ShadowRead => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let value = self.memory.read_u64(addr);
                    ctx.shadow.record(
                        fields.aux as GuestAddr,
                        addr,
                        Some(value),
                        None,
                        8,
                        MemoryAccessFlags::default(),
                    );
                }
                ToyOp::ShadowWrite => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let value = self.memory.read_u64(addr);
                    ctx.shadow.record(
                        fields.aux as GuestAddr,
                        addr,
                        None,
                        Some(value),
                        8,
                        MemoryAccessFlags::default(),
                    );
                }
                ToyOp::ShadowRepFirst => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let value = self.memory.read_u64(addr);
                    ctx.shadow.record(
                        fields.aux as GuestAddr,
                        addr,
                        Some(value),
                        None,
                        8,
                        MemoryAccessFlags {
                            from_rep_prefix: true,
                            value_not_recorded: false,
                            unknown_size: true,
                        },
                    );
                }
                ToyOp::ShadowRepTotal => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    let count = ctx.registers.gpr(Self::reg(fields.src2));
                    let total_bytes = (count * 8).min(u8::MAX as u64) as u8;
                    ctx.shadow.record(
                        fields.aux as GuestAddr,
                        addr,
                        Some(0),
                        None,
                        total_bytes,
                        MemoryAccessFlags {
                            from_rep_prefix: true,
                            value_not_recorded: true,
                            unknown_size: false,
                        },
                    );
                }
                ToyOp::ShadowVec => {
                    let addr = ctx
                        .registers
                        .gpr(Self::reg(fields.src1))
                        .wrapping_add(fields.imm as u64);
                    ctx.shadow.record(
                        fields.aux as GuestAddr,
                        addr,
                        None,
                        Some(0),
                        16,
                        MemoryAccessFlags {
                            from_rep_prefix: false,
                            value_not_recorded: true,
                            unknown_size: false,
                        },
                    );
                }
            }
        }

        exit
    }
}

impl core::fmt::Debug for ToyAssembler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ToyAssembler")
            .field("sp_reg", &self.sp_reg)
            .field("call_depth", &self.call_depth())
            .finish()
    }
}

/// A [`crate::broker::TransferHandler`] test double: simulates a single
/// native (non-instrumented) leaf function at `native_addr` by writing a
/// fixed return value into `R0` and popping the toy call stack for the
/// resume address, the way a real native callee returning through a
/// hooked return address would hand control back to the engine. Declines
/// every other target, leaving registers untouched, so an engine exiting
/// through some other address doesn't spuriously "return" through here.
pub struct ToyNativeReturn {
    call_stack: Rc<RefCell<Vec<GuestAddr>>>,
    native_addr: GuestAddr,
    return_value: u64,
}

impl ToyNativeReturn {
    /// A transfer handler sharing `assembler`'s call stack, so a `CALL`
    /// into non-instrumented code still resumes at the address the guest
    /// `CALL` instruction recorded.
    pub fn new(assembler: &ToyAssembler, native_addr: GuestAddr, return_value: u64) -> Self {
        Self {
            call_stack: assembler.call_stack.clone(),
            native_addr,
            return_value,
        }
    }
}

impl crate::broker::TransferHandler for ToyNativeReturn {
    fn transfer(
        &self,
        _reason: crate::broker::TransferReason,
        target: GuestAddr,
        registers: &mut crate::registers::GuestRegisters,
    ) -> Option<GuestAddr> {
        if target != self.native_addr {
            return None;
        }
        registers.set_gpr(RegId(0), self.return_value);
        self.call_stack.borrow_mut().pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        callback::{InstFilter, InstPosition, VMAction, VMEvent},
        engine::{Engine, RunOutcome},
        options::EngineParams,
        range::Range,
        registers::RegId,
    };
    use alloc::{boxed::Box, sync::Arc, vec::Vec};
    use core::sync::atomic::{AtomicU64, Ordering};

    const R0: RegId = RegId(0);
    const R1: RegId = RegId(1);
    const R2: RegId = RegId(2);
    const SP: RegId = RegId(7);

    fn new_engine() -> Engine<ToyAssembler> {
        let assembler = ToyAssembler::new(0x10000, SP);
        let mut engine = Engine::new(
            assembler,
            EngineParams {
                gpr_count: 8,
                fpr_count: 0,
                ..Default::default()
            },
        );
        engine.patch_rules_mut().push(Box::new(ToyPatchRule));
        engine
    }

    /// `fib(n) = n < 2 ? n : fib(n-1) + fib(n-2)`, recursing into itself,
    /// built from the toy ISA. The 13 instructions before the shared `RET`
    /// put it at a fixed `base + 208` offset both early-return jumps can
    /// target directly, since the builder has no label/fixup support.
    fn build_fib(base: GuestAddr) -> GuestImage {
        let mut p = ToyProgram::new(base);
        let ret_addr = base + 13 * INST_WIDTH as GuestAddr;
        p.jz(R0, ret_addr); // n == 0 -> return n (R0 unchanged)
        p.add_imm(R1, R0, -1); // R1 = n - 1
        p.jz(R1, ret_addr); // n == 1 -> return n (R0 unchanged)
        p.push_reg(R0); // save n
        p.mov_reg(R0, R1); // arg = n - 1
        p.call(base); // fib(n - 1)
        p.pop_reg(R1); // R1 = n
        p.mov_reg(R2, R0); // R2 = fib(n-1)
        p.add_imm(R0, R1, -2); // arg = n - 2
        p.push_reg(R2); // save fib(n-1)
        p.call(base); // fib(n - 2)
        p.pop_reg(R2); // R2 = fib(n-1)
        p.add(R0, R0, R2); // R0 = fib(n-2) + fib(n-1)
        p.ret();
        assert_eq!(p.here(), ret_addr + INST_WIDTH as GuestAddr);
        p.build()
    }

    /// Naive recursive `fib` calls itself `2*fib(n+1) - 1` times total,
    /// counting the initial call.
    fn expected_call_count(n: u64) -> u64 {
        fn fib(n: u64) -> u64 {
            if n < 2 {
                n
            } else {
                fib(n - 1) + fib(n - 2)
            }
        }
        2 * fib(n + 1) - 1
    }

    #[test]
    fn fib_recursion_matches_expected_call_count_and_result() {
        let base: GuestAddr = 0x1000;
        let image = build_fib(base);
        let mut engine = new_engine();
        engine.add_instrumented_range(Range::new(base, image.end()));

        let calls = Arc::new(AtomicU64::new(0));
        let calls_cb = calls.clone();
        engine.add_vm_event_cb(
            VMEvent::BASIC_BLOCK_NEW | VMEvent::BASIC_BLOCK_ENTRY,
            Box::new(move |_ctx, state| {
                if state.event == VMEvent::BASIC_BLOCK_ENTRY && state.basic_block_addr == base {
                    calls_cb.fetch_add(1, Ordering::SeqCst);
                }
                VMAction::Continue
            }),
        );

        engine.active_registers_mut().set_gpr(R0, 10);
        engine.active_registers_mut().set_gpr(SP, 0x9000);

        let outcome = engine
            .run(base, &image.fetcher())
            .expect("run should terminate by leaving the instrumented range");

        assert_eq!(outcome, RunOutcome::TransferredOut);
        assert_eq!(engine.registers().gpr(R0), 55);
        assert_eq!(calls.load(Ordering::SeqCst), expected_call_count(10));
    }

    #[test]
    fn clearing_the_cache_does_not_change_call_count_or_result() {
        let base: GuestAddr = 0x1000;
        let image = build_fib(base);
        let mut engine = new_engine();
        engine.add_instrumented_range(Range::new(base, image.end()));

        let calls = Arc::new(AtomicU64::new(0));
        let calls_cb = calls.clone();
        engine.add_vm_event_cb(
            VMEvent::BASIC_BLOCK_ENTRY,
            Box::new(move |_ctx, state| {
                if state.basic_block_addr == base {
                    calls_cb.fetch_add(1, Ordering::SeqCst);
                }
                VMAction::Continue
            }),
        );

        engine.active_registers_mut().set_gpr(R0, 8);
        engine.active_registers_mut().set_gpr(SP, 0x9000);
        let first_outcome = engine.run(base, &image.fetcher()).expect("run succeeds");
        let first_result = engine.registers().gpr(R0);
        let first_calls = calls.load(Ordering::SeqCst);

        // Every translation made during the first run is now cached.
        // Dropping it all must be purely a performance effect: rerunning
        // the identical program from the identical starting state has to
        // retranslate from scratch and still reach the same result.
        engine.clear_all_cache();
        calls.store(0, Ordering::SeqCst);

        engine.active_registers_mut().set_gpr(R0, 8);
        engine.active_registers_mut().set_gpr(SP, 0x9000);
        let second_outcome = engine.run(base, &image.fetcher()).expect("run succeeds");

        assert_eq!(first_outcome, second_outcome);
        assert_eq!(first_result, engine.registers().gpr(R0));
        assert_eq!(first_calls, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn mnemonic_callback_counts_call_instructions() {
        let base: GuestAddr = 0x2000;
        let image = build_fib(base);
        let mut engine = new_engine();
        engine.add_instrumented_range(Range::new(base, image.end()));

        let call_sites = Arc::new(AtomicU64::new(0));
        let call_sites_cb = call_sites.clone();
        engine.add_inst_cb(
            InstPosition::Pre,
            InstFilter::Mnemonic("CALL".into()),
            Box::new(move |_ctx| {
                call_sites_cb.fetch_add(1, Ordering::SeqCst);
                VMAction::Continue
            }),
        );

        engine.active_registers_mut().set_gpr(R0, 6);
        engine.active_registers_mut().set_gpr(SP, 0x9000);
        engine
            .run(base, &image.fetcher())
            .expect("run should terminate by leaving the instrumented range");

        assert_eq!(call_sites.load(Ordering::SeqCst), expected_call_count(6) - 1);
    }

    #[test]
    fn memory_shadow_records_store_address_and_value() {
        let mut p = ToyProgram::new(0x4000);
        let base = p.here();
        p.store(SP, 0, R1);
        p.ret();
        let image = p.build();
        let _ = base;

        let mut engine = new_engine();
        engine.add_instrumented_range(Range::new(image.base(), image.end()));

        let recorded = Arc::new(RefCell::new(Vec::new()));
        let recorded_cb = recorded.clone();
        engine.add_mem_range_cb(
            Range::new(0, 0x10000),
            MemoryAccessType::WRITE,
            Box::new(move |_ctx, access| {
                recorded_cb.borrow_mut().push(*access);
                VMAction::Continue
            }),
        );

        engine.active_registers_mut().set_gpr(SP, 0x100);
        engine.active_registers_mut().set_gpr(R1, 0xdead_beef);
        engine
            .run(image.base(), &image.fetcher())
            .expect("run should terminate");

        let recorded = recorded.borrow();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].address, 0x100);
        assert_eq!(recorded[0].value, 0xdead_beef);
    }

    #[test]
    fn rep_prefixed_read_records_first_access_then_total_byte_count() {
        const BASE_REG: RegId = RegId(3);
        const COUNT_REG: RegId = RegId(4);
        const DST_REG: RegId = RegId(5);

        let mut p = ToyProgram::new(0x5000);
        p.mov_imm(BASE_REG, 0x300);
        p.mov_imm(COUNT_REG, 3);
        p.load_rep(DST_REG, BASE_REG, 0, COUNT_REG);
        p.ret();
        let image = p.build();

        let mut engine = new_engine();
        engine.add_instrumented_range(Range::new(image.base(), image.end()));

        let recorded = Arc::new(RefCell::new(Vec::new()));
        let recorded_cb = recorded.clone();
        engine.add_mem_range_cb(
            Range::new(0, 0x10000),
            MemoryAccessType::READ,
            Box::new(move |_ctx, access| {
                recorded_cb.borrow_mut().push(*access);
                VMAction::Continue
            }),
        );

        engine
            .run(image.base(), &image.fetcher())
            .expect("run should terminate");

        let recorded = recorded.borrow();
        assert_eq!(recorded.len(), 2);

        let first = &recorded[0];
        assert_eq!(first.address, 0x300);
        assert!(first.flags.unknown_size);
        assert!(first.flags.from_rep_prefix);

        let total = &recorded[1];
        assert!(!total.flags.unknown_size);
        assert!(total.flags.from_rep_prefix);
        assert!(total.flags.value_not_recorded);
        assert_eq!(total.size, 24);
    }

    #[test]
    fn wide_vector_store_records_address_without_value() {
        const BASE_REG: RegId = RegId(3);
        const LO_REG: RegId = RegId(4);
        const HI_REG: RegId = RegId(5);

        let mut p = ToyProgram::new(0x6000);
        p.mov_imm(BASE_REG, 0x400);
        p.mov_imm(LO_REG, 0x11);
        p.mov_imm(HI_REG, 0x22);
        p.store_vec(BASE_REG, 0, LO_REG, HI_REG);
        p.ret();
        let image = p.build();

        let mut engine = new_engine();
        engine.add_instrumented_range(Range::new(image.base(), image.end()));

        let recorded = Arc::new(RefCell::new(Vec::new()));
        let recorded_cb = recorded.clone();
        engine.add_mem_range_cb(
            Range::new(0, 0x10000),
            MemoryAccessType::WRITE,
            Box::new(move |_ctx, access| {
                recorded_cb.borrow_mut().push(*access);
                VMAction::Continue
            }),
        );

        engine
            .run(image.base(), &image.fetcher())
            .expect("run should terminate");

        let recorded = recorded.borrow();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].address, 0x400);
        assert_eq!(recorded[0].size, 16);
        assert!(recorded[0].flags.value_not_recorded);
        assert!(!recorded[0].flags.unknown_size);
    }
}
