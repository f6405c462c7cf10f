//! x64 Instruction Encoding
//!
//! An append-only machine code buffer with encoders for exactly the
//! instruction forms the statement compiler emits, plus three side tables:
//!
//! - pending jumps whose rel32 displacement is still the sentinel,
//! - constant strings whose address must be filled in later,
//! - call sites whose target is not yet known.
//!
//! ## Instruction Format
//!
//! ```text
//! [REX.W] [Opcode] [ModR/M] [Disp] [Imm]
//! ```

use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use super::registers::Reg64;
use crate::{Error, Result};

/// REX prefix with only W set (64-bit operand size)
pub const REX_W: u8 = 0x48;

/// Placeholder written into the displacement of every pending jump
pub const JUMP_SENTINEL: u32 = 0xDEAD_BEEF;

static NEXT_JUMP_ID: AtomicUsize = AtomicUsize::new(0);

/// Opaque handle to a jump whose displacement is not yet known.
///
/// Handles stay valid when their buffer is appended into another one; the
/// destination buffer takes over resolving them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingJump {
    id: usize,
}

impl PendingJump {
    fn fresh() -> Self {
        Self {
            id: NEXT_JUMP_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// A pending jump and the offset just past its displacement field
#[derive(Debug, Clone, Copy)]
struct JumpSite {
    jump: PendingJump,
    location: usize,
}

/// How an embedded string's address reaches the code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringAddressing {
    /// 8-byte immediate holding a host pointer (JIT only)
    Absolute,
    /// 4-byte RIP-relative displacement, fixed up by a relocation
    RipRelative,
}

/// A constant string referenced from the code
#[derive(Debug)]
pub struct ConstString {
    pub text: String,
    /// Offset of the immediate or displacement that holds the address
    pub location: usize,
    pub addressing: StringAddressing,
    /// Backing storage for absolute references. The heap pointer is what the
    /// code embeds, so it must live as long as the buffer.
    host: Option<CString>,
}

impl ConstString {
    /// Address of the NUL-terminated copy embedded by an absolute reference
    pub fn host_address(&self) -> Option<u64> {
        self.host.as_ref().map(|s| s.as_ptr() as u64)
    }
}

/// A relative call whose target symbol is not known yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternCall {
    pub symbol: String,
    /// Offset of the rel32 displacement of the `call`
    pub location: usize,
}

/// Signed conditions usable by `jcc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl JumpCondition {
    /// Second opcode byte of the `0F 8x` near form
    fn opcode(self) -> u8 {
        match self {
            JumpCondition::Equal => 0x84,
            JumpCondition::NotEqual => 0x85,
            JumpCondition::Less => 0x8C,
            JumpCondition::GreaterOrEqual => 0x8D,
            JumpCondition::LessOrEqual => 0x8E,
            JumpCondition::Greater => 0x8F,
        }
    }
}

/// ModR/M byte builder
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    mod_: u8, // 2 bits: addressing mode
    reg: u8,  // 3 bits: register or opcode extension
    rm: u8,   // 3 bits: register or memory operand
}

impl ModRM {
    /// Create ModR/M for register-to-register (mod=11)
    pub fn reg_reg(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for register with opcode extension (mod=11)
    pub fn reg_opext(opext: u8, rm: u8) -> Self {
        Self::reg_reg(opext, rm)
    }

    /// [rbp + disp8] (mod=01)
    pub fn rbp_disp8(reg: u8) -> Self {
        Self {
            mod_: 0b01,
            reg: reg & 0x07,
            rm: Reg64::RBP.encoding(),
        }
    }

    /// [rbp + disp32] (mod=10)
    pub fn rbp_disp32(reg: u8) -> Self {
        Self {
            mod_: 0b10,
            reg: reg & 0x07,
            rm: Reg64::RBP.encoding(),
        }
    }

    /// [rip + disp32] (mod=00, rm=101)
    pub fn rip_relative(reg: u8) -> Self {
        Self {
            mod_: 0b00,
            reg: reg & 0x07,
            rm: 0b101,
        }
    }

    /// Encode to byte
    pub fn encode(&self) -> u8 {
        (self.mod_ << 6) | (self.reg << 3) | self.rm
    }
}

/// Machine code buffer for emitting instructions
#[derive(Debug, Default)]
pub struct InstrBuffer {
    code: Vec<u8>,
    jumps: Vec<JumpSite>,
    strings: Vec<ConstString>,
    externs: Vec<ExternCall>,
}

impl InstrBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emit a single byte
    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit little-endian value
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit little-endian value
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit little-endian value
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Patch a 32-bit value at an offset previously returned by this buffer
    pub(crate) fn patch_i32(&mut self, offset: usize, value: i32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Get the generated code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn const_strings(&self) -> &[ConstString] {
        &self.strings
    }

    pub fn extern_calls(&self) -> &[ExternCall] {
        &self.externs
    }

    /// Number of jumps that still carry the sentinel
    pub fn pending_jumps(&self) -> usize {
        self.jumps.len()
    }

    /// Fails unless every pending jump has been resolved
    pub fn ensure_resolved(&self) -> Result<()> {
        if self.jumps.is_empty() {
            Ok(())
        } else {
            Err(Error::UnresolvedJumps {
                count: self.jumps.len(),
            })
        }
    }

    /// Remove and return every unresolved call site
    pub fn take_extern_calls(&mut self) -> Vec<ExternCall> {
        std::mem::take(&mut self.externs)
    }

    /// Record a call site whose target is still unknown
    pub fn record_extern_call(&mut self, symbol: &str, location: usize) {
        self.externs.push(ExternCall {
            symbol: symbol.to_string(),
            location,
        });
    }

    /// Move all bytes and side-table entries of `other` to the end of this
    /// buffer, leaving `other` empty.
    pub fn append(&mut self, other: &mut InstrBuffer) {
        let base = self.code.len();
        self.code.append(&mut other.code);
        self.jumps.extend(other.jumps.drain(..).map(|site| JumpSite {
            location: site.location + base,
            ..site
        }));
        self.strings.extend(other.strings.drain(..).map(|string| ConstString {
            location: string.location + base,
            ..string
        }));
        self.externs.extend(other.externs.drain(..).map(|call| ExternCall {
            location: call.location + base,
            ..call
        }));
    }

    // ==================== Jump Resolution ====================

    /// Offset just past the displacement of a pending jump
    pub fn jump_location(&self, jump: PendingJump) -> Option<usize> {
        self.jumps
            .iter()
            .find(|site| site.jump == jump)
            .map(|site| site.location)
    }

    /// Overwrite a pending jump's displacement with `offset` and retire it
    pub fn resolve(&mut self, jump: PendingJump, offset: i32) -> Result<()> {
        let index = self
            .jumps
            .iter()
            .position(|site| site.jump == jump)
            .ok_or(Error::UnknownJump)?;
        let location = self.jumps[index].location;

        if self.code[location - 4..location] != JUMP_SENTINEL.to_le_bytes() {
            return Err(Error::JumpAlreadyResolved { location });
        }

        self.jumps.swap_remove(index);
        self.patch_i32(location - 4, offset);
        trace!(location, offset, "resolved jump");
        Ok(())
    }

    /// Resolve a pending jump so that it lands on `target`
    pub fn resolve_to(&mut self, jump: PendingJump, target: usize) -> Result<()> {
        let location = self.jump_location(jump).ok_or(Error::UnknownJump)?;
        let offset = i32::try_from(target as i64 - location as i64)
            .map_err(|_| Error::DisplacementOutOfRange)?;
        self.resolve(jump, offset)
    }

    fn push_pending(&mut self) -> PendingJump {
        self.emit_u32(JUMP_SENTINEL);
        let jump = PendingJump::fresh();
        self.jumps.push(JumpSite {
            jump,
            location: self.offset(),
        });
        jump
    }

    // ==================== String Embedding ====================

    /// MOV r64, imm64 holding the host address of `text` (JIT only)
    pub fn mov_r64_host_string(&mut self, dst: Reg64, text: &str) -> Result<()> {
        let host = CString::new(text).map_err(|_| Error::InteriorNul {
            text: text.to_string(),
        })?;
        self.mov_r64_imm64(dst, host.as_ptr() as u64);
        self.strings.push(ConstString {
            text: text.to_string(),
            location: self.offset() - 8,
            addressing: StringAddressing::Absolute,
            host: Some(host),
        });
        Ok(())
    }

    /// LEA r64, [rip + disp32] with the displacement left for a relocation
    pub fn lea_r64_string(&mut self, dst: Reg64, text: &str) -> Result<()> {
        if text.contains('\0') {
            return Err(Error::InteriorNul {
                text: text.to_string(),
            });
        }
        let location = self.lea_r64_rip(dst);
        self.strings.push(ConstString {
            text: text.to_string(),
            location,
            addressing: StringAddressing::RipRelative,
            host: None,
        });
        Ok(())
    }

    // ==================== Data Movement ====================

    /// MOV r64, imm64 (movabs)
    pub fn mov_r64_imm64(&mut self, dst: Reg64, imm: u64) {
        self.emit(REX_W);
        self.emit(0xB8 + dst.encoding()); // B8+rd
        self.emit_u64(imm);
    }

    /// MOV r64, r64
    pub fn mov_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit(REX_W);
        self.emit(0x89); // 89 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// MOV [rbp + disp], r64
    pub fn mov_stack_r64(&mut self, disp: i32, src: Reg64) {
        self.emit(REX_W);
        self.emit(0x89); // 89 /r
        self.emit_rbp_operand(src, disp);
    }

    /// MOV r64, [rbp + disp]
    pub fn mov_r64_stack(&mut self, dst: Reg64, disp: i32) {
        self.emit(REX_W);
        self.emit(0x8B); // 8B /r
        self.emit_rbp_operand(dst, disp);
    }

    /// LEA r64, [rip + 0], returning the offset of the displacement
    pub fn lea_r64_rip(&mut self, dst: Reg64) -> usize {
        self.emit(REX_W);
        self.emit(0x8D); // 8D /r
        self.emit(ModRM::rip_relative(dst.encoding()).encode());
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    fn emit_rbp_operand(&mut self, reg: Reg64, disp: i32) {
        match i8::try_from(disp) {
            Ok(disp8) => {
                self.emit(ModRM::rbp_disp8(reg.encoding()).encode());
                self.emit(disp8 as u8);
            }
            Err(_) => {
                self.emit(ModRM::rbp_disp32(reg.encoding()).encode());
                self.emit_i32(disp);
            }
        }
    }

    // ==================== Arithmetic ====================

    /// ADD r64, r64
    pub fn add_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        self.emit(REX_W);
        self.emit(0x03); // 03 /r
        self.emit(ModRM::reg_reg(dst.encoding(), src.encoding()).encode());
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        self.emit(REX_W);
        self.emit(0x81); // 81 /0
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
        self.emit_i32(imm);
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_r64_imm32(&mut self, dst: Reg64, imm: i32) {
        self.emit(REX_W);
        self.emit(0x81); // 81 /5
        self.emit(ModRM::reg_opext(5, dst.encoding()).encode());
        self.emit_i32(imm);
    }

    /// CQO; IDIV r64
    ///
    /// Sign-extends RAX into RDX:RAX and divides by `divisor`, leaving the
    /// quotient in RAX and the remainder in RDX.
    pub fn cqo_idiv_r64(&mut self, divisor: Reg64) -> Result<()> {
        if matches!(divisor, Reg64::RAX | Reg64::RDX) {
            return Err(Error::InvalidDivisor { register: divisor });
        }
        self.emit(REX_W);
        self.emit(0x99); // cqo
        self.emit(REX_W);
        self.emit(0xF7); // F7 /7
        self.emit(ModRM::reg_opext(7, divisor.encoding()).encode());
        Ok(())
    }

    // ==================== Comparison ====================

    /// CMP r64, r64
    pub fn cmp_r64_r64(&mut self, left: Reg64, right: Reg64) {
        self.emit(REX_W);
        self.emit(0x3B); // 3B /r
        self.emit(ModRM::reg_reg(left.encoding(), right.encoding()).encode());
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push_r64(&mut self, reg: Reg64) {
        self.emit(0xFF); // FF /6
        self.emit(ModRM::reg_opext(6, reg.encoding()).encode());
    }

    /// POP r64
    pub fn pop_r64(&mut self, reg: Reg64) {
        self.emit(0x58 + reg.encoding()); // 58+rd
    }

    // ==================== Control Flow ====================

    /// RET
    pub fn ret(&mut self) {
        self.emit(0xC3);
    }

    /// CALL r64
    pub fn call_r64(&mut self, target: Reg64) {
        self.emit(0xFF); // FF /2
        self.emit(ModRM::reg_opext(2, target.encoding()).encode());
    }

    /// CALL rel32 (near call, returns offset of the displacement)
    pub fn call_rel32(&mut self) -> usize {
        self.emit(0xE8); // E8 cd
        let offset = self.offset();
        self.emit_i32(0);
        offset
    }

    /// CALL rel32 to a symbol resolved later by the linker
    pub fn call_extern(&mut self, symbol: &str) {
        let location = self.call_rel32();
        self.record_extern_call(symbol, location);
    }

    /// JMP rel32 with the displacement left pending
    pub fn jmp_pending(&mut self) -> PendingJump {
        self.emit(0xE9); // E9 cd
        self.push_pending()
    }

    /// Jcc rel32 with the displacement left pending
    pub fn jcc_pending(&mut self, cond: JumpCondition) -> PendingJump {
        self.emit(0x0F);
        self.emit(cond.opcode()); // 0F 8x cd
        self.push_pending()
    }

    /// Jcc rel32 with a known displacement
    pub fn jcc_rel32(&mut self, cond: JumpCondition, rel: i32) {
        self.emit(0x0F);
        self.emit(cond.opcode()); // 0F 8x cd
        self.emit_i32(rel);
    }
}
