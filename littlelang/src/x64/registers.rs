//! x64 Register Definitions
//!
//! The eight legacy 64-bit general-purpose registers. Only these are ever
//! encoded, so no instruction needs REX.R/REX.B and every register fits the
//! 3-bit ModR/M fields.

use std::fmt;

/// x64 64-bit general purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
}

impl Reg64 {
    /// Get the 3-bit encoding for ModR/M bytes and `+r` opcodes
    #[inline]
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// The register used as the second temporary when evaluating a binary
    /// expression into `self`.
    ///
    /// Walks [`SCRATCH_ORDER`] cyclically, so the stack and frame pointers are
    /// never handed out. RSP and RBP are never evaluation targets and map to
    /// the start of the order.
    pub fn successor(self) -> Reg64 {
        SCRATCH_ORDER
            .iter()
            .position(|&reg| reg == self)
            .map_or(SCRATCH_ORDER[0], |i| SCRATCH_ORDER[(i + 1) % SCRATCH_ORDER.len()])
    }
}

impl fmt::Display for Reg64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg64::RAX => "rax",
            Reg64::RCX => "rcx",
            Reg64::RDX => "rdx",
            Reg64::RBX => "rbx",
            Reg64::RSP => "rsp",
            Reg64::RBP => "rbp",
            Reg64::RSI => "rsi",
            Reg64::RDI => "rdi",
        };
        write!(f, "{}", name)
    }
}

/// System V AMD64 integer argument registers usable by a call (in order)
pub const SYSV_ARG_REGS: [Reg64; 4] = [Reg64::RDI, Reg64::RSI, Reg64::RDX, Reg64::RCX];

/// Registers that expression evaluation may use as temporaries, in the order
/// successive nesting levels claim them.
pub const SCRATCH_ORDER: [Reg64; 6] = [
    Reg64::RAX,
    Reg64::RCX,
    Reg64::RDX,
    Reg64::RBX,
    Reg64::RSI,
    Reg64::RDI,
];

/// Registers fixed by `cqo`/`idiv`: dividend in RAX, divisor in RCX,
/// remainder in RDX
pub const DIVISION_REGS: [Reg64; 3] = [Reg64::RAX, Reg64::RDX, Reg64::RCX];
