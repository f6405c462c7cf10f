//! Statement tree to x64 Code Generation
//!
//! Lowers one function body at a time into an [`InstrBuffer`].
//!
//! ## Frame layout
//!
//! ```text
//! push rbp; mov rbp, rsp          function prologue
//!   sub rsp, align16(8 * vars)    per block, only when vars > 0
//!   ...statements...
//!   add rsp, align16(8 * vars)
//! pop rbp; ret                    function epilogue
//! ```
//!
//! Variables live in RBP-relative slots (see [`super::scope`]). Expressions
//! are evaluated straight into a destination register; any other register an
//! expression clobbers is saved on the stack around it.

use std::fmt;

use tracing::debug;

use crate::ast::{
    Block, Calculation, Comparator, Condition, FunctionCall, IfChain, Loop, Operation, Param,
    Statement,
};
use crate::{Error, Result};

use super::encoding::{InstrBuffer, JumpCondition};
use super::registers::{Reg64, DIVISION_REGS, SYSV_ARG_REGS};
use super::scope::{frame_size, Scope};
use super::symbols::SymbolResolver;

/// How call targets and string addresses are materialized
#[derive(Clone, Copy)]
pub enum Mode<'r> {
    /// Code runs in this process: known symbols are called through their
    /// absolute address and strings are referenced by host pointer.
    Jit(&'r dyn SymbolResolver),
    /// Code is written to a relocatable object: every call and string
    /// reference is left for the linker.
    ObjectFile,
}

impl fmt::Debug for Mode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Jit(_) => write!(f, "Jit"),
            Mode::ObjectFile => write!(f, "ObjectFile"),
        }
    }
}

/// Comparator lowered to the jump taken when the comparison is false
fn skip_condition(comparator: Comparator) -> JumpCondition {
    match comparator {
        Comparator::Equal => JumpCondition::NotEqual,
        Comparator::NotEqual => JumpCondition::Equal,
        Comparator::LessThan => JumpCondition::GreaterOrEqual,
        Comparator::LessThanOrEqual => JumpCondition::Greater,
        Comparator::GreaterThan => JumpCondition::LessOrEqual,
        Comparator::GreaterThanOrEqual => JumpCondition::Less,
    }
}

fn rel32(distance: usize) -> Result<i32> {
    i32::try_from(distance).map_err(|_| Error::DisplacementOutOfRange)
}

/// x64 statement compiler
#[derive(Debug, Clone, Copy)]
pub struct Compiler<'r> {
    mode: Mode<'r>,
}

impl<'r> Compiler<'r> {
    pub fn new(mode: Mode<'r>) -> Self {
        Self { mode }
    }

    /// Compile a complete function: prologue, body, epilogue
    pub fn compile_function(&self, block: &Block, buf: &mut InstrBuffer) -> Result<()> {
        self.emit_prologue(buf);
        self.compile_block(&Scope::root(block), buf)?;
        self.emit_epilogue(buf);
        Ok(())
    }

    /// Compile a block, reserving and releasing its stack frame
    pub fn compile_block(&self, scope: &Scope<'_>, buf: &mut InstrBuffer) -> Result<()> {
        let frame = frame_size(scope.block());
        if frame > 0 {
            buf.sub_r64_imm32(Reg64::RSP, frame);
        }

        for statement in &scope.block().statements {
            self.compile_statement(scope, statement, buf)?;
        }

        if frame > 0 {
            buf.add_r64_imm32(Reg64::RSP, frame);
        }
        Ok(())
    }

    /// Emit function prologue
    fn emit_prologue(&self, buf: &mut InstrBuffer) {
        buf.push_r64(Reg64::RBP);
        buf.mov_r64_r64(Reg64::RBP, Reg64::RSP);
    }

    /// Emit function epilogue
    fn emit_epilogue(&self, buf: &mut InstrBuffer) {
        buf.pop_r64(Reg64::RBP);
        buf.ret();
    }

    fn compile_statement(
        &self,
        scope: &Scope<'_>,
        statement: &Statement,
        buf: &mut InstrBuffer,
    ) -> Result<()> {
        match statement {
            Statement::Call(call) => self.compile_call(scope, call, buf),
            Statement::Assign(assign) => {
                let offset = scope.stack_offset(&assign.target)?;
                self.compile_param(scope, &assign.value, Reg64::RAX, buf)?;
                buf.mov_stack_r64(offset, Reg64::RAX);
                Ok(())
            }
            Statement::IfChain(chain) => self.compile_if_chain(scope, chain, buf),
            Statement::Loop(looped) => self.compile_loop(scope, looped, buf),
        }
    }

    // ==================== Expressions ====================

    /// Evaluate `param` into `dest`
    fn compile_param(
        &self,
        scope: &Scope<'_>,
        param: &Param,
        dest: Reg64,
        buf: &mut InstrBuffer,
    ) -> Result<()> {
        match param {
            Param::Int64(value) => buf.mov_r64_imm64(dest, *value as u64),
            Param::Str(text) => match self.mode {
                Mode::Jit(_) => buf.mov_r64_host_string(dest, text)?,
                Mode::ObjectFile => buf.lea_r64_string(dest, text)?,
            },
            Param::Variable(name) => {
                let offset = scope.stack_offset(name)?;
                buf.mov_r64_stack(dest, offset);
            }
            Param::Calculation(calc) => match calc.op {
                Operation::Add => self.compile_addition(scope, calc, dest, buf)?,
                Operation::Mod => self.compile_modulo(scope, calc, dest, buf)?,
            },
        }
        Ok(())
    }

    fn compile_addition(
        &self,
        scope: &Scope<'_>,
        calc: &Calculation,
        dest: Reg64,
        buf: &mut InstrBuffer,
    ) -> Result<()> {
        let temp = dest.successor();

        buf.push_r64(temp);
        self.compile_param(scope, &calc.lhs, dest, buf)?;
        self.compile_param(scope, &calc.rhs, temp, buf)?;
        buf.add_r64_r64(dest, temp);
        buf.pop_r64(temp);
        Ok(())
    }

    fn compile_modulo(
        &self,
        scope: &Scope<'_>,
        calc: &Calculation,
        dest: Reg64,
        buf: &mut InstrBuffer,
    ) -> Result<()> {
        let saved: Vec<Reg64> = DIVISION_REGS
            .iter()
            .copied()
            .filter(|&reg| reg != dest)
            .collect();

        for &reg in &saved {
            buf.push_r64(reg);
        }

        self.compile_param(scope, &calc.lhs, Reg64::RAX, buf)?;
        self.compile_param(scope, &calc.rhs, Reg64::RCX, buf)?;
        buf.cqo_idiv_r64(Reg64::RCX)?;
        if dest != Reg64::RDX {
            buf.mov_r64_r64(dest, Reg64::RDX);
        }

        for &reg in saved.iter().rev() {
            buf.pop_r64(reg);
        }
        Ok(())
    }

    // ==================== Calls ====================

    fn compile_call(
        &self,
        scope: &Scope<'_>,
        call: &FunctionCall,
        buf: &mut InstrBuffer,
    ) -> Result<()> {
        if call.params.len() > SYSV_ARG_REGS.len() {
            return Err(Error::TooManyArguments {
                function: call.name.clone(),
                count: call.params.len(),
            });
        }

        for (param, &reg) in call.params.iter().zip(SYSV_ARG_REGS.iter()) {
            self.compile_param(scope, param, reg, buf)?;
        }

        let address = match self.mode {
            Mode::Jit(resolver) => resolver.resolve(&call.name),
            Mode::ObjectFile => None,
        };

        match address {
            Some(address) => {
                buf.mov_r64_imm64(Reg64::RAX, address);
                buf.call_r64(Reg64::RAX);
            }
            None => buf.call_extern(&call.name),
        }
        Ok(())
    }

    // ==================== Control Flow ====================

    /// Compare `lhs` with `rhs` and jump `skip` bytes forward when the
    /// condition does not hold
    fn compile_condition(
        &self,
        scope: &Scope<'_>,
        condition: &Condition,
        skip: usize,
        buf: &mut InstrBuffer,
    ) -> Result<()> {
        self.compile_param(scope, &condition.lhs, Reg64::RAX, buf)?;
        self.compile_param(scope, &condition.rhs, Reg64::RCX, buf)?;
        buf.cmp_r64_r64(Reg64::RAX, Reg64::RCX);
        buf.jcc_rel32(skip_condition(condition.comparator), rel32(skip)?);
        Ok(())
    }

    fn compile_if_chain(
        &self,
        scope: &Scope<'_>,
        chain: &IfChain,
        buf: &mut InstrBuffer,
    ) -> Result<()> {
        let mut exits = Vec::new();
        let last = chain.arms.len().saturating_sub(1);

        for (i, arm) in chain.arms.iter().enumerate() {
            let mut arm_buf = InstrBuffer::new();
            self.compile_block(&Scope::nested(&arm.block, scope), &mut arm_buf)?;
            if i != last {
                exits.push(arm_buf.jmp_pending());
            }

            // the skip covers the arm's exit jump as well
            if let Some(condition) = &arm.condition {
                self.compile_condition(scope, condition, arm_buf.len(), buf)?;
            }
            debug!(arm = i, len = arm_buf.len(), "lowered if arm");
            buf.append(&mut arm_buf);
        }

        let end = buf.len();
        for exit in exits {
            buf.resolve_to(exit, end)?;
        }
        Ok(())
    }

    fn compile_loop(&self, scope: &Scope<'_>, looped: &Loop, buf: &mut InstrBuffer) -> Result<()> {
        let start = buf.len();

        let mut body = InstrBuffer::new();
        self.compile_block(&Scope::nested(&looped.body, scope), &mut body)?;
        let repeat = body.jmp_pending();

        self.compile_condition(scope, &looped.condition, body.len(), buf)?;
        debug!(body = body.len(), "lowered while loop");
        buf.append(&mut body);
        buf.resolve_to(repeat, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ConditionalBlock, Param};
    use crate::x64::encoding::StringAddressing;
    use crate::x64::symbols::{NoSymbols, SymbolTable};
    use pretty_assertions::assert_eq;

    fn compile_object(block: &Block) -> InstrBuffer {
        let mut buf = InstrBuffer::new();
        Compiler::new(Mode::ObjectFile)
            .compile_block(&Scope::root(block), &mut buf)
            .unwrap();
        buf
    }

    fn mov_imm(opcode: u8, value: u64) -> Vec<u8> {
        let mut bytes = vec![0x48, opcode];
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes
    }

    fn cond(comparator: Comparator, lhs: Param, rhs: Param) -> Condition {
        Condition {
            comparator,
            lhs,
            rhs,
        }
    }

    #[test]
    fn test_function_prologue_epilogue() {
        let mut buf = InstrBuffer::new();
        Compiler::new(Mode::ObjectFile)
            .compile_function(&Block::new(), &mut buf)
            .unwrap();
        assert_eq!(buf.code(), &[0xFF, 0xF5, 0x48, 0x89, 0xE5, 0x5D, 0xC3]);
    }

    #[test]
    fn test_block_frame() {
        let buf = compile_object(&Block::new().declare("a").declare("b").declare("c"));
        assert_eq!(
            buf.code(),
            &[
                0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00, // sub rsp, 32
                0x48, 0x81, 0xC4, 0x20, 0x00, 0x00, 0x00, // add rsp, 32
            ]
        );
    }

    #[test]
    fn test_jit_call_resolved_address() {
        let symbols = SymbolTable::new().with("test", 0x1122_3344_5566_7788);
        let block = Block::new().with(Statement::call("test", vec![]));
        let mut buf = InstrBuffer::new();
        Compiler::new(Mode::Jit(&symbols))
            .compile_block(&Scope::root(&block), &mut buf)
            .unwrap();

        let mut expected = mov_imm(0xB8, 0x1122_3344_5566_7788);
        expected.extend_from_slice(&[0xFF, 0xD0]);
        assert_eq!(buf.code(), expected.as_slice());
        assert_eq!(buf.len(), 12);
        assert!(buf.extern_calls().is_empty());
    }

    #[test]
    fn test_jit_call_unknown_symbol_is_extern() {
        let block = Block::new().with(Statement::call("nowhere", vec![]));
        let mut buf = InstrBuffer::new();
        Compiler::new(Mode::Jit(&NoSymbols))
            .compile_block(&Scope::root(&block), &mut buf)
            .unwrap();
        assert_eq!(buf.code(), &[0xE8, 0, 0, 0, 0]);
        assert_eq!(buf.extern_calls()[0].symbol, "nowhere");
        assert_eq!(buf.extern_calls()[0].location, 1);
    }

    #[test]
    fn test_object_call_with_argument() {
        let block = Block::new().with(Statement::call("puts", vec![Param::Int64(5)]));
        let buf = compile_object(&block);

        let mut expected = mov_imm(0xBF, 5); // mov rdi, 5
        expected.extend_from_slice(&[0xE8, 0, 0, 0, 0]);
        assert_eq!(buf.code(), expected.as_slice());
        assert_eq!(buf.extern_calls()[0].location, 11);
    }

    #[test]
    fn test_object_string_argument() {
        let block = Block::new().with(Statement::call("puts", vec![Param::str("hi")]));
        let buf = compile_object(&block);

        assert_eq!(&buf.code()[..7], &[0x48, 0x8D, 0x3D, 0, 0, 0, 0]);
        let string = &buf.const_strings()[0];
        assert_eq!(string.text, "hi");
        assert_eq!(string.location, 3);
        assert_eq!(string.addressing, StringAddressing::RipRelative);
    }

    #[test]
    fn test_four_arguments_use_sysv_registers() {
        let params = (1..=4).map(Param::Int64).collect();
        let block = Block::new().with(Statement::call("f", params));
        let buf = compile_object(&block);

        let opcodes: Vec<u8> = buf.code().chunks(10).take(4).map(|c| c[1]).collect();
        // rdi, rsi, rdx, rcx
        assert_eq!(opcodes, vec![0xBF, 0xBE, 0xBA, 0xB9]);
    }

    #[test]
    fn test_too_many_arguments() {
        let params = (1..=5).map(Param::Int64).collect();
        let block = Block::new().with(Statement::call("f", params));
        let mut buf = InstrBuffer::new();
        let err = Compiler::new(Mode::ObjectFile)
            .compile_block(&Scope::root(&block), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::TooManyArguments { count: 5, .. }));
    }

    #[test]
    fn test_assign_addition() {
        let block = Block::new().declare("test").with(Statement::assign(
            "test",
            Param::calc(Operation::Add, Param::Int64(1), Param::Int64(2)),
        ));
        let buf = compile_object(&block);

        let mut expected = vec![0x48, 0x81, 0xEC, 0x10, 0, 0, 0]; // sub rsp, 16
        expected.extend_from_slice(&[0xFF, 0xF1]); // push rcx
        expected.extend(mov_imm(0xB8, 1)); // mov rax, 1
        expected.extend(mov_imm(0xB9, 2)); // mov rcx, 2
        expected.extend_from_slice(&[0x48, 0x03, 0xC1]); // add rax, rcx
        expected.push(0x59); // pop rcx
        expected.extend_from_slice(&[0x48, 0x89, 0x45, 0xF8]); // mov [rbp-8], rax
        expected.extend_from_slice(&[0x48, 0x81, 0xC4, 0x10, 0, 0, 0]); // add rsp, 16
        assert_eq!(buf.code(), expected.as_slice());
    }

    #[test]
    fn test_assign_modulo() {
        let block = Block::new().declare("test").with(Statement::assign(
            "test",
            Param::calc(Operation::Mod, Param::Int64(7), Param::Int64(3)),
        ));
        let buf = compile_object(&block);

        let mut expected = vec![0x48, 0x81, 0xEC, 0x10, 0, 0, 0];
        expected.extend_from_slice(&[0xFF, 0xF2, 0xFF, 0xF1]); // push rdx; push rcx
        expected.extend(mov_imm(0xB8, 7));
        expected.extend(mov_imm(0xB9, 3));
        expected.extend_from_slice(&[0x48, 0x99, 0x48, 0xF7, 0xF9]); // cqo; idiv rcx
        expected.extend_from_slice(&[0x48, 0x89, 0xD0]); // mov rax, rdx
        expected.extend_from_slice(&[0x59, 0x5A]); // pop rcx; pop rdx
        expected.extend_from_slice(&[0x48, 0x89, 0x45, 0xF8]);
        expected.extend_from_slice(&[0x48, 0x81, 0xC4, 0x10, 0, 0, 0]);
        assert_eq!(buf.code(), expected.as_slice());
    }

    #[test]
    fn test_modulo_into_argument_register_saves_all_division_registers() {
        let block = Block::new().with(Statement::call(
            "f",
            vec![Param::calc(Operation::Mod, Param::Int64(7), Param::Int64(3))],
        ));
        let buf = compile_object(&block);
        assert_eq!(&buf.code()[..6], &[0xFF, 0xF0, 0xFF, 0xF2, 0xFF, 0xF1]);
        // mov rdi, rdx; pop rcx; pop rdx; pop rax
        let tail = &buf.code()[buf.len() - 5 - 6..buf.len() - 5];
        assert_eq!(tail, &[0x48, 0x89, 0xD7, 0x59, 0x5A, 0x58]);
    }

    #[test]
    fn test_unknown_variable_fails() {
        let block = Block::new().with(Statement::assign("ghost", Param::Int64(1)));
        let mut buf = InstrBuffer::new();
        let err = Compiler::new(Mode::ObjectFile)
            .compile_block(&Scope::root(&block), &mut buf)
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot find variable name: ghost");
    }

    #[test]
    fn test_if_statement() {
        let arm = Block::new().with(Statement::assign("x", Param::Int64(4)));
        let block = Block::new()
            .declare("x")
            .with(Statement::IfChain(IfChain {
                arms: vec![ConditionalBlock {
                    condition: Some(cond(Comparator::Equal, Param::var("x"), Param::Int64(1234))),
                    block: arm,
                }],
            }));
        let buf = compile_object(&block);

        let mut expected = vec![0x48, 0x81, 0xEC, 0x10, 0, 0, 0];
        expected.extend_from_slice(&[0x48, 0x8B, 0x45, 0xF8]); // mov rax, [rbp-8]
        expected.extend(mov_imm(0xB9, 1234)); // mov rcx, 1234
        expected.extend_from_slice(&[0x48, 0x3B, 0xC1]); // cmp rax, rcx
        expected.extend_from_slice(&[0x0F, 0x85, 0x0E, 0, 0, 0]); // jne +14
        expected.extend(mov_imm(0xB8, 4));
        expected.extend_from_slice(&[0x48, 0x89, 0x45, 0xF8]);
        expected.extend_from_slice(&[0x48, 0x81, 0xC4, 0x10, 0, 0, 0]);
        assert_eq!(buf.code(), expected.as_slice());
        assert_eq!(buf.pending_jumps(), 0);
    }

    #[test]
    fn test_if_else_chain() {
        let assign = |v| Block::new().with(Statement::assign("x", Param::Int64(v)));
        let block = Block::new()
            .declare("x")
            .with(Statement::IfChain(IfChain {
                arms: vec![
                    ConditionalBlock {
                        condition: Some(cond(Comparator::Equal, Param::var("x"), Param::Int64(1))),
                        block: assign(2),
                    },
                    ConditionalBlock {
                        condition: None,
                        block: assign(3),
                    },
                ],
            }));
        let buf = compile_object(&block);
        let code = &buf.code()[7..buf.len() - 7];

        // cmp sequence is 17 bytes, then jne over the 14-byte arm and its exit jump
        assert_eq!(&code[17..23], &[0x0F, 0x85, 0x13, 0, 0, 0]);
        // exit jump skips the 14-byte else arm
        assert_eq!(&code[37..42], &[0xE9, 0x0E, 0, 0, 0]);
        assert_eq!(code.len(), 42 + 14);
        assert_eq!(buf.pending_jumps(), 0);
    }

    #[test]
    fn test_else_if_uses_negated_comparators() {
        let empty = || Block::new().with(Statement::call("f", vec![]));
        let block = Block::new()
            .declare("x")
            .with(Statement::IfChain(IfChain {
                arms: vec![
                    ConditionalBlock {
                        condition: Some(cond(Comparator::LessThan, Param::var("x"), Param::Int64(0))),
                        block: empty(),
                    },
                    ConditionalBlock {
                        condition: Some(cond(
                            Comparator::GreaterThanOrEqual,
                            Param::var("x"),
                            Param::Int64(9),
                        )),
                        block: empty(),
                    },
                ],
            }));
        let buf = compile_object(&block);
        let code = &buf.code()[7..];

        // arm 0: 17-byte compare, jge over call(5)+jmp(5)
        assert_eq!(&code[17..23], &[0x0F, 0x8D, 0x0A, 0, 0, 0]);
        // arm 0 exit jump lands after arm 1 (17 + 6 + 5 bytes)
        assert_eq!(&code[28..33], &[0xE9, 28, 0, 0, 0]);
        // arm 1: jl over its call only
        assert_eq!(&code[33 + 17..33 + 23], &[0x0F, 0x8C, 0x05, 0, 0, 0]);
        assert_eq!(buf.extern_calls().len(), 2);
    }

    #[test]
    fn test_while_loop() {
        let body = Block::new().with(Statement::assign(
            "x",
            Param::calc(Operation::Add, Param::var("x"), Param::Int64(1)),
        ));
        let block = Block::new().declare("x").with(Statement::Loop(Loop {
            condition: cond(Comparator::LessThan, Param::var("x"), Param::Int64(5)),
            body,
        }));
        let buf = compile_object(&block);
        let code = &buf.code()[7..buf.len() - 7];

        // body: push(2) load(4) mov(10) add(3) pop(1) store(4) = 24, plus jmp(5)
        assert_eq!(&code[17..23], &[0x0F, 0x8D, 29, 0, 0, 0]);
        assert_eq!(code.len(), 23 + 29);
        let back = i32::from_le_bytes(code[code.len() - 4..].try_into().unwrap());
        assert_eq!(back, -(29 + 23));
        assert_eq!(code[code.len() - 5], 0xE9);
    }

    #[test]
    fn test_nested_block_frames_and_offsets() {
        let inner = Block::new()
            .declare("another")
            .with(Statement::assign("another", Param::var("test")));
        let block = Block::new().declare("test").with(Statement::Loop(Loop {
            condition: cond(Comparator::NotEqual, Param::var("test"), Param::Int64(0)),
            body: inner,
        }));
        let buf = compile_object(&block);
        let code = buf.code();

        // loop body: sub rsp, 16; mov rax, [rbp-8]; mov [rbp-24], rax; add rsp, 16; jmp
        let body_start = 7 + 17 + 6;
        assert_eq!(&code[body_start..body_start + 3], &[0x48, 0x81, 0xEC]);
        assert_eq!(&code[body_start + 7..body_start + 11], &[0x48, 0x8B, 0x45, 0xF8]);
        assert_eq!(&code[body_start + 11..body_start + 15], &[0x48, 0x89, 0x45, 0xE8]);
    }
}
