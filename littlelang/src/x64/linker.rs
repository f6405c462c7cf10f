//! Translation unit linking
//!
//! Compiles every function of a unit into one buffer and patches calls
//! between them. Calls that no local function satisfies stay in the buffer's
//! extern table for the object emitters (or fail a JIT run).

use std::collections::HashSet;

use tracing::debug;

use crate::ast::{Block, TranslationUnit};
use crate::{Error, Result};

use super::codegen::{Compiler, Mode};
use super::encoding::InstrBuffer;
use super::symbols::ExcludingLocal;

/// A function defined in an [`Object`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Entry offset into the object's code
    pub offset: usize,
}

/// A call already patched to a function of the same object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCall {
    /// Index into [`Object::symbols`]
    pub target: usize,
    /// Offset of the rel32 operand
    pub location: usize,
}

/// Linked machine code plus the functions it defines
#[derive(Debug, Default)]
pub struct Object {
    pub buffer: InstrBuffer,
    pub symbols: Vec<Symbol>,
    /// Patched intra-object calls, kept for formats whose linker may move
    /// functions independently
    pub local_calls: Vec<LocalCall>,
}

impl Object {
    /// Compile a single-function program
    pub fn from_function(name: &str, block: &Block, mode: Mode<'_>) -> Result<Object> {
        let excluding;
        let mode = match mode {
            Mode::Jit(resolver) => {
                excluding = ExcludingLocal::new(resolver, [name]);
                Mode::Jit(&excluding)
            }
            Mode::ObjectFile => Mode::ObjectFile,
        };

        let mut object = Object::default();
        object.symbols.push(Symbol {
            name: name.to_string(),
            offset: 0,
        });
        Compiler::new(mode).compile_function(block, &mut object.buffer)?;
        debug!(function = name, len = object.buffer.len(), "compiled function");

        object.link_local_calls()?;
        Ok(object)
    }

    /// Compile every function of `unit` in declaration order and resolve
    /// calls between them
    pub fn from_translation_unit(unit: &TranslationUnit, mode: Mode<'_>) -> Result<Object> {
        let mut seen = HashSet::new();
        for function in &unit.functions {
            if !seen.insert(function.name.as_str()) {
                return Err(Error::DuplicateFunction {
                    name: function.name.clone(),
                });
            }
        }

        let excluding;
        let mode = match mode {
            Mode::Jit(resolver) => {
                excluding = ExcludingLocal::new(resolver, seen.iter().copied());
                Mode::Jit(&excluding)
            }
            Mode::ObjectFile => Mode::ObjectFile,
        };
        let compiler = Compiler::new(mode);

        let mut object = Object::default();
        for function in &unit.functions {
            let offset = object.buffer.len();
            object.symbols.push(Symbol {
                name: function.name.clone(),
                offset,
            });

            let mut function_buf = InstrBuffer::new();
            compiler.compile_function(&function.block, &mut function_buf)?;
            debug!(
                function = function.name.as_str(),
                offset,
                len = function_buf.len(),
                "compiled function"
            );
            object.buffer.append(&mut function_buf);
        }

        object.link_local_calls()?;
        Ok(object)
    }

    /// Look up a defined function
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|symbol| symbol.name == name)
    }

    pub fn code(&self) -> &[u8] {
        self.buffer.code()
    }

    /// Patch every call site whose target is defined in this object
    fn link_local_calls(&mut self) -> Result<()> {
        for call in self.buffer.take_extern_calls() {
            let index = self.symbols.iter().position(|symbol| symbol.name == call.symbol);
            match index {
                Some(index) => {
                    let target = self.symbols[index].offset;
                    let rel = target as i64 - (call.location as i64 + 4);
                    let rel = i32::try_from(rel).map_err(|_| Error::DisplacementOutOfRange)?;
                    self.buffer.patch_i32(call.location, rel);
                    self.local_calls.push(LocalCall {
                        target: index,
                        location: call.location,
                    });
                    debug!(symbol = call.symbol.as_str(), location = call.location, rel, "linked local call");
                }
                None => self.buffer.record_extern_call(&call.symbol, call.location),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FunctionDefinition, Param, Statement};
    use crate::x64::symbols::SymbolTable;
    use pretty_assertions::assert_eq;

    fn function(name: &str, block: Block) -> FunctionDefinition {
        FunctionDefinition {
            name: name.to_string(),
            block,
        }
    }

    fn rel32_at(object: &Object, location: usize) -> i32 {
        i32::from_le_bytes(object.code()[location..location + 4].try_into().unwrap())
    }

    #[test]
    fn test_link_local_call() {
        let unit = TranslationUnit {
            functions: vec![
                function(
                    "cool",
                    Block::new().with(Statement::call("puts", vec![Param::str("cool")])),
                ),
                function("main", Block::new().with(Statement::call("cool", vec![]))),
            ],
        };
        let object = Object::from_translation_unit(&unit, Mode::ObjectFile).unwrap();

        // cool: prologue(5) lea(7) call(5) epilogue(2)
        assert_eq!(object.symbol("cool").unwrap().offset, 0);
        assert_eq!(object.symbol("main").unwrap().offset, 19);

        let call_site = 19 + 5 + 1;
        assert_eq!(object.code()[call_site - 1], 0xE8);
        assert_eq!(rel32_at(&object, call_site), 0 - (call_site as i32 + 4));

        assert_eq!(
            object.local_calls,
            vec![LocalCall {
                target: 0,
                location: call_site
            }]
        );

        let externs = object.buffer.extern_calls();
        assert_eq!(externs.len(), 1);
        assert_eq!(externs[0].symbol, "puts");
        assert_eq!(externs[0].location, 5 + 7 + 1);
    }

    #[test]
    fn test_only_external_calls_remain() {
        let unit = TranslationUnit {
            functions: vec![
                function("f1", Block::new().with(Statement::call("f2", vec![]))),
                function(
                    "f2",
                    Block::new().with(Statement::call("unknown_extern", vec![])),
                ),
            ],
        };
        let object = Object::from_translation_unit(&unit, Mode::ObjectFile).unwrap();

        let names: Vec<&str> = object
            .buffer
            .extern_calls()
            .iter()
            .map(|call| call.symbol.as_str())
            .collect();
        assert_eq!(names, vec!["unknown_extern"]);

        // f1's call to f2, patched forward
        let f2 = object.symbol("f2").unwrap().offset as i32;
        assert_eq!(rel32_at(&object, 6), f2 - 10);
    }

    #[test]
    fn test_recursive_call() {
        let block = Block::new().with(Statement::call("main", vec![]));
        let object = Object::from_function("main", &block, Mode::ObjectFile).unwrap();
        assert_eq!(rel32_at(&object, 6), -10);
        assert!(object.buffer.extern_calls().is_empty());
    }

    #[test]
    fn test_duplicate_function() {
        let unit = TranslationUnit {
            functions: vec![
                function("main", Block::new()),
                function("main", Block::new()),
            ],
        };
        let err = Object::from_translation_unit(&unit, Mode::ObjectFile).unwrap_err();
        assert!(matches!(err, Error::DuplicateFunction { name } if name == "main"));
    }

    #[test]
    fn test_jit_local_function_shadows_host_symbol() {
        let host = SymbolTable::new().with("cool", 0xDEAD).with("puts", 0xBEEF);
        let unit = TranslationUnit {
            functions: vec![
                function("cool", Block::new()),
                function(
                    "main",
                    Block::new()
                        .with(Statement::call("cool", vec![]))
                        .with(Statement::call("puts", vec![])),
                ),
            ],
        };
        let object = Object::from_translation_unit(&unit, Mode::Jit(&host)).unwrap();
        let main = object.symbol("main").unwrap().offset;

        // rel32 call to the local cool, then mov rax, puts; call rax
        assert_eq!(object.code()[main + 5], 0xE8);
        assert_eq!(&object.code()[main + 10..main + 12], &[0x48, 0xB8]);
        assert!(object.buffer.extern_calls().is_empty());
    }
}
