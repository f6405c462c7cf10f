//! # littlelang
//!
//! A small imperative language compiled straight to x86-64 machine code,
//! either run in process or written as a relocatable object for `cc`.
//!
//! ## Pipeline
//!
//! | Stage   | Module            | Output                  |
//! |---------|-------------------|-------------------------|
//! | Parse   | [`parser`]        | [`ast::TranslationUnit`] |
//! | Compile | [`x64::codegen`]  | [`x64::InstrBuffer`]     |
//! | Link    | [`x64::linker`]   | [`x64::Object`]          |
//! | Emit    | [`x64::elf`], [`x64::macho`] | object file bytes |
//! | Run     | [`jit`]           | side effects            |

pub mod ast;
pub mod error;
pub mod parser;
pub mod x64;

pub use error::{Error, Result};
pub use x64::jit;
pub use x64::{Mode, Object, ObjectFormat};

use x64::symbols::{ProcessSymbols, SymbolResolver};

/// Compile littlelang source to a linked object for object-file output
///
/// # Arguments
///
/// * `source` - The littlelang source code to compile
///
/// # Returns
///
/// The object holding code, defined functions and the relocations still
/// needed from the system linker
pub fn compile_object(source: &str) -> Result<Object> {
    let unit = parser::parse(source)?;
    Object::from_translation_unit(&unit, Mode::ObjectFile)
}

/// Compile littlelang source for in-process execution, resolving calls
/// through `resolver`
pub fn compile_jit(source: &str, resolver: &dyn SymbolResolver) -> Result<Object> {
    let unit = parser::parse(source)?;
    Object::from_translation_unit(&unit, Mode::Jit(resolver))
}

/// Compile and run `entry` against the symbols of the running process
pub fn run_source(source: &str, entry: &str) -> Result<()> {
    let symbols = ProcessSymbols::new();
    let object = compile_jit(source, &symbols)?;
    jit::run(&object, entry)
}
