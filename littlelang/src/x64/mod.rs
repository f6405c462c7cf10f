//! x64 Native Code Generation Backend
//!
//! Turns a statement tree into x86-64 machine code that is either run in
//! process or written out as a relocatable object for the system linker.
//!
//! ## Architecture
//!
//! ```text
//! TranslationUnit → Compiler → InstrBuffer → linker::Object ─┬→ jit::run
//!                                                           ├→ ELF64 .o
//!                                                           └→ Mach-O .o
//! ```
//!
//! ## Modules
//!
//! - `registers`: x64 register definitions and encoding
//! - `encoding`: instruction encoding, jump patching, string/extern tables
//! - `scope`: stack frame layout and variable lookup across nested blocks
//! - `codegen`: statement tree to x64 translation
//! - `symbols`: call target lookup in the running process
//! - `linker`: multi-function units and local call patching
//! - `jit`: execution from an executable mapping
//! - `object`: format selection and shared object-writer helpers
//! - `elf`: ELF64 relocatable objects (Linux)
//! - `macho`: Mach-O 64 relocatable objects (macOS)

pub mod codegen;
pub mod elf;
pub mod encoding;
pub mod jit;
pub mod linker;
pub mod macho;
pub mod object;
pub mod registers;
pub mod scope;
pub mod symbols;

pub use codegen::{Compiler, Mode};
pub use elf::ElfObjectBuilder;
pub use encoding::InstrBuffer;
pub use linker::{LocalCall, Object, Symbol};
pub use macho::MachObjectBuilder;
pub use object::ObjectFormat;
pub use symbols::{ProcessSymbols, SymbolResolver};
