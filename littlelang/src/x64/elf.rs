//! ELF64 Relocatable Object Generation
//!
//! Writes an `ET_REL` object for x86-64 Linux that `cc`/`ld` can link
//! against the C runtime. Section layout:
//!
//! ```text
//! [0] null  [1] .text  [2] .rela.text  [3] .rodata
//! [4] .symtab  [5] .strtab  [6] .shstrtab  [7] .note.GNU-stack
//! ```
//!
//! The empty `.note.GNU-stack` marks the object as not needing an
//! executable stack.

use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

use crate::Result;

use super::linker::Object;
use super::object::{align_to, collect_strings, extern_names, pad_to, write_atomically, StringTable};

/// ELF64 constants
pub mod consts {
    // ELF magic number
    pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    // ELF class
    pub const ELFCLASS64: u8 = 2;

    // Data encoding
    pub const ELFDATA2LSB: u8 = 1; // Little endian

    // ELF version
    pub const EV_CURRENT: u8 = 1;

    // OS/ABI
    pub const ELFOSABI_NONE: u8 = 0; // UNIX System V ABI

    // Object file type
    pub const ET_REL: u16 = 1; // Relocatable file

    // Machine type
    pub const EM_X86_64: u16 = 62;

    // Section types
    pub const SHT_NULL: u32 = 0;
    pub const SHT_PROGBITS: u32 = 1;
    pub const SHT_SYMTAB: u32 = 2;
    pub const SHT_STRTAB: u32 = 3;
    pub const SHT_RELA: u32 = 4;

    // Section flags
    pub const SHF_ALLOC: u64 = 0x2;
    pub const SHF_EXECINSTR: u64 = 0x4;
    pub const SHF_INFO_LINK: u64 = 0x40;

    // Special section indices
    pub const SHN_UNDEF: u16 = 0;
    pub const SHN_ABS: u16 = 0xFFF1;

    // Symbol binding
    pub const STB_LOCAL: u8 = 0;
    pub const STB_GLOBAL: u8 = 1;

    // Symbol types
    pub const STT_NOTYPE: u8 = 0;
    pub const STT_FUNC: u8 = 2;
    pub const STT_SECTION: u8 = 3;
    pub const STT_FILE: u8 = 4;

    // x86-64 relocation types
    pub const R_X86_64_PC32: u32 = 2;
    pub const R_X86_64_PLT32: u32 = 4;

    // Entry sizes
    pub const ELF64_EHDR_SIZE: u16 = 64;
    pub const ELF64_SHDR_SIZE: u16 = 64;
    pub const ELF64_SYM_SIZE: u64 = 24;
    pub const ELF64_RELA_SIZE: u64 = 24;

    // Section indices in the emitted object
    pub const TEXT_INDEX: u16 = 1;
    pub const RELA_TEXT_INDEX: u16 = 2;
    pub const RODATA_INDEX: u16 = 3;
    pub const SYMTAB_INDEX: u16 = 4;
    pub const STRTAB_INDEX: u16 = 5;
    pub const SHSTRTAB_INDEX: u16 = 6;
    pub const GNU_STACK_INDEX: u16 = 7;
    pub const SECTION_COUNT: u16 = 8;

    /// rel32 fields are relative to the end of the field
    pub const PCREL_ADDEND: i64 = -4;
}

/// ELF64 file header
#[derive(Debug, Clone)]
pub struct Elf64Header {
    pub e_type: u16,      // Object file type
    pub e_machine: u16,   // Machine type
    pub e_version: u32,   // Object file version
    pub e_entry: u64,     // Entry point address
    pub e_phoff: u64,     // Program header offset
    pub e_shoff: u64,     // Section header offset
    pub e_flags: u32,     // Processor-specific flags
    pub e_ehsize: u16,    // ELF header size
    pub e_phentsize: u16, // Program header entry size
    pub e_phnum: u16,     // Number of program headers
    pub e_shentsize: u16, // Section header entry size
    pub e_shnum: u16,     // Number of section headers
    pub e_shstrndx: u16,  // Section name string table index
}

impl Default for Elf64Header {
    fn default() -> Self {
        Self {
            e_type: consts::ET_REL,
            e_machine: consts::EM_X86_64,
            e_version: consts::EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: 0, // Relocatable objects have no program headers
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: consts::ELF64_EHDR_SIZE,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: consts::ELF64_SHDR_SIZE,
            e_shnum: consts::SECTION_COUNT,
            e_shstrndx: consts::SHSTRTAB_INDEX,
        }
    }
}

impl Elf64Header {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // e_ident (16 bytes)
        w.write_all(&consts::ELF_MAGIC)?;
        w.write_all(&[consts::ELFCLASS64])?; // EI_CLASS
        w.write_all(&[consts::ELFDATA2LSB])?; // EI_DATA
        w.write_all(&[consts::EV_CURRENT])?; // EI_VERSION
        w.write_all(&[consts::ELFOSABI_NONE])?; // EI_OSABI
        w.write_all(&[0u8; 8])?; // EI_PAD

        w.write_all(&self.e_type.to_le_bytes())?;
        w.write_all(&self.e_machine.to_le_bytes())?;
        w.write_all(&self.e_version.to_le_bytes())?;
        w.write_all(&self.e_entry.to_le_bytes())?;
        w.write_all(&self.e_phoff.to_le_bytes())?;
        w.write_all(&self.e_shoff.to_le_bytes())?;
        w.write_all(&self.e_flags.to_le_bytes())?;
        w.write_all(&self.e_ehsize.to_le_bytes())?;
        w.write_all(&self.e_phentsize.to_le_bytes())?;
        w.write_all(&self.e_phnum.to_le_bytes())?;
        w.write_all(&self.e_shentsize.to_le_bytes())?;
        w.write_all(&self.e_shnum.to_le_bytes())?;
        w.write_all(&self.e_shstrndx.to_le_bytes())?;

        Ok(())
    }
}

/// ELF64 section header
#[derive(Debug, Clone, Default)]
pub struct Elf64SectionHeader {
    pub sh_name: u32,      // Offset into .shstrtab
    pub sh_type: u32,      // Section type
    pub sh_flags: u64,     // Section flags
    pub sh_addr: u64,      // Address when loaded
    pub sh_offset: u64,    // File offset
    pub sh_size: u64,      // Size in bytes
    pub sh_link: u32,      // Associated section
    pub sh_info: u32,      // Extra information
    pub sh_addralign: u64, // Alignment
    pub sh_entsize: u64,   // Size of each entry, for tables
}

impl Elf64SectionHeader {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.sh_name.to_le_bytes())?;
        w.write_all(&self.sh_type.to_le_bytes())?;
        w.write_all(&self.sh_flags.to_le_bytes())?;
        w.write_all(&self.sh_addr.to_le_bytes())?;
        w.write_all(&self.sh_offset.to_le_bytes())?;
        w.write_all(&self.sh_size.to_le_bytes())?;
        w.write_all(&self.sh_link.to_le_bytes())?;
        w.write_all(&self.sh_info.to_le_bytes())?;
        w.write_all(&self.sh_addralign.to_le_bytes())?;
        w.write_all(&self.sh_entsize.to_le_bytes())?;
        Ok(())
    }
}

/// ELF64 symbol table entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Elf64Symbol {
    pub st_name: u32,  // Offset into .strtab
    pub st_info: u8,   // Binding and type
    pub st_other: u8,  // Visibility
    pub st_shndx: u16, // Defining section
    pub st_value: u64, // Offset within the section
    pub st_size: u64,  // Size of the object
}

impl Elf64Symbol {
    pub fn info(binding: u8, kind: u8) -> u8 {
        (binding << 4) | (kind & 0xF)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.st_name.to_le_bytes())?;
        w.write_all(&[self.st_info])?;
        w.write_all(&[self.st_other])?;
        w.write_all(&self.st_shndx.to_le_bytes())?;
        w.write_all(&self.st_value.to_le_bytes())?;
        w.write_all(&self.st_size.to_le_bytes())?;
        Ok(())
    }
}

/// ELF64 relocation with explicit addend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf64Rela {
    pub r_offset: u64, // Location to patch
    pub r_info: u64,   // Symbol index and relocation type
    pub r_addend: i64, // Constant addend
}

impl Elf64Rela {
    pub fn new(offset: u64, symbol: u32, kind: u32, addend: i64) -> Self {
        Self {
            r_offset: offset,
            r_info: ((symbol as u64) << 32) | kind as u64,
            r_addend: addend,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.r_offset.to_le_bytes())?;
        w.write_all(&self.r_info.to_le_bytes())?;
        w.write_all(&self.r_addend.to_le_bytes())?;
        Ok(())
    }
}

/// ELF64 relocatable object builder
#[derive(Debug)]
pub struct ElfObjectBuilder<'a> {
    object: &'a Object,
    file_name: String,
}

impl<'a> ElfObjectBuilder<'a> {
    pub fn new(object: &'a Object) -> Self {
        Self {
            object,
            file_name: "out.o".to_string(),
        }
    }

    /// Set the name recorded in the `STT_FILE` symbol (default: out.o)
    pub fn file_name(mut self, name: &str) -> Self {
        self.file_name = name.to_string();
        self
    }

    /// Build the complete object file
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Write to a file, replacing it only once the object is complete
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        write_atomically(path, &self.build()?)
    }

    /// Serialize the object into `w`
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let buffer = &self.object.buffer;
        let (strings, string_fixups) = collect_strings(buffer)?;
        let code = buffer.code();
        let rodata = strings.as_bytes();

        // ---- symbols ----
        let mut strtab = StringTable::new();
        let mut symbols = vec![Elf64Symbol::default()];
        symbols.push(Elf64Symbol {
            st_name: strtab.add(&self.file_name),
            st_info: Elf64Symbol::info(consts::STB_LOCAL, consts::STT_FILE),
            st_shndx: consts::SHN_ABS,
            ..Default::default()
        });
        symbols.push(Elf64Symbol {
            st_info: Elf64Symbol::info(consts::STB_LOCAL, consts::STT_SECTION),
            st_shndx: consts::TEXT_INDEX,
            ..Default::default()
        });
        let rodata_symbol = if rodata.is_empty() {
            None
        } else {
            symbols.push(Elf64Symbol {
                st_info: Elf64Symbol::info(consts::STB_LOCAL, consts::STT_SECTION),
                st_shndx: consts::RODATA_INDEX,
                ..Default::default()
            });
            Some(symbols.len() as u32 - 1)
        };
        let first_global = symbols.len() as u32;

        for (i, function) in self.object.symbols.iter().enumerate() {
            // A function extends to the next one that starts after it
            let end = self.object.symbols[i + 1..]
                .iter()
                .map(|next| next.offset)
                .filter(|&offset| offset > function.offset)
                .min()
                .unwrap_or(code.len());
            symbols.push(Elf64Symbol {
                st_name: strtab.add(&function.name),
                st_info: Elf64Symbol::info(consts::STB_GLOBAL, consts::STT_FUNC),
                st_shndx: consts::TEXT_INDEX,
                st_value: function.offset as u64,
                st_size: (end - function.offset) as u64,
                ..Default::default()
            });
        }

        let externs = extern_names(buffer);
        let first_extern = symbols.len() as u32;
        for name in &externs {
            symbols.push(Elf64Symbol {
                st_name: strtab.add(name),
                st_info: Elf64Symbol::info(consts::STB_GLOBAL, consts::STT_NOTYPE),
                st_shndx: consts::SHN_UNDEF,
                ..Default::default()
            });
        }

        // ---- relocations ----
        let mut relocations = Vec::new();
        if let Some(rodata_symbol) = rodata_symbol {
            for fixup in &string_fixups {
                relocations.push(Elf64Rela::new(
                    fixup.location as u64,
                    rodata_symbol,
                    consts::R_X86_64_PC32,
                    fixup.offset as i64 + consts::PCREL_ADDEND,
                ));
            }
        }
        for call in buffer.extern_calls() {
            let index = externs
                .iter()
                .position(|name| *name == call.symbol)
                .map(|i| first_extern + i as u32)
                .unwrap_or(0);
            relocations.push(Elf64Rela::new(
                call.location as u64,
                index,
                consts::R_X86_64_PLT32,
                consts::PCREL_ADDEND,
            ));
        }
        relocations.sort_by_key(|rela| rela.r_offset);

        // ---- section names ----
        let mut shstrtab = StringTable::new();
        let text_name = shstrtab.add(".text");
        let rela_name = shstrtab.add(".rela.text");
        let rodata_name = shstrtab.add(".rodata");
        let symtab_name = shstrtab.add(".symtab");
        let strtab_name = shstrtab.add(".strtab");
        let shstrtab_name = shstrtab.add(".shstrtab");
        let gnu_stack_name = shstrtab.add(".note.GNU-stack");

        // ---- layout ----
        let text_off = consts::ELF64_EHDR_SIZE as u64;
        let rela_off = align_to(text_off + code.len() as u64, 8);
        let rela_size = relocations.len() as u64 * consts::ELF64_RELA_SIZE;
        let rodata_off = rela_off + rela_size;
        let symtab_off = align_to(rodata_off + rodata.len() as u64, 8);
        let symtab_size = symbols.len() as u64 * consts::ELF64_SYM_SIZE;
        let strtab_off = symtab_off + symtab_size;
        let shstrtab_off = strtab_off + strtab.len() as u64;
        let sh_off = align_to(shstrtab_off + shstrtab.len() as u64, 8);

        let sections = [
            Elf64SectionHeader {
                sh_type: consts::SHT_NULL,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: text_name,
                sh_type: consts::SHT_PROGBITS,
                sh_flags: consts::SHF_ALLOC | consts::SHF_EXECINSTR,
                sh_offset: text_off,
                sh_size: code.len() as u64,
                sh_addralign: 16,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: rela_name,
                sh_type: consts::SHT_RELA,
                sh_flags: consts::SHF_INFO_LINK,
                sh_offset: rela_off,
                sh_size: rela_size,
                sh_link: consts::SYMTAB_INDEX as u32,
                sh_info: consts::TEXT_INDEX as u32,
                sh_addralign: 8,
                sh_entsize: consts::ELF64_RELA_SIZE,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: rodata_name,
                sh_type: consts::SHT_PROGBITS,
                sh_flags: consts::SHF_ALLOC,
                sh_offset: rodata_off,
                sh_size: rodata.len() as u64,
                sh_addralign: 1,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: symtab_name,
                sh_type: consts::SHT_SYMTAB,
                sh_offset: symtab_off,
                sh_size: symtab_size,
                sh_link: consts::STRTAB_INDEX as u32,
                // One greater than the last local symbol
                sh_info: first_global,
                sh_addralign: 8,
                sh_entsize: consts::ELF64_SYM_SIZE,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: strtab_name,
                sh_type: consts::SHT_STRTAB,
                sh_offset: strtab_off,
                sh_size: strtab.len() as u64,
                sh_addralign: 1,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: shstrtab_name,
                sh_type: consts::SHT_STRTAB,
                sh_offset: shstrtab_off,
                sh_size: shstrtab.len() as u64,
                sh_addralign: 1,
                ..Default::default()
            },
            Elf64SectionHeader {
                sh_name: gnu_stack_name,
                sh_type: consts::SHT_PROGBITS,
                sh_offset: sh_off,
                sh_addralign: 1,
                ..Default::default()
            },
        ];

        let ehdr = Elf64Header {
            e_shoff: sh_off,
            ..Default::default()
        };

        // ---- write ----
        let mut out = Vec::with_capacity(sh_off as usize + sections.len() * 64);
        ehdr.write(&mut out)?;
        out.extend_from_slice(code);
        pad_to(&mut out, rela_off);
        for rela in &relocations {
            rela.write(&mut out)?;
        }
        out.extend_from_slice(rodata);
        pad_to(&mut out, symtab_off);
        for symbol in &symbols {
            symbol.write(&mut out)?;
        }
        out.extend_from_slice(strtab.as_bytes());
        out.extend_from_slice(shstrtab.as_bytes());
        pad_to(&mut out, sh_off);
        for section in &sections {
            section.write(&mut out)?;
        }

        debug!(
            code = code.len(),
            symbols = symbols.len(),
            relocations = relocations.len(),
            size = out.len(),
            "built ELF object"
        );
        w.write_all(&out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, Param, Statement};
    use crate::x64::codegen::Mode;
    use crate::x64::symbols::NoSymbols;
    use crate::Error;
    use pretty_assertions::assert_eq;

    fn u16_at(data: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(data[at..at + 2].try_into().unwrap())
    }

    fn u32_at(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    }

    fn u64_at(data: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
    }

    /// (offset, size, info) of section `index`
    fn section(data: &[u8], index: usize) -> (usize, usize, u32) {
        let base = u64_at(data, 0x28) as usize + index * 64;
        (
            u64_at(data, base + 24) as usize,
            u64_at(data, base + 32) as usize,
            u32_at(data, base + 44),
        )
    }

    fn symbols(data: &[u8]) -> Vec<(String, u8, u16, u64, u64)> {
        let (offset, size, _) = section(data, consts::SYMTAB_INDEX as usize);
        let (strtab, _, _) = section(data, consts::STRTAB_INDEX as usize);
        (0..size / 24)
            .map(|i| {
                let at = offset + i * 24;
                let name_at = strtab + u32_at(data, at) as usize;
                let end = data[name_at..].iter().position(|&b| b == 0).unwrap();
                (
                    String::from_utf8(data[name_at..name_at + end].to_vec()).unwrap(),
                    data[at + 4],
                    u16_at(data, at + 6),
                    u64_at(data, at + 8),
                    u64_at(data, at + 16),
                )
            })
            .collect()
    }

    fn relocations(data: &[u8]) -> Vec<(u64, u32, u32, i64)> {
        let (offset, size, _) = section(data, consts::RELA_TEXT_INDEX as usize);
        (0..size / 24)
            .map(|i| {
                let at = offset + i * 24;
                let info = u64_at(data, at + 8);
                (
                    u64_at(data, at),
                    (info >> 32) as u32,
                    info as u32,
                    u64_at(data, at + 16) as i64,
                )
            })
            .collect()
    }

    #[test]
    fn test_elf_header() {
        let object = Object::from_function("main", &Block::new(), Mode::ObjectFile).unwrap();
        let data = ElfObjectBuilder::new(&object).build().unwrap();

        assert_eq!(&data[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(data[4], 2); // 64-bit
        assert_eq!(data[5], 1); // little endian
        assert_eq!(u16_at(&data, 16), consts::ET_REL);
        assert_eq!(u16_at(&data, 18), consts::EM_X86_64);
        assert_eq!(u16_at(&data, 60), 8); // e_shnum
        assert_eq!(u16_at(&data, 62), 6); // e_shstrndx
        assert_eq!(u64_at(&data, 0x28) % 8, 0);

        // .text holds the code right after the header
        let (text_off, text_size, _) = section(&data, 1);
        assert_eq!(text_off, 64);
        assert_eq!(&data[text_off..text_off + text_size], object.code());
    }

    #[test]
    fn test_non_executable_stack_note() {
        let object = Object::from_function("main", &Block::new(), Mode::ObjectFile).unwrap();
        let data = ElfObjectBuilder::new(&object).build().unwrap();

        let index = consts::GNU_STACK_INDEX as usize;
        let base = u64_at(&data, 0x28) as usize + index * 64;
        let (shstrtab, _, _) = section(&data, consts::SHSTRTAB_INDEX as usize);
        let name_at = shstrtab + u32_at(&data, base) as usize;
        assert_eq!(&data[name_at..name_at + 16], b".note.GNU-stack\0");
        assert_eq!(u32_at(&data, base + 4), consts::SHT_PROGBITS);
        assert_eq!(u64_at(&data, base + 8), 0); // no SHF_EXECINSTR
        assert_eq!(section(&data, index).1, 0);
    }

    #[test]
    fn test_single_extern_call() {
        let block = Block::new().with(Statement::call("exit", vec![Param::Int64(0)]));
        let object = Object::from_function("main", &block, Mode::ObjectFile).unwrap();
        let data = ElfObjectBuilder::new(&object).build().unwrap();

        let syms = symbols(&data);
        assert_eq!(syms.len(), 5);
        assert_eq!(syms[0], (String::new(), 0, 0, 0, 0));
        assert_eq!(syms[1].0, "out.o");
        assert_eq!(syms[1].1, Elf64Symbol::info(consts::STB_LOCAL, consts::STT_FILE));
        assert_eq!(syms[1].2, consts::SHN_ABS);
        assert_eq!(syms[2].1, Elf64Symbol::info(consts::STB_LOCAL, consts::STT_SECTION));
        assert_eq!(syms[2].2, consts::TEXT_INDEX);
        assert_eq!(
            syms[3],
            (
                "main".to_string(),
                Elf64Symbol::info(consts::STB_GLOBAL, consts::STT_FUNC),
                consts::TEXT_INDEX,
                0,
                object.code().len() as u64
            )
        );
        assert_eq!(syms[4].0, "exit");
        assert_eq!(syms[4].2, consts::SHN_UNDEF);

        // locals end before main
        let (_, _, info) = section(&data, consts::SYMTAB_INDEX as usize);
        assert_eq!(info, 3);

        let call_site = object.buffer.extern_calls()[0].location as u64;
        assert_eq!(
            relocations(&data),
            vec![(call_site, 4, consts::R_X86_64_PLT32, -4)]
        );
    }

    #[test]
    fn test_strings_relocate_against_rodata() {
        let block = Block::new()
            .with(Statement::call("puts", vec![Param::str("test")]))
            .with(Statement::call("puts", vec![Param::str("another")]))
            .with(Statement::call("puts", vec![Param::str("test")]));
        let object = Object::from_function("main", &block, Mode::ObjectFile).unwrap();
        let data = ElfObjectBuilder::new(&object).file_name("hello.o").build().unwrap();

        let (rodata_off, rodata_size, _) = section(&data, consts::RODATA_INDEX as usize);
        assert_eq!(&data[rodata_off..rodata_off + rodata_size], b"test\0another\0");

        let syms = symbols(&data);
        // null, file, .text, .rodata, main, puts
        assert_eq!(syms.len(), 6);
        assert_eq!(syms[1].0, "hello.o");
        assert_eq!(syms[3].2, consts::RODATA_INDEX);
        assert_eq!(syms[5].0, "puts");

        let relas = relocations(&data);
        assert_eq!(relas.len(), 6);
        assert!(relas.windows(2).all(|pair| pair[0].0 < pair[1].0));

        let strings: Vec<_> = relas
            .iter()
            .filter(|rela| rela.2 == consts::R_X86_64_PC32)
            .map(|rela| (rela.1, rela.3))
            .collect();
        assert_eq!(strings, vec![(3, -4), (3, 1), (3, -4)]);
        assert!(relas
            .iter()
            .filter(|rela| rela.2 == consts::R_X86_64_PLT32)
            .all(|rela| rela.1 == 5 && rela.3 == -4));
    }

    #[test]
    fn test_function_sizes() {
        use crate::ast::{FunctionDefinition, TranslationUnit};

        let unit = TranslationUnit {
            functions: vec![
                FunctionDefinition {
                    name: "helper".to_string(),
                    block: Block::new(),
                },
                FunctionDefinition {
                    name: "main".to_string(),
                    block: Block::new().with(Statement::call("helper", vec![])),
                },
            ],
        };
        let object = Object::from_translation_unit(&unit, Mode::ObjectFile).unwrap();
        let data = ElfObjectBuilder::new(&object).build().unwrap();

        let syms = symbols(&data);
        assert_eq!(syms.len(), 5);
        assert_eq!((syms[3].0.as_str(), syms[3].3, syms[3].4), ("helper", 0, 7));
        assert_eq!(
            (syms[4].0.as_str(), syms[4].3, syms[4].4),
            ("main", 7, object.code().len() as u64 - 7)
        );
        assert!(relocations(&data).is_empty());
    }

    #[test]
    fn test_rejects_jit_buffer() {
        let block = Block::new().with(Statement::call("puts", vec![Param::str("hi")]));
        let object = Object::from_function("main", &block, Mode::Jit(&NoSymbols)).unwrap();
        assert!(matches!(
            ElfObjectBuilder::new(&object).build(),
            Err(Error::AbsoluteStringReference { .. })
        ));
    }

    #[test]
    fn test_build_is_deterministic() {
        let block = Block::new().with(Statement::call("puts", vec![Param::str("x")]));
        let object = Object::from_function("main", &block, Mode::ObjectFile).unwrap();
        let builder = ElfObjectBuilder::new(&object);
        assert_eq!(builder.build().unwrap(), builder.build().unwrap());
    }
}
