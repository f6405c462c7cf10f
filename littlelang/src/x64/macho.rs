//! Mach-O 64-bit Relocatable Object Generation
//!
//! Writes an `MH_OBJECT` for x86-64 macOS. One unnamed segment carries
//! `__text` and `__cstring`; symbols are the `_`-prefixed function names
//! followed by the undefined call targets.

use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

use crate::{Error, Result};

use super::linker::Object;
use super::object::{align_to, collect_strings, extern_names, pad_to, write_atomically, StringTable};

/// Mach-O constants
pub mod consts {
    // Magic numbers
    pub const MH_MAGIC_64: u32 = 0xFEED_FACF; // 64-bit little-endian

    // CPU types
    pub const CPU_TYPE_X86_64: i32 = 0x0100_0007; // CPU_TYPE_X86 | CPU_ARCH_ABI64
    pub const CPU_SUBTYPE_X86_64_ALL: i32 = 3;

    // File types
    pub const MH_OBJECT: u32 = 1; // Relocatable object

    // Flags
    pub const MH_SUBSECTIONS_VIA_SYMBOLS: u32 = 0x2000;

    // Load command types
    pub const LC_SEGMENT_64: u32 = 0x19;
    pub const LC_SYMTAB: u32 = 0x02;
    pub const LC_DYSYMTAB: u32 = 0x0B;
    pub const LC_BUILD_VERSION: u32 = 0x32;

    // Segment protection
    pub const VM_PROT_READ: i32 = 0x01;
    pub const VM_PROT_WRITE: i32 = 0x02;
    pub const VM_PROT_EXECUTE: i32 = 0x04;

    // Section flags
    pub const S_CSTRING_LITERALS: u32 = 0x02;
    pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
    pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

    // Build version
    pub const PLATFORM_MACOS: u32 = 1;
    pub const MIN_OS_VERSION: u32 = 0x000E_0000; // 14.0
    pub const SDK_VERSION: u32 = 0x000E_0400; // 14.4

    // Symbol types
    pub const N_UNDF: u8 = 0x00;
    pub const N_EXT: u8 = 0x01;
    pub const N_SECT: u8 = 0x0E;
    pub const NO_SECT: u8 = 0;

    // x86-64 relocation types
    pub const X86_64_RELOC_SIGNED: u32 = 1;
    pub const X86_64_RELOC_BRANCH: u32 = 2;

    // Section ordinals (1-based)
    pub const TEXT_SECTION: u8 = 1;
    pub const CSTRING_SECTION: u8 = 2;

    // Header sizes
    pub const MACH_HEADER_64_SIZE: u32 = 32;
    pub const SEGMENT_COMMAND_64_SIZE: u32 = 72;
    pub const SECTION_64_SIZE: u32 = 80;
    pub const BUILD_VERSION_COMMAND_SIZE: u32 = 24;
    pub const SYMTAB_COMMAND_SIZE: u32 = 24;
    pub const DYSYMTAB_COMMAND_SIZE: u32 = 80;
    pub const NLIST_64_SIZE: u64 = 16;
    pub const RELOCATION_INFO_SIZE: u64 = 8;
}

/// Mach-O 64-bit header
#[derive(Debug, Clone)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: consts::MH_MAGIC_64,
            cputype: consts::CPU_TYPE_X86_64,
            cpusubtype: consts::CPU_SUBTYPE_X86_64_ALL,
            filetype: consts::MH_OBJECT,
            ncmds: 0,
            sizeofcmds: 0,
            flags: consts::MH_SUBSECTIONS_VIA_SYMBOLS,
            reserved: 0,
        }
    }
}

impl MachHeader64 {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.magic.to_le_bytes())?;
        w.write_all(&self.cputype.to_le_bytes())?;
        w.write_all(&self.cpusubtype.to_le_bytes())?;
        w.write_all(&self.filetype.to_le_bytes())?;
        w.write_all(&self.ncmds.to_le_bytes())?;
        w.write_all(&self.sizeofcmds.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.reserved.to_le_bytes())?;
        Ok(())
    }
}

/// Fixed 16-byte name field
fn name16(name: &str) -> [u8; 16] {
    let mut field = [0u8; 16];
    let len = name.len().min(16);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    field
}

/// LC_SEGMENT_64 load command
#[derive(Debug, Clone)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: i32,
    pub initprot: i32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand64 {
    /// The single unnamed segment of an object file
    pub fn new_object_segment(nsects: u32) -> Self {
        let all = consts::VM_PROT_READ | consts::VM_PROT_WRITE | consts::VM_PROT_EXECUTE;
        Self {
            cmd: consts::LC_SEGMENT_64,
            cmdsize: consts::SEGMENT_COMMAND_64_SIZE + nsects * consts::SECTION_64_SIZE,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: all,
            initprot: all,
            nsects,
            flags: 0,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.cmd.to_le_bytes())?;
        w.write_all(&self.cmdsize.to_le_bytes())?;
        w.write_all(&self.segname)?;
        w.write_all(&self.vmaddr.to_le_bytes())?;
        w.write_all(&self.vmsize.to_le_bytes())?;
        w.write_all(&self.fileoff.to_le_bytes())?;
        w.write_all(&self.filesize.to_le_bytes())?;
        w.write_all(&self.maxprot.to_le_bytes())?;
        w.write_all(&self.initprot.to_le_bytes())?;
        w.write_all(&self.nsects.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        Ok(())
    }
}

/// Section 64-bit structure
#[derive(Debug, Clone)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

impl Section64 {
    fn new(sectname: &str, align: u32, flags: u32) -> Self {
        Self {
            sectname: name16(sectname),
            segname: name16("__TEXT"),
            addr: 0,
            size: 0,
            offset: 0,
            align,
            reloff: 0,
            nreloc: 0,
            flags,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
    }

    pub fn new_text_section() -> Self {
        Self::new(
            "__text",
            4, // 2^4 = 16-byte alignment
            consts::S_ATTR_PURE_INSTRUCTIONS | consts::S_ATTR_SOME_INSTRUCTIONS,
        )
    }

    pub fn new_cstring_section() -> Self {
        Self::new("__cstring", 0, consts::S_CSTRING_LITERALS)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.sectname)?;
        w.write_all(&self.segname)?;
        w.write_all(&self.addr.to_le_bytes())?;
        w.write_all(&self.size.to_le_bytes())?;
        w.write_all(&self.offset.to_le_bytes())?;
        w.write_all(&self.align.to_le_bytes())?;
        w.write_all(&self.reloff.to_le_bytes())?;
        w.write_all(&self.nreloc.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.reserved1.to_le_bytes())?;
        w.write_all(&self.reserved2.to_le_bytes())?;
        w.write_all(&self.reserved3.to_le_bytes())?;
        Ok(())
    }
}

/// LC_BUILD_VERSION with no tool entries
#[derive(Debug, Clone)]
pub struct BuildVersionCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub platform: u32,
    pub minos: u32, // X.Y.Z encoded in nibbles xxxx.yy.zz
    pub sdk: u32,
    pub ntools: u32,
}

impl Default for BuildVersionCommand {
    fn default() -> Self {
        Self {
            cmd: consts::LC_BUILD_VERSION,
            cmdsize: consts::BUILD_VERSION_COMMAND_SIZE,
            platform: consts::PLATFORM_MACOS,
            minos: consts::MIN_OS_VERSION,
            sdk: consts::SDK_VERSION,
            ntools: 0,
        }
    }
}

impl BuildVersionCommand {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.cmd.to_le_bytes())?;
        w.write_all(&self.cmdsize.to_le_bytes())?;
        w.write_all(&self.platform.to_le_bytes())?;
        w.write_all(&self.minos.to_le_bytes())?;
        w.write_all(&self.sdk.to_le_bytes())?;
        w.write_all(&self.ntools.to_le_bytes())?;
        Ok(())
    }
}

/// LC_SYMTAB load command
#[derive(Debug, Clone)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

impl SymtabCommand {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.cmd.to_le_bytes())?;
        w.write_all(&self.cmdsize.to_le_bytes())?;
        w.write_all(&self.symoff.to_le_bytes())?;
        w.write_all(&self.nsyms.to_le_bytes())?;
        w.write_all(&self.stroff.to_le_bytes())?;
        w.write_all(&self.strsize.to_le_bytes())?;
        Ok(())
    }
}

/// LC_DYSYMTAB load command. Only the symbol partition is used; the
/// table-of-contents, module and indirect tables are empty in an object.
#[derive(Debug, Clone, Default)]
pub struct DysymtabCommand {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
}

impl DysymtabCommand {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&consts::LC_DYSYMTAB.to_le_bytes())?;
        w.write_all(&consts::DYSYMTAB_COMMAND_SIZE.to_le_bytes())?;
        w.write_all(&self.ilocalsym.to_le_bytes())?;
        w.write_all(&self.nlocalsym.to_le_bytes())?;
        w.write_all(&self.iextdefsym.to_le_bytes())?;
        w.write_all(&self.nextdefsym.to_le_bytes())?;
        w.write_all(&self.iundefsym.to_le_bytes())?;
        w.write_all(&self.nundefsym.to_le_bytes())?;
        // tocoff .. nlocrel
        w.write_all(&[0u8; 12 * 4])?;
        Ok(())
    }
}

/// 64-bit symbol table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlist64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist64 {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.n_strx.to_le_bytes())?;
        w.write_all(&[self.n_type, self.n_sect])?;
        w.write_all(&self.n_desc.to_le_bytes())?;
        w.write_all(&self.n_value.to_le_bytes())?;
        Ok(())
    }
}

/// Packed `relocation_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationInfo {
    pub address: i32,
    /// symbolnum:24 pcrel:1 length:2 extern:1 type:4
    pub info: u32,
}

impl RelocationInfo {
    pub fn new(address: i32, symbolnum: u32, pcrel: bool, length: u32, is_extern: bool, kind: u32) -> Self {
        Self {
            address,
            info: (symbolnum & 0x00FF_FFFF)
                | (pcrel as u32) << 24
                | (length & 0x3) << 25
                | (is_extern as u32) << 27
                | (kind & 0xF) << 28,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.address.to_le_bytes())?;
        w.write_all(&self.info.to_le_bytes())?;
        Ok(())
    }
}

/// Mach-O 64-bit relocatable object builder
#[derive(Debug)]
pub struct MachObjectBuilder<'a> {
    object: &'a Object,
}

impl<'a> MachObjectBuilder<'a> {
    pub fn new(object: &'a Object) -> Self {
        Self { object }
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
        let cstrings = strings.as_bytes();
        let mut code = buffer.code().to_vec();
        let code_len = code.len() as u64;

        // ---- symbols ----
        let mut strtab = StringTable::new();
        let mut symbols = Vec::new();
        for function in &self.object.symbols {
            symbols.push(Nlist64 {
                n_strx: strtab.add(&format!("_{}", function.name)),
                n_type: consts::N_SECT | consts::N_EXT,
                n_sect: consts::TEXT_SECTION,
                n_desc: 0,
                n_value: function.offset as u64,
            });
        }
        let defined = symbols.len() as u32;

        let externs = extern_names(buffer);
        for name in &externs {
            symbols.push(Nlist64 {
                n_strx: strtab.add(&format!("_{}", name)),
                n_type: consts::N_UNDF | consts::N_EXT,
                n_sect: consts::NO_SECT,
                n_desc: 0,
                n_value: 0,
            });
        }

        // ---- relocations ----
        // Section-relative string references carry the target address in
        // the instruction itself
        let mut relocations = Vec::new();
        for fixup in &string_fixups {
            let target = code_len + fixup.offset;
            let disp = target as i64 - (fixup.location as i64 + 4);
            let disp = i32::try_from(disp).map_err(|_| Error::DisplacementOutOfRange)?;
            code[fixup.location..fixup.location + 4].copy_from_slice(&disp.to_le_bytes());
            relocations.push(RelocationInfo::new(
                fixup.location as i32,
                consts::CSTRING_SECTION as u32,
                true,
                2,
                false,
                consts::X86_64_RELOC_SIGNED,
            ));
        }
        for call in buffer.extern_calls() {
            let index = externs
                .iter()
                .position(|name| *name == call.symbol)
                .map(|i| defined + i as u32)
                .unwrap_or(0);
            relocations.push(RelocationInfo::new(
                call.location as i32,
                index,
                true,
                2,
                true,
                consts::X86_64_RELOC_BRANCH,
            ));
        }
        // Each function is its own atom under MH_SUBSECTIONS_VIA_SYMBOLS, so
        // calls between them must be visible to ld64. The addend lives in the
        // instruction and is zero.
        for call in &self.object.local_calls {
            code[call.location..call.location + 4].copy_from_slice(&0i32.to_le_bytes());
            relocations.push(RelocationInfo::new(
                call.location as i32,
                call.target as u32,
                true,
                2,
                true,
                consts::X86_64_RELOC_BRANCH,
            ));
        }
        relocations.sort_by_key(|reloc| reloc.address);

        // ---- layout ----
        let nsects = 2;
        let sizeofcmds = consts::SEGMENT_COMMAND_64_SIZE
            + nsects * consts::SECTION_64_SIZE
            + consts::BUILD_VERSION_COMMAND_SIZE
            + consts::SYMTAB_COMMAND_SIZE
            + consts::DYSYMTAB_COMMAND_SIZE;
        let text_off = align_to((consts::MACH_HEADER_64_SIZE + sizeofcmds) as u64, 16);
        let cstring_off = text_off + code_len;
        let reloff = align_to(cstring_off + cstrings.len() as u64, 8);
        let symoff = reloff + relocations.len() as u64 * consts::RELOCATION_INFO_SIZE;
        let stroff = symoff + symbols.len() as u64 * consts::NLIST_64_SIZE;
        let strsize = align_to(strtab.len() as u64, 8);

        let header = MachHeader64 {
            ncmds: 4,
            sizeofcmds,
            ..Default::default()
        };

        let content_size = code_len + cstrings.len() as u64;
        let segment = SegmentCommand64 {
            vmsize: content_size,
            fileoff: text_off,
            filesize: content_size,
            ..SegmentCommand64::new_object_segment(nsects)
        };

        let text = Section64 {
            addr: 0,
            size: code_len,
            offset: text_off as u32,
            reloff: if relocations.is_empty() { 0 } else { reloff as u32 },
            nreloc: relocations.len() as u32,
            ..Section64::new_text_section()
        };

        let cstring = Section64 {
            addr: code_len,
            size: cstrings.len() as u64,
            offset: cstring_off as u32,
            ..Section64::new_cstring_section()
        };

        let symtab = SymtabCommand {
            cmd: consts::LC_SYMTAB,
            cmdsize: consts::SYMTAB_COMMAND_SIZE,
            symoff: symoff as u32,
            nsyms: symbols.len() as u32,
            stroff: stroff as u32,
            strsize: strsize as u32,
        };

        let dysymtab = DysymtabCommand {
            ilocalsym: 0,
            nlocalsym: 0,
            iextdefsym: 0,
            nextdefsym: defined,
            iundefsym: defined,
            nundefsym: externs.len() as u32,
        };

        // ---- write ----
        let mut out = Vec::with_capacity((stroff + strsize) as usize);
        header.write(&mut out)?;
        segment.write(&mut out)?;
        text.write(&mut out)?;
        cstring.write(&mut out)?;
        BuildVersionCommand::default().write(&mut out)?;
        symtab.write(&mut out)?;
        dysymtab.write(&mut out)?;

        pad_to(&mut out, text_off);
        out.extend_from_slice(&code);
        out.extend_from_slice(cstrings);
        pad_to(&mut out, reloff);
        for reloc in &relocations {
            reloc.write(&mut out)?;
        }
        for symbol in &symbols {
            symbol.write(&mut out)?;
        }
        out.extend_from_slice(strtab.as_bytes());
        pad_to(&mut out, stroff + strsize);

        debug!(
            code = code.len(),
            symbols = symbols.len(),
            relocations = relocations.len(),
            size = out.len(),
            "built Mach-O object"
        );
        w.write_all(&out)?;
        Ok(())
    }
}
