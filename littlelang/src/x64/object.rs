//! Relocatable object output
//!
//! Shared pieces of the ELF and Mach-O writers, and the entry points that
//! pick a writer by [`ObjectFormat`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::{Error, Result};

use super::elf::ElfObjectBuilder;
use super::encoding::{InstrBuffer, StringAddressing};
use super::linker::Object;
use super::macho::MachObjectBuilder;

/// Relocatable object container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    Elf,
    MachO,
}

impl ObjectFormat {
    /// The native format of the host platform
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            ObjectFormat::MachO
        } else {
            ObjectFormat::Elf
        }
    }
}

/// Serialize `object` in the given format
pub fn emit(object: &Object, format: ObjectFormat) -> Result<Vec<u8>> {
    match format {
        ObjectFormat::Elf => ElfObjectBuilder::new(object).build(),
        ObjectFormat::MachO => MachObjectBuilder::new(object).build(),
    }
}

/// Serialize `object` and write it to `path`.
///
/// The bytes go to a sibling temporary file first, which is renamed over
/// `path` only once it is completely written.
pub fn write_object_file(object: &Object, format: ObjectFormat, path: &Path) -> Result<()> {
    match format {
        ObjectFormat::Elf => {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "out.o".to_string());
            ElfObjectBuilder::new(object)
                .file_name(&file_name)
                .write_to_file(path)
        }
        ObjectFormat::MachO => MachObjectBuilder::new(object).write_to_file(path),
    }
}

pub(crate) fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = Path::new(&temp);

    if let Err(err) = fs::write(temp, data) {
        let _ = fs::remove_file(temp);
        return Err(err.into());
    }
    fs::rename(temp, path)?;
    debug!(path = %path.display(), len = data.len(), "wrote object file");
    Ok(())
}

/// NUL-separated name table, starting with the empty name at offset 0
#[derive(Debug, Clone)]
pub(crate) struct StringTable {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringTable {
    pub(crate) fn new() -> Self {
        Self {
            bytes: vec![0],
            offsets: HashMap::new(),
        }
    }

    /// Offset of `name`, adding it on first use
    pub(crate) fn add(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), offset);
        offset
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Constant string bytes with one NUL-terminated copy per distinct text
#[derive(Debug, Default)]
pub(crate) struct StringPool {
    bytes: Vec<u8>,
    offsets: HashMap<String, u64>,
}

impl StringPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn intern(&mut self, text: &str) -> u64 {
        if let Some(&offset) = self.offsets.get(text) {
            return offset;
        }
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(text.to_string(), offset);
        offset
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A string reference that needs a relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StringFixup {
    /// Offset of the disp32 in the code
    pub location: usize,
    /// Offset of the string within the pool
    pub offset: u64,
}

/// Pool every constant string of a finished buffer.
///
/// Only RIP-relative references can be relocated; a buffer compiled for the
/// JIT holds host addresses and is rejected.
pub(crate) fn collect_strings(buffer: &InstrBuffer) -> Result<(StringPool, Vec<StringFixup>)> {
    buffer.ensure_resolved()?;
    let mut pool = StringPool::new();
    let mut fixups = Vec::with_capacity(buffer.const_strings().len());
    for string in buffer.const_strings() {
        if string.addressing != StringAddressing::RipRelative {
            return Err(Error::AbsoluteStringReference {
                text: string.text.clone(),
            });
        }
        fixups.push(StringFixup {
            location: string.location,
            offset: pool.intern(&string.text),
        });
    }
    Ok((pool, fixups))
}

/// Distinct extern call targets in order of first use
pub(crate) fn extern_names(buffer: &InstrBuffer) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    for call in buffer.extern_calls() {
        if !names.contains(&call.symbol.as_str()) {
            names.push(&call.symbol);
        }
    }
    names
}

/// Align value up to the next multiple of alignment
pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Zero-fill `buf` up to `offset`
pub(crate) fn pad_to(buf: &mut Vec<u8>, offset: u64) {
    let offset = offset as usize;
    if buf.len() < offset {
        buf.resize(offset, 0);
    }
}
