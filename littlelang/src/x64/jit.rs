//! In-process execution of compiled code
//!
//! Code is copied into a fresh read-write-execute mapping and called as an
//! `extern "C" fn()`. Mappings are never released; they live as long as the
//! process.

use tracing::debug;

use crate::{Error, Result};

use super::encoding::InstrBuffer;
use super::linker::Object;

impl InstrBuffer {
    /// Copy the code into executable memory and call the function starting at
    /// `entry`. An empty buffer is a no-op.
    pub fn execute(&self, entry: usize) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.ensure_resolved()?;
        if entry >= self.len() {
            return Err(Error::ExecutableMemory {
                message: format!("entry offset {} outside {} bytes of code", entry, self.len()),
            });
        }
        execute_code(self.code(), entry)
    }
}

/// Execute the function `entry` of a linked object.
///
/// Fails before running anything if a call target was neither found in the
/// process nor defined by the object.
pub fn run(object: &Object, entry: &str) -> Result<()> {
    if let Some(call) = object.buffer.extern_calls().first() {
        return Err(Error::UnresolvedSymbol {
            name: call.symbol.clone(),
        });
    }
    let symbol = object.symbol(entry).ok_or_else(|| Error::MissingEntryPoint {
        name: entry.to_string(),
    })?;
    object.buffer.execute(symbol.offset)
}

#[cfg(all(unix, target_arch = "x86_64"))]
fn execute_code(code: &[u8], entry: usize) -> Result<()> {
    let mapping = ExecMapping::new(code)?;
    debug!(len = mapping.len, entry, "executing mapped code");
    // Safety: the mapping holds complete functions produced by the compiler,
    // and `entry` is a function start within it.
    unsafe { mapping.call(entry) };
    Ok(())
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
fn execute_code(_code: &[u8], _entry: usize) -> Result<()> {
    Err(Error::UnsupportedHost)
}

/// Anonymous RWX memory holding a copy of compiled code
#[cfg(all(unix, target_arch = "x86_64"))]
struct ExecMapping {
    ptr: *mut u8,
    len: usize,
}

#[cfg(all(unix, target_arch = "x86_64"))]
impl ExecMapping {
    fn new(code: &[u8]) -> Result<Self> {
        #[cfg(target_os = "macos")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT;
        #[cfg(not(target_os = "macos"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        let len = code.len();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::ExecutableMemory {
                message: std::io::Error::last_os_error().to_string(),
            });
        }

        let ptr = ptr as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, len) };
        Ok(Self { ptr, len })
    }

    unsafe fn call(&self, entry: usize) {
        let function: extern "C" fn() = std::mem::transmute(self.ptr.add(entry));
        function();
    }
}
