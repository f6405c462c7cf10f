//! Symbol lookup for JIT call targets
//!
//! The compiler only asks one question: "what is the address of this function
//! in the running process, if any?". Keeping it behind a trait lets tests swap
//! in a fixed table.

use std::collections::{HashMap, HashSet};

/// Resolve a symbol name to a callable address in the current process
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// Looks symbols up in the global symbol namespace of this process
#[derive(Debug)]
pub struct ProcessSymbols {
    #[cfg(unix)]
    library: libloading::os::unix::Library,
}

impl ProcessSymbols {
    pub fn new() -> Self {
        Self {
            #[cfg(unix)]
            library: libloading::os::unix::Library::this(),
        }
    }
}

impl Default for ProcessSymbols {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver for ProcessSymbols {
    #[cfg(unix)]
    fn resolve(&self, name: &str) -> Option<u64> {
        let address = unsafe {
            self.library
                .get::<*const std::ffi::c_void>(name.as_bytes())
                .map(|sym| *sym)
                .ok()?
        };
        (!address.is_null()).then_some(address as u64)
    }

    #[cfg(not(unix))]
    fn resolve(&self, _name: &str) -> Option<u64> {
        None
    }
}

/// Resolves nothing, so every call is left for the linker
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _name: &str) -> Option<u64> {
        None
    }
}

/// A fixed name-to-address table
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, address: u64) {
        self.symbols.insert(name.to_string(), address);
    }

    pub fn with(mut self, name: &str, address: u64) -> Self {
        self.insert(name, address);
        self
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

/// Hides names defined in the unit being linked, so a local function always
/// wins over a same-named host symbol
pub struct ExcludingLocal<'r> {
    inner: &'r dyn SymbolResolver,
    local: HashSet<String>,
}

impl<'r> ExcludingLocal<'r> {
    pub fn new<I, S>(inner: &'r dyn SymbolResolver, local: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner,
            local: local.into_iter().map(Into::into).collect(),
        }
    }
}

impl SymbolResolver for ExcludingLocal<'_> {
    fn resolve(&self, name: &str) -> Option<u64> {
        if self.local.contains(name) {
            None
        } else {
            self.inner.resolve(name)
        }
    }
}
