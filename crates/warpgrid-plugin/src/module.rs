//! ModuleHandle — a loaded, initialized plugin module.
//!
//! Wraps the module's single `wasmtime::Instance` and its `Store`. The store
//! lives behind a mutex, so calls into one module are serialized; separate
//! modules run independently.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wasmtime::{Extern, Instance, Module, Store, StoreLimits, TypedFunc, WasmParams, WasmResults};

use crate::error::{PluginError, PluginResult};

/// A gatherer declared by a module during initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Registry name.
    pub name: String,
    /// Export implementing `() -> f64`.
    pub export: String,
}

/// Per-module store data.
pub struct PluginState {
    /// Filled by the `register_gatherer` host import while `warpgrid_init` runs.
    pub(crate) registrations: Vec<Registration>,
    pub(crate) limits: StoreLimits,
}

impl PluginState {
    pub(crate) fn new(limits: StoreLimits) -> Self {
        Self {
            registrations: Vec::new(),
            limits,
        }
    }
}

/// What kind of item an export is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Func,
    Global,
    Memory,
    Table,
    Other,
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Func => "function",
            Self::Global => "global",
            Self::Memory => "memory",
            Self::Table => "table",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A loaded plugin module. Never unloaded.
pub struct ModuleHandle {
    path: PathBuf,
    module: Module,
    instance: Instance,
    store: Mutex<Store<PluginState>>,
    registrations: Vec<Registration>,
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("path", &self.path)
            .field("registrations", &self.registrations)
            .finish_non_exhaustive()
    }
}

impl ModuleHandle {
    pub(crate) fn new(
        path: PathBuf,
        module: Module,
        instance: Instance,
        store: Store<PluginState>,
        registrations: Vec<Registration>,
    ) -> Self {
        Self {
            path,
            module,
            instance,
            store: Mutex::new(store),
            registrations,
        }
    }

    /// The path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gatherers the module declared during initialization.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Names of everything the module exports.
    pub fn exports(&self) -> Vec<String> {
        self.module.exports().map(|e| e.name().to_string()).collect()
    }

    /// Resolve an exported symbol.
    ///
    /// # Errors
    /// Returns `PluginError::SymbolNotFound` if the module has no such export.
    pub fn lookup(self: &Arc<Self>, symbol: &str) -> PluginResult<Symbol> {
        let export = {
            let mut store = self.lock_store();
            self.instance.get_export(&mut *store, symbol)
        };

        let export = export.ok_or_else(|| PluginError::SymbolNotFound {
            path: self.path.clone(),
            symbol: symbol.to_string(),
        })?;

        Ok(Symbol {
            handle: Arc::clone(self),
            name: symbol.to_string(),
            export,
        })
    }

    fn lock_store(&self) -> MutexGuard<'_, Store<PluginState>> {
        // A trap never poisons; only a panic in our own code could.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An export resolved from a [`ModuleHandle`].
///
/// Its shape is unchecked until asserted with [`Symbol::func`].
#[derive(Clone)]
pub struct Symbol {
    handle: Arc<ModuleHandle>,
    name: String,
    export: Extern,
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("plugin", &self.handle.path)
            .finish()
    }
}

impl Symbol {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SymbolKind {
        match self.export {
            Extern::Func(_) => SymbolKind::Func,
            Extern::Global(_) => SymbolKind::Global,
            Extern::Memory(_) => SymbolKind::Memory,
            Extern::Table(_) => SymbolKind::Table,
            _ => SymbolKind::Other,
        }
    }

    /// Assert the symbol is a function with params `P` and results `R`.
    ///
    /// # Errors
    /// Returns `PluginError::SymbolType` if the symbol is not a function or
    /// its signature differs.
    pub fn func<P, R>(&self) -> PluginResult<ExportedFunc<P, R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let Extern::Func(func) = &self.export else {
            return Err(PluginError::SymbolType {
                symbol: self.name.clone(),
                reason: format!("expected a function, found a {}", self.kind()),
            });
        };

        let typed = {
            let store = self.handle.lock_store();
            func.typed::<P, R>(&*store)
        }
        .map_err(|e| PluginError::SymbolType {
            symbol: self.name.clone(),
            reason: e.to_string(),
        })?;

        Ok(ExportedFunc {
            handle: Arc::clone(&self.handle),
            name: self.name.clone(),
            func: typed,
        })
    }
}

/// A type-checked exported function, callable from any thread.
pub struct ExportedFunc<P, R> {
    handle: Arc<ModuleHandle>,
    name: String,
    func: TypedFunc<P, R>,
}

impl<P, R> Clone for ExportedFunc<P, R> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            name: self.name.clone(),
            func: self.func.clone(),
        }
    }
}

impl<P, R> std::fmt::Debug for ExportedFunc<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedFunc")
            .field("name", &self.name)
            .field("plugin", &self.handle.path)
            .finish()
    }
}

impl<P, R> ExportedFunc<P, R>
where
    P: WasmParams,
    R: WasmResults,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The module this function belongs to.
    pub fn plugin(&self) -> &Path {
        &self.handle.path
    }

    /// Call the function, holding the module's store for the duration.
    ///
    /// # Errors
    /// Returns `PluginError::Trap` if the guest traps.
    pub fn call(&self, params: P) -> PluginResult<R> {
        let mut store = self.handle.lock_store();
        self.func
            .call(&mut *store, params)
            .map_err(|e| PluginError::Trap {
                symbol: self.name.clone(),
                reason: e.to_string(),
            })
    }
}
