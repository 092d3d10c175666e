//! PluginLoader — loads Wasm extension modules and wires their gatherers
//! into a [`GathererRegistry`].
//!
//! A plugin is a core Wasm module that exports `memory` and, optionally,
//! `warpgrid_init: () -> ()`. While `warpgrid_init` runs, the module may call
//! the host import `warpgrid.register_gatherer(name_ptr, name_len,
//! export_ptr, export_len)` any number of times; each call names a gatherer
//! and the export (`() -> f64`) that implements it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};
use wasmtime::{Caller, Engine, Extern, Linker, Module, Store, StoreLimitsBuilder};

use warpgrid_gather::{GatherError, GathererRegistry};

use crate::error::{PluginError, PluginResult};
use crate::gatherer::wasm_gatherer_factory;
use crate::module::{ModuleHandle, PluginState, Registration};
use crate::{HOST_MODULE, INIT_EXPORT, MEMORY_EXPORT, REGISTER_GATHERER};

/// Default linear memory cap per plugin (64 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

const TABLE_ELEMENT_LIMIT: usize = 10_000;

/// Loads plugin modules and keeps them alive for the life of the process.
pub struct PluginLoader {
    engine: Engine,
    linker: Linker<PluginState>,
    registry: Arc<GathererRegistry>,
    /// Loaded modules keyed by the path they were loaded from.
    plugins: RwLock<HashMap<PathBuf, Arc<ModuleHandle>>>,
    memory_limit: usize,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("plugins", &self.loaded_paths())
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

impl PluginLoader {
    /// Create a loader that registers plugin gatherers into `registry`.
    pub fn new(registry: Arc<GathererRegistry>) -> PluginResult<Self> {
        let engine = Engine::default();
        let mut linker = Linker::new(&engine);
        linker
            .func_wrap(HOST_MODULE, REGISTER_GATHERER, register_gatherer)
            .map_err(|e| PluginError::Engine(e.to_string()))?;

        info!("plugin loader initialized");
        Ok(Self {
            engine,
            linker,
            registry,
            plugins: RwLock::new(HashMap::new()),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        })
    }

    /// Cap the linear memory of modules loaded from now on.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// The registry plugin gatherers are registered into.
    pub fn registry(&self) -> &Arc<GathererRegistry> {
        &self.registry
    }

    /// Load, instantiate and initialize the module at `path`, then register
    /// the gatherers it declared.
    ///
    /// Loading a path that is already loaded is not an error: the table
    /// entry is replaced with the new handle. Names the earlier module from
    /// the same path registered are left bound to the earlier module; only
    /// names it did not declare are registered for the new one.
    ///
    /// The module is added to the table only once all its gatherers are
    /// registered.
    ///
    /// # Errors
    /// - `PluginError::Load` if the file is missing, is not a valid module,
    ///   misses a required import/export, traps during `warpgrid_init`, or
    ///   declares a gatherer whose export is not `() -> f64`.
    /// - `PluginError::Register` if a declared name is already registered
    ///   by a builtin or another module.
    pub fn load(&self, path: impl AsRef<Path>) -> PluginResult<Arc<ModuleHandle>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| PluginError::load(path, e))?;
        let module =
            Module::new(&self.engine, &bytes).map_err(|e| PluginError::load(path, e))?;
        debug!(path = %path.display(), "compiled plugin module");

        if module.get_export(MEMORY_EXPORT).is_none() {
            return Err(PluginError::load(
                path,
                format!("module does not export `{MEMORY_EXPORT}`"),
            ));
        }

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.memory_limit)
            .table_elements(TABLE_ELEMENT_LIMIT)
            .build();
        let mut store = Store::new(&self.engine, PluginState::new(limits));
        store.limiter(|state| &mut state.limits);

        let instance = self
            .linker
            .instantiate(&mut store, &module)
            .map_err(|e| PluginError::load(path, e))?;

        match instance.get_export(&mut store, INIT_EXPORT) {
            None => {
                debug!(path = %path.display(), "plugin has no init export");
            }
            Some(Extern::Func(init)) => {
                let init = init.typed::<(), ()>(&store).map_err(|e| {
                    PluginError::load(path, format!("`{INIT_EXPORT}` has the wrong type: {e}"))
                })?;
                init.call(&mut store, ()).map_err(|e| {
                    PluginError::load(path, format!("`{INIT_EXPORT}` failed: {e}"))
                })?;
            }
            Some(_) => {
                return Err(PluginError::load(
                    path,
                    format!("`{INIT_EXPORT}` is not a function"),
                ));
            }
        }

        let registrations = std::mem::take(&mut store.data_mut().registrations);
        for reg in &registrations {
            instance
                .get_typed_func::<(), f64>(&mut store, &reg.export)
                .map_err(|e| {
                    PluginError::load(
                        path,
                        format!("gatherer `{}` export `{}`: {e}", reg.name, reg.export),
                    )
                })?;
        }

        let handle = Arc::new(ModuleHandle::new(
            path.to_path_buf(),
            module,
            instance,
            store,
            registrations,
        ));

        let previous = self.plugin(path);
        let already_registered: HashSet<&str> = previous
            .iter()
            .flat_map(|p| p.registrations())
            .map(|r| r.name.as_str())
            .collect();
        self.register_all(&handle, &already_registered)?;

        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), Arc::clone(&handle));
        if previous.is_some() {
            warn!(path = %path.display(), "plugin reloaded; previous handle replaced");
        }

        info!(
            path = %path.display(),
            gatherers = handle.registrations().len(),
            "plugin loaded"
        );
        Ok(handle)
    }

    /// Load each path in order, stopping at the first failure.
    ///
    /// Modules loaded before the failure stay loaded. An empty list is a
    /// no-op.
    pub fn load_all<I, P>(&self, paths: I) -> PluginResult<Vec<Arc<ModuleHandle>>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths.into_iter().map(|p| self.load(p)).collect()
    }

    /// The module loaded from `path`, if any.
    pub fn plugin(&self, path: impl AsRef<Path>) -> Option<Arc<ModuleHandle>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path.as_ref())
            .cloned()
    }

    /// Paths of all loaded modules, sorted.
    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the handle's gatherers, skipping names in `skip`.
    fn register_all(&self, handle: &Arc<ModuleHandle>, skip: &HashSet<&str>) -> PluginResult<()> {
        let register_err = |source: GatherError| PluginError::Register {
            path: handle.path().to_path_buf(),
            source,
        };

        // Check every name up front so a clash leaves nothing half-registered.
        let mut seen = HashSet::new();
        for reg in handle.registrations() {
            if !seen.insert(reg.name.as_str()) {
                return Err(register_err(GatherError::DuplicateName(reg.name.clone())));
            }
            if !skip.contains(reg.name.as_str()) && self.registry.contains(&reg.name) {
                return Err(register_err(GatherError::DuplicateName(reg.name.clone())));
            }
        }

        for reg in handle.registrations() {
            if skip.contains(reg.name.as_str()) {
                debug!(gatherer = %reg.name, "kept registration from previous load");
                continue;
            }
            let func = handle.lookup(&reg.export)?.func::<(), f64>()?;
            self.registry
                .register(reg.name.clone(), wasm_gatherer_factory(reg.name.clone(), func))
                .map_err(register_err)?;
            debug!(
                path = %handle.path().display(),
                gatherer = %reg.name,
                export = %reg.export,
                "plugin gatherer registered"
            );
        }
        Ok(())
    }
}

/// Host side of `warpgrid.register_gatherer`.
fn register_gatherer(
    mut caller: Caller<'_, PluginState>,
    name_ptr: i32,
    name_len: i32,
    export_ptr: i32,
    export_len: i32,
) -> wasmtime::Result<()> {
    let Some(Extern::Memory(memory)) = caller.get_export(MEMORY_EXPORT) else {
        return Err(wasmtime::Error::msg(format!(
            "{REGISTER_GATHERER}: module does not export `{MEMORY_EXPORT}`"
        )));
    };

    let (name, export) = {
        let data = memory.data(&caller);
        (
            guest_str(data, name_ptr, name_len)?,
            guest_str(data, export_ptr, export_len)?,
        )
    };
    if name.is_empty() {
        return Err(wasmtime::Error::msg(format!(
            "{REGISTER_GATHERER}: gatherer name is empty"
        )));
    }

    debug!(gatherer = %name, export = %export, "plugin declared gatherer");
    caller
        .data_mut()
        .registrations
        .push(Registration { name, export });
    Ok(())
}

/// Copy a UTF-8 string out of guest memory.
fn guest_str(data: &[u8], ptr: i32, len: i32) -> wasmtime::Result<String> {
    // Pointers are u32 in wasm32; reinterpret rather than sign-extend.
    let start = ptr as u32 as usize;
    let len = len as u32 as usize;
    let bytes = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| {
            wasmtime::Error::msg(format!(
                "{REGISTER_GATHERER}: string at {start}+{len} is out of bounds"
            ))
        })?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| wasmtime::Error::msg(format!("{REGISTER_GATHERER}: invalid UTF-8: {e}")))
}
