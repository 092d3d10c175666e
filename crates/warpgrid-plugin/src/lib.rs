//! warpgrid-plugin — Wasm extension modules for the gatherer registry.
//!
//! Extensions are core WebAssembly modules loaded through wasmtime. Each
//! module is instantiated once; during its `warpgrid_init` export it declares
//! gatherers through the `warpgrid.register_gatherer` host import, and the
//! loader registers a factory for each into the shared
//! [`GathererRegistry`](warpgrid_gather::GathererRegistry).
//!
//! # Architecture
//!
//! ```text
//! PluginLoader
//!   ├── wasmtime Engine + Linker (host import: warpgrid.register_gatherer)
//!   └── path → ModuleHandle
//!         ├── Instance + Store (one per module, mutex-guarded)
//!         └── lookup(symbol) → Symbol → func::<P, R>() → ExportedFunc
//!
//! GathererRegistry
//!   └── "<declared name>" → WasmGatherer (calls a `() -> f64` export)
//! ```
//!
//! # Plugin ABI
//!
//! ```wat
//! (module
//!   (import "warpgrid" "register_gatherer"
//!     (func $register (param i32 i32 i32 i32)))
//!   (memory (export "memory") 1)
//!   (data (i32.const 0) "queue_depthdepth")
//!   (func (export "warpgrid_init")
//!     (call $register (i32.const 0) (i32.const 11) (i32.const 11) (i32.const 5)))
//!   (func (export "depth") (result f64) (f64.const 12.5)))
//! ```

pub mod error;
pub mod gatherer;
pub mod loader;
pub mod module;

pub use error::{PluginError, PluginResult};
pub use gatherer::WasmGatherer;
pub use loader::{DEFAULT_MEMORY_LIMIT, PluginLoader};
pub use module::{ExportedFunc, ModuleHandle, Registration, Symbol, SymbolKind};

/// Import module name of the host functions.
pub const HOST_MODULE: &str = "warpgrid";

/// Host import a plugin calls to declare a gatherer.
pub const REGISTER_GATHERER: &str = "register_gatherer";

/// Optional plugin export run once after instantiation.
pub const INIT_EXPORT: &str = "warpgrid_init";

/// Linear memory export the host reads strings from.
pub const MEMORY_EXPORT: &str = "memory";
