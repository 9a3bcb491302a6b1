//! Engine configuration consumed by the module loaders.

use wasmtime::OptLevel;

/// Largest linear memory a wasm32 module can address.
pub const WASM32_MAX_MEMORY: usize = 4 * 1024 * 1024 * 1024;

/// Configuration for compiling and hosting the engine module.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub opt_level: OptLevel,
    pub max_memory_bytes: usize,
    pub max_wasm_stack: Option<usize>,
    /// Link WASI preview1 for clocks, random and environment access.
    pub wasi: bool,
    /// Resolve unknown imports to trapping stubs instead of failing to link.
    pub trap_unknown_imports: bool,
    pub worker_thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            max_memory_bytes: WASM32_MAX_MEMORY,
            max_wasm_stack: None,
            wasi: true,
            trap_unknown_imports: true,
            worker_thread_name: "duckrun-worker".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opt_level(mut self, level: OptLevel) -> Self {
        self.opt_level = level;
        self
    }

    pub fn max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn max_wasm_stack(mut self, bytes: usize) -> Self {
        self.max_wasm_stack = Some(bytes);
        self
    }

    pub fn wasi(mut self, enabled: bool) -> Self {
        self.wasi = enabled;
        self
    }

    pub fn trap_unknown_imports(mut self, enabled: bool) -> Self {
        self.trap_unknown_imports = enabled;
        self
    }

    pub fn worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    /// Builds the wasmtime configuration. Async support is always on since
    /// every guest call is issued with `call_async`.
    pub fn to_wasmtime(&self) -> wasmtime::Config {
        let mut config = wasmtime::Config::new();
        config.async_support(true);
        config.cranelift_opt_level(self.opt_level);
        if let Some(stack) = self.max_wasm_stack {
            config.max_wasm_stack(stack);
        }
        config
    }
}
