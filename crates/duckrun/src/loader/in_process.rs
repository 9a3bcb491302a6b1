//! # In-process loader
//!
//! Compiles and instantiates the engine module on the calling task.

use tracing::debug;
use tracing::info;
use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;

use crate::config::EngineConfig;
use crate::loader::Error;
use crate::loader::Locator;
use crate::loader::ModuleLoader;
use crate::loader::ModuleOverrides;
use crate::loader::ModuleSource;
use crate::loader::Result;
use crate::loader::locate::MAIN_MODULE_FILE;
use crate::module::NativeModule;
use crate::runtime::HostCtx;
use crate::runtime::RuntimeFunctionTable;
use crate::wasm::WasmModule;

/// Hosts the module in the current process and thread pool.
pub struct InProcessLoader {
    engine: wasmtime::Engine,
    locator: Locator,
    config: EngineConfig,
}

impl InProcessLoader {
    pub fn new(locator: Locator, config: EngineConfig) -> Result<Self> {
        let engine = wasmtime::Engine::new(&config.to_wasmtime()).map_err(Error::Compile)?;
        Ok(Self { engine, locator, config })
    }

    /// Shorthand for a loader of a single module with default configuration.
    pub fn from_source(source: ModuleSource) -> Result<Self> {
        Self::new(Locator::new(source), EngineConfig::default())
    }

    pub fn engine(&self) -> &wasmtime::Engine {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn linker(
        &self,
        module: &Module,
        functions: &RuntimeFunctionTable,
        overrides: &ModuleOverrides,
    ) -> Result<Linker<HostCtx>> {
        let mut linker = Linker::new(&self.engine);
        // Later definitions replace WASI's, e.g. fd_write for stdio routing.
        linker.allow_shadowing(true);

        if self.config.wasi {
            wasmtime_wasi::p1::add_to_linker_async(&mut linker, |cx: &mut HostCtx| &mut cx.wasi)
                .map_err(|e| Error::Link(e.to_string()))?;
        }
        overrides.stdio.link(&mut linker)?;
        functions
            .link(&mut linker)
            .map_err(|e| Error::Link(e.to_string()))?;
        if self.config.trap_unknown_imports {
            linker
                .define_unknown_imports_as_traps(module)
                .map_err(|e| Error::Link(e.to_string()))?;
        }
        Ok(linker)
    }
}

#[async_trait::async_trait]
impl ModuleLoader for InProcessLoader {
    fn locate_file(&self, path: &str, prefix: &str) -> Result<ModuleSource> {
        self.locator.locate(path, prefix)
    }

    async fn instantiate(
        &self,
        functions: RuntimeFunctionTable,
        overrides: ModuleOverrides,
    ) -> Result<Box<dyn NativeModule>> {
        let source = self.locate_file(MAIN_MODULE_FILE, "")?;
        let bytes = source.fetch().await?;
        debug!(bytes = bytes.len(), "compiling module");
        let module = Module::new(&self.engine, &bytes).map_err(Error::Compile)?;

        let linker = self.linker(&module, &functions, &overrides)?;
        let mut store = Store::new(&self.engine, HostCtx::new(&self.config));
        store.limiter(|cx| &mut cx.limits);

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(Error::Instantiate)?;

        let mut module = WasmModule::new(store, instance)?;
        module.initialize().await?;
        info!(imports = functions.len(), "module runtime initialized");
        overrides.on_runtime_initialized.notify();

        Ok(Box::new(module))
    }
}
