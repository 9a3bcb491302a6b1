//! # Module Loaders
//!
//! A [`ModuleLoader`] knows where the engine module comes from and how to bring
//! it up: fetch the bytes, compile, bind the runtime function table, route
//! stdio, instantiate, and signal once the module's runtime is initialized.
//! Loaders are injected into the [`crate::engine::Engine`] as a capability.

pub mod in_process;
pub mod locate;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::host::Stdio;
use crate::module;
use crate::module::NativeModule;
use crate::runtime::RuntimeFunctionTable;

pub use in_process::InProcessLoader;
pub use locate::Locator;
pub use worker::WorkerLoader;

#[derive(Debug)]
pub enum Error {
    /// The module bytes could not be fetched.
    Fetch { source: String, error: std::io::Error },
    /// The module asked for a worker script but none was configured.
    MissingWorker,
    /// The module asked for a file the locator does not know.
    UnexpectedFile { prefix: String, path: String },
    Compile(wasmtime::Error),
    Link(String),
    Instantiate(wasmtime::Error),
    Module(module::Error),
    /// The loader finished without the runtime signalling initialization.
    NeverInitialized,
    Worker(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch { source, error } => write!(f, "Failed to fetch module {}: {}", source, error),
            Self::MissingWorker => write!(f, "Missing worker script"),
            Self::UnexpectedFile { prefix, path } => {
                write!(f, "Instantiation requested unexpected file: prefix={} path={}", prefix, path)
            }
            Self::Compile(e) => write!(f, "Compile error: {}", e),
            Self::Link(msg) => write!(f, "Linker error: {}", msg),
            Self::Instantiate(e) => write!(f, "Instantiate error: {}", e),
            Self::Module(e) => write!(f, "Module error: {}", e),
            Self::NeverInitialized => write!(f, "Module runtime never signalled initialization"),
            Self::Worker(msg) => write!(f, "Worker error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<module::Error> for Error {
    fn from(e: module::Error) -> Self {
        Self::Module(e)
    }
}

impl From<crate::host::Error> for Error {
    fn from(e: crate::host::Error) -> Self {
        Self::Link(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where module bytes come from.
#[derive(Clone, Debug)]
pub enum ModuleSource {
    Bytes(Arc<[u8]>),
    Path(PathBuf),
}

impl ModuleSource {
    pub fn bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Bytes(bytes.into())
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Fetches the module bytes. Suspends while reading from disk.
    pub async fn fetch(&self) -> Result<Arc<[u8]>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Path(path) => tokio::fs::read(path)
                .await
                .map(Arc::from)
                .map_err(|error| Error::Fetch { source: path.display().to_string(), error }),
        }
    }
}

/// Fires once the module's runtime reports it is initialized.
///
/// Consuming `notify` makes a second signal impossible. Dropping the notifier
/// unfired fails the pending `open()`.
#[derive(Debug)]
pub struct RuntimeInitialized(oneshot::Sender<()>);

impl RuntimeInitialized {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn notify(self) {
        // The receiver only disappears if open() was abandoned.
        let _ = self.0.send(());
    }
}

/// Host callbacks handed to the loader for one instantiation.
#[derive(Debug)]
pub struct ModuleOverrides {
    pub stdio: Stdio,
    pub on_runtime_initialized: RuntimeInitialized,
}

/// Capability to bring up the engine module.
#[async_trait::async_trait]
pub trait ModuleLoader: Send + Sync + 'static {
    /// Resolves a file the module needs, keyed by suffix.
    fn locate_file(&self, path: &str, prefix: &str) -> Result<ModuleSource>;

    /// Instantiates the module with `functions` bound into its imports.
    ///
    /// Implementations must route stdio through `overrides.stdio` and call
    /// `overrides.on_runtime_initialized.notify()` exactly once after the
    /// module's runtime has initialized.
    async fn instantiate(
        &self,
        functions: RuntimeFunctionTable,
        overrides: ModuleOverrides,
    ) -> Result<Box<dyn NativeModule>>;
}

#[async_trait::async_trait]
impl<L: ModuleLoader + ?Sized> ModuleLoader for Arc<L> {
    fn locate_file(&self, path: &str, prefix: &str) -> Result<ModuleSource> {
        (**self).locate_file(path, prefix)
    }

    async fn instantiate(
        &self,
        functions: RuntimeFunctionTable,
        overrides: ModuleOverrides,
    ) -> Result<Box<dyn NativeModule>> {
        (**self).instantiate(functions, overrides).await
    }
}
