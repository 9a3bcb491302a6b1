//! # Worker-hosted loader
//!
//! Hosts the module of any inner loader on a dedicated OS thread with its own
//! current-thread runtime. The engine keeps a [`WorkerModule`] proxy that
//! forwards every native call over a channel, so guest execution never runs
//! on the caller's executor.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;

use crate::config::EngineConfig;
use crate::loader::Error;
use crate::loader::InProcessLoader;
use crate::loader::Locator;
use crate::loader::ModuleLoader;
use crate::loader::ModuleOverrides;
use crate::loader::ModuleSource;
use crate::loader::Result;
use crate::module;
use crate::module::Arg;
use crate::module::NativeModule;
use crate::module::ResponseTriple;
use crate::runtime::RuntimeFunctionTable;

type Reply<T> = oneshot::Sender<module::Result<T>>;

enum Request {
    CallSret {
        symbol: String,
        args: Vec<Arg>,
        reply: Reply<ResponseTriple>,
    },
    Call {
        symbol: String,
        args: Vec<Arg>,
        reply: Reply<Option<f64>>,
    },
    Read {
        ptr: u32,
        len: u32,
        reply: Reply<Vec<u8>>,
    },
}

/// Loader that moves an inner loader's module onto its own thread.
pub struct WorkerLoader<L> {
    inner: Arc<L>,
    thread_name: String,
}

impl<L: ModuleLoader> WorkerLoader<L> {
    pub fn new(inner: L) -> Self {
        Self::named(inner, EngineConfig::default().worker_thread_name)
    }

    pub fn named(inner: L, thread_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(inner),
            thread_name: thread_name.into(),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

impl WorkerLoader<InProcessLoader> {
    /// Worker-hosted wasmtime module, named after `config.worker_thread_name`.
    pub fn in_process(locator: Locator, config: EngineConfig) -> Result<Self> {
        let name = config.worker_thread_name.clone();
        Ok(Self::named(InProcessLoader::new(locator, config)?, name))
    }
}

#[async_trait::async_trait]
impl<L: ModuleLoader> ModuleLoader for WorkerLoader<L> {
    fn locate_file(&self, path: &str, prefix: &str) -> Result<ModuleSource> {
        self.inner.locate_file(path, prefix)
    }

    async fn instantiate(
        &self,
        functions: RuntimeFunctionTable,
        overrides: ModuleOverrides,
    ) -> Result<Box<dyn NativeModule>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (boot_tx, boot_rx) = oneshot::channel();
        let inner = self.inner.clone();

        std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || host(inner, functions, overrides, rx, boot_tx))
            .map_err(|e| Error::Worker(e.to_string()))?;

        match boot_rx.await {
            Ok(Ok(())) => {
                info!(thread = %self.thread_name, "module hosted on worker thread");
                Ok(Box::new(WorkerModule { tx }))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Worker("worker exited during instantiation".to_owned())),
        }
    }
}

/// Body of the worker thread: instantiate, report, then serve calls until
/// the proxy is dropped.
fn host<L: ModuleLoader>(
    inner: Arc<L>,
    functions: RuntimeFunctionTable,
    overrides: ModuleOverrides,
    mut rx: mpsc::UnboundedReceiver<Request>,
    boot: oneshot::Sender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = boot.send(Err(Error::Worker(e.to_string())));
            return;
        }
    };

    runtime.block_on(async move {
        let mut module = match inner.instantiate(functions, overrides).await {
            Ok(module) => module,
            Err(e) => {
                let _ = boot.send(Err(e));
                return;
            }
        };
        if boot.send(Ok(())).is_err() {
            return;
        }

        // A dropped reply means the caller gave up; the call itself still ran.
        while let Some(request) = rx.recv().await {
            match request {
                Request::CallSret { symbol, args, reply } => {
                    let _ = reply.send(module.call_sret(&symbol, &args).await);
                }
                Request::Call { symbol, args, reply } => {
                    let _ = reply.send(module.call(&symbol, &args).await);
                }
                Request::Read { ptr, len, reply } => {
                    let _ = reply.send(module.read(ptr, len).await);
                }
            }
        }
        debug!("worker module released");
    });
}

/// Proxy for a module living on a worker thread.
pub struct WorkerModule {
    tx: mpsc::UnboundedSender<Request>,
}

impl WorkerModule {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> module::Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| module::Error::WorkerClosed)?;
        response.await.map_err(|_| module::Error::WorkerClosed)?
    }
}

#[async_trait::async_trait]
impl NativeModule for WorkerModule {
    async fn call_sret(&mut self, symbol: &str, args: &[Arg]) -> module::Result<ResponseTriple> {
        self.request(|reply| Request::CallSret {
            symbol: symbol.to_owned(),
            args: args.to_vec(),
            reply,
        })
        .await
    }

    async fn call(&mut self, symbol: &str, args: &[Arg]) -> module::Result<Option<f64>> {
        self.request(|reply| Request::Call {
            symbol: symbol.to_owned(),
            args: args.to_vec(),
            reply,
        })
        .await
    }

    async fn read(&mut self, ptr: u32, len: u32) -> module::Result<Vec<u8>> {
        self.request(|reply| Request::Read { ptr, len, reply }).await
    }
}
