//! # Engine Handle
//!
//! Owns the one live module instance and dispatches every operation to it
//! through the marshaling protocol.
//!
//! ## Lifecycle
//!
//! `Uninitialized -> Opening -> Ready`. [`Engine::open`] is idempotent. The
//! first caller starts a bring-up attempt on a background task and every
//! concurrent caller joins that attempt, so all of them observe the same
//! outcome and the loader runs once per attempt. The handle becomes `Ready`
//! only once the loader has returned *and* the module's runtime has
//! signalled initialization. A failed attempt leaves the handle
//! `Uninitialized`; the next call to `open` starts a fresh one.
//!
//! ## Exclusivity
//!
//! The module sits behind an async mutex that is held for the whole
//! call/copy/release cycle of an operation. Response buffers are therefore
//! never visible to a second caller.

use std::sync::Arc;
use std::sync::PoisonError;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::sync::OnceCell;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::abi::Abi;
use crate::abi::FeatureFlags;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::host::Stdio;
use crate::loader;
use crate::loader::ModuleLoader;
use crate::loader::ModuleOverrides;
use crate::loader::RuntimeInitialized;
use crate::marshal;
use crate::marshal::Marshal;
use crate::module;
use crate::module::NativeModule;
use crate::runtime::RuntimeFunctionTable;
use crate::tokens::ScriptTokens;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Opening,
    Ready,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Opening => write!(f, "opening"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// The module reported a failure. Holds its diagnostic text verbatim.
    Protocol(String),
    /// An operation other than `open` ran before the engine was ready.
    NotReady(EngineState),
    /// The connection id is not live, e.g. it was disconnected.
    UnknownConnection(ConnectionId),
    /// A send/fetch cycle is still outstanding on the connection.
    StreamInFlight(ConnectionId),
    /// `fetch_query_results` without a preceding `send_query`.
    NoActiveStream(ConnectionId),
    /// The engine behind a connection has been dropped.
    EngineDropped,
    /// Bring-up failed. Shared by every caller that joined the attempt.
    Loader(Arc<loader::Error>),
    Module(module::Error),
    /// A payload could not be decoded.
    Decode(String),
    /// Import options could not be serialized.
    Options(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => f.write_str(msg),
            Self::NotReady(state) => write!(f, "Engine is not ready (state: {})", state),
            Self::UnknownConnection(id) => write!(f, "Unknown connection: {}", id),
            Self::StreamInFlight(id) => write!(f, "A query stream is already open on {}", id),
            Self::NoActiveStream(id) => write!(f, "No query stream is open on {}", id),
            Self::EngineDropped => write!(f, "Engine has been dropped"),
            Self::Loader(e) => write!(f, "Loader error: {}", e),
            Self::Module(e) => write!(f, "Module error: {}", e),
            Self::Decode(msg) => write!(f, "Decode error: {}", msg),
            Self::Options(e) => write!(f, "Invalid import options: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<loader::Error> for Error {
    fn from(e: loader::Error) -> Self {
        Self::Loader(Arc::new(e))
    }
}

impl From<module::Error> for Error {
    fn from(e: module::Error) -> Self {
        Self::Module(e)
    }
}

impl From<marshal::Error> for Error {
    fn from(e: marshal::Error) -> Self {
        match e {
            marshal::Error::Protocol(msg) => Self::Protocol(msg),
            marshal::Error::Module(e) => Self::Module(e),
            other => Self::Decode(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Default)]
struct ConnectionState {
    streaming: bool,
}

type ModuleCell = OnceCell<Mutex<Box<dyn NativeModule>>>;

/// Outcome of one bring-up attempt, `None` while it is still running.
type Outcome = Option<std::result::Result<(), Arc<loader::Error>>>;
type Attempt = watch::Receiver<Outcome>;

pub(crate) struct Inner {
    loader: Arc<dyn ModuleLoader>,
    functions: RuntimeFunctionTable,
    stdio: Stdio,
    module: ModuleCell,
    /// The attempt in flight, if any. Cleared before its outcome is sent.
    attempt: std::sync::Mutex<Option<Attempt>>,
    connections: DashMap<ConnectionId, ConnectionState>,
}

impl Inner {
    fn state(&self) -> EngineState {
        if self.module.initialized() {
            EngineState::Ready
        } else if self.current_attempt().is_some() {
            EngineState::Opening
        } else {
            EngineState::Uninitialized
        }
    }

    fn current_attempt(&self) -> std::sync::MutexGuard<'_, Option<Attempt>> {
        self.attempt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the attempt in flight or starts a new one, then waits for it.
    async fn open(self: &Arc<Self>) -> Result<()> {
        let mut attempt = {
            let mut slot = self.current_attempt();
            if self.module.initialized() {
                return Ok(());
            }
            match slot.clone() {
                Some(attempt) => attempt,
                None => {
                    let (outcome, attempt) = watch::channel(None);
                    *slot = Some(attempt.clone());
                    tokio::spawn(Arc::clone(self).bring_up(outcome));
                    attempt
                }
            }
        };

        let outcome = match attempt.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(Error::Loader(e)),
            None => Err(loader::Error::NeverInitialized.into()),
        }
    }

    /// Runs one attempt to completion, independent of the callers waiting on
    /// it.
    async fn bring_up(self: Arc<Self>, outcome: watch::Sender<Outcome>) {
        let result = match self.instantiate().await {
            Ok(module) => {
                // The slot admits one attempt at a time, so the cell is empty.
                let _ = self.module.set(Mutex::new(module));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "bring-up failed");
                Err(Arc::new(e))
            }
        };
        *self.current_attempt() = None;
        let _ = outcome.send(Some(result));
    }

    async fn instantiate(&self) -> loader::Result<Box<dyn NativeModule>> {
        let (notifier, initialized) = RuntimeInitialized::channel();
        let overrides = ModuleOverrides {
            stdio: self.stdio.clone(),
            on_runtime_initialized: notifier,
        };

        info!(functions = self.functions.len(), "instantiating module");
        let module = self
            .loader
            .instantiate(self.functions.clone(), overrides)
            .await?;
        initialized
            .await
            .map_err(|_| loader::Error::NeverInitialized)?;
        info!("engine ready");
        Ok(module)
    }

    async fn module(&self) -> Result<MutexGuard<'_, Box<dyn NativeModule>>> {
        match self.module.get() {
            Some(module) => Ok(module.lock().await),
            None => Err(Error::NotReady(self.state())),
        }
    }

    /// Whether `id` has a stream in flight. Fails for unknown ids.
    fn streaming(&self, id: ConnectionId) -> Result<bool> {
        self.connections
            .get(&id)
            .map(|state| state.streaming)
            .ok_or(Error::UnknownConnection(id))
    }

    fn idle(&self, id: ConnectionId) -> Result<()> {
        match self.streaming(id)? {
            true => Err(Error::StreamInFlight(id)),
            false => Ok(()),
        }
    }

    pub(crate) fn set_streaming(&self, id: ConnectionId, streaming: bool) {
        if let Some(mut state) = self.connections.get_mut(&id) {
            state.streaming = streaming;
        }
    }

    async fn run_query(&self, id: ConnectionId, text: &str) -> Result<Vec<u8>> {
        let mut module = self.module().await?;
        self.idle(id)?;
        let mut marshal = Marshal::new(&mut **module);
        Ok(marshal.bytes(Abi::QueryRun, &[id.into(), text.into()]).await?)
    }

    async fn send_query(&self, id: ConnectionId, text: &str) -> Result<Vec<u8>> {
        let mut module = self.module().await?;
        self.idle(id)?;
        let mut marshal = Marshal::new(&mut **module);
        let header = marshal.bytes(Abi::QuerySend, &[id.into(), text.into()]).await?;
        self.set_streaming(id, true);
        Ok(header)
    }

    async fn fetch_query_results(&self, id: ConnectionId) -> Result<Vec<u8>> {
        let mut module = self.module().await?;
        if !self.streaming(id)? {
            return Err(Error::NoActiveStream(id));
        }
        let mut marshal = Marshal::new(&mut **module);
        let chunk = marshal.bytes(Abi::QueryFetchResults, &[id.into()]).await;
        match &chunk {
            Ok(bytes) if !bytes.is_empty() => {}
            _ => {
                debug!(connection = %id, "query stream finished");
                self.set_streaming(id, false);
            }
        }
        Ok(chunk?)
    }

    async fn import(&self, abi: Abi, id: ConnectionId, path: &str, options: String) -> Result<()> {
        let mut module = self.module().await?;
        self.idle(id)?;
        let mut marshal = Marshal::new(&mut **module);
        Ok(marshal.unit(abi, &[id.into(), path.into(), options.into()]).await?)
    }

    async fn disconnect(&self, id: ConnectionId) -> Result<()> {
        let mut module = self.module().await?;
        self.connections
            .remove(&id)
            .ok_or(Error::UnknownConnection(id))?;
        let mut marshal = Marshal::new(&mut **module);
        if let Err(e) = marshal.void(Abi::Disconnect, &[id.into()]).await {
            warn!(connection = %id, error = %e, "disconnect failed");
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stdio.flush();
    }
}

/// Handle to the engine module. Clones share the same instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

pub struct EngineBuilder {
    loader: Arc<dyn ModuleLoader>,
    functions: RuntimeFunctionTable,
    stdio: Stdio,
}

impl EngineBuilder {
    /// Adds host functions to the module's imports. Later tables win on
    /// conflicting names.
    pub fn functions(mut self, functions: RuntimeFunctionTable) -> Self {
        self.functions.merge(functions);
        self
    }

    /// Replaces the default stdout/stderr routing.
    pub fn stdio(mut self, stdio: Stdio) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(Inner {
                loader: self.loader,
                functions: self.functions,
                stdio: self.stdio,
                module: OnceCell::new(),
                attempt: std::sync::Mutex::new(None),
                connections: DashMap::new(),
            }),
        }
    }
}

impl Engine {
    pub fn builder(loader: impl ModuleLoader) -> EngineBuilder {
        EngineBuilder {
            loader: Arc::new(loader),
            functions: RuntimeFunctionTable::new(),
            stdio: Stdio::default(),
        }
    }

    pub fn new(loader: impl ModuleLoader) -> Self {
        Self::builder(loader).build()
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Brings the module up, or waits for the bring-up already in progress.
    ///
    /// Callers that join an attempt share its result: if it fails, they all
    /// get the same [`Error::Loader`] and the loader is not run again until
    /// a later call to `open`.
    pub async fn open(&self) -> Result<()> {
        self.inner.open().await
    }

    /// Tokenizes a script without parsing it.
    pub async fn tokenize(&self, text: &str) -> Result<ScriptTokens> {
        let mut module = self.inner.module().await?;
        let json = Marshal::new(&mut **module)
            .string(Abi::Tokenize, &[text.into()])
            .await?;
        ScriptTokens::from_json(&json)
    }

    /// Flushes buffered file writes of the module.
    pub async fn flush_files(&self) -> Result<()> {
        let mut module = self.inner.module().await?;
        Ok(Marshal::new(&mut **module).void(Abi::FlushFiles, &[]).await?)
    }

    pub async fn get_version(&self) -> Result<String> {
        let mut module = self.inner.module().await?;
        Ok(Marshal::new(&mut **module)
            .string(Abi::GetVersion, &[])
            .await?)
    }

    pub async fn get_feature_flags(&self) -> Result<FeatureFlags> {
        let mut module = self.inner.module().await?;
        let bits = Marshal::new(&mut **module)
            .number(Abi::GetFeatureFlags, &[])
            .await?;
        Ok(FeatureFlags::from_bits(bits as u32))
    }

    /// Opens a new connection inside the module.
    pub async fn connect(&self) -> Result<Connection> {
        let mut module = self.inner.module().await?;
        let raw = Marshal::new(&mut **module)
            .number(Abi::Connect, &[])
            .await?;
        let id = ConnectionId(raw as u32);
        self.inner.connections.insert(id, ConnectionState::default());
        debug!(connection = %id, "connected");
        Ok(Connection::new(id, Arc::downgrade(&self.inner)))
    }

    /// Closes a connection. Module-side failures are logged, not returned.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<()> {
        self.inner.disconnect(id).await
    }

    /// Runs a query to completion and returns the full result.
    pub async fn run_query(&self, id: ConnectionId, text: &str) -> Result<Vec<u8>> {
        self.inner.run_query(id, text).await
    }

    /// Starts a streamed query and returns its header bytes.
    pub async fn send_query(&self, id: ConnectionId, text: &str) -> Result<Vec<u8>> {
        self.inner.send_query(id, text).await
    }

    /// Pulls the next chunk of a streamed query. An empty chunk ends the
    /// stream.
    pub async fn fetch_query_results(&self, id: ConnectionId) -> Result<Vec<u8>> {
        self.inner.fetch_query_results(id).await
    }

    pub async fn import_csv_from_path(
        &self,
        id: ConnectionId,
        path: &str,
        options: &(impl Serialize + Sync),
    ) -> Result<()> {
        let options = serde_json::to_string(options).map_err(Error::Options)?;
        self.inner.import(Abi::ImportCsvTable, id, path, options).await
    }

    pub async fn import_json_from_path(
        &self,
        id: ConnectionId,
        path: &str,
        options: &(impl Serialize + Sync),
    ) -> Result<()> {
        let options = serde_json::to_string(options).map_err(Error::Options)?;
        self.inner.import(Abi::ImportJsonTable, id, path, options).await
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.inner.connections.len()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}
