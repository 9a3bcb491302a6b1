//! Mock modules and loaders for testing.
//!
//! [`MockModule`] stands in for a live engine module. Responses are scripted
//! per symbol through a shared [`MockHandle`], which also audits the release
//! discipline: every response buffer must be released exactly once before the
//! next triple-returning call, and never read after release.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::abi::Abi;
use crate::abi::StatusCode;
use crate::loader;
use crate::loader::Locator;
use crate::loader::ModuleLoader;
use crate::loader::ModuleOverrides;
use crate::loader::ModuleSource;
use crate::module;
use crate::module::Arg;
use crate::module::NativeModule;
use crate::module::ResponseTriple;
use crate::runtime::RuntimeFunctionTable;

/// A scripted answer to a triple-returning call.
#[derive(Clone, Debug, PartialEq)]
pub enum MockResponse {
    Ok(Vec<u8>),
    /// Status ERROR with a diagnostic message.
    Err(String),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Ok(text.as_bytes().to_vec())
    }

    pub fn error(message: &str) -> Self {
        Self::Err(message.to_owned())
    }

    fn into_parts(self) -> (StatusCode, Vec<u8>) {
        match self {
            Self::Ok(bytes) => (StatusCode::Success, bytes),
            Self::Err(message) => (StatusCode::Error, message.into_bytes()),
        }
    }
}

#[derive(Debug)]
struct MockState {
    queued: HashMap<String, VecDeque<MockResponse>>,
    fallback: HashMap<String, MockResponse>,
    numbers: HashMap<String, f64>,
    traps: HashSet<String>,
    calls: Vec<(String, Vec<Arg>)>,
    outstanding: Option<(u32, Vec<u8>)>,
    next_ptr: u32,
    next_connection: u32,
    releases: usize,
    double_releases: usize,
    leaks: usize,
    stale_reads: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            queued: HashMap::new(),
            fallback: HashMap::new(),
            numbers: HashMap::new(),
            traps: HashSet::new(),
            calls: Vec::new(),
            outstanding: None,
            next_ptr: 1024,
            next_connection: 1,
            releases: 0,
            double_releases: 0,
            leaks: 0,
            stale_reads: 0,
        }
    }
}

/// Scripts and inspects a [`MockModule`]. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A module backed by this handle.
    pub fn module(&self) -> MockModule {
        MockModule { handle: self.clone() }
    }

    /// Queues a one-shot response for `abi`.
    pub fn respond(&self, abi: Abi, response: MockResponse) -> &Self {
        self.state()
            .queued
            .entry(abi.symbol().to_owned())
            .or_default()
            .push_back(response);
        self
    }

    /// Response used for `abi` once its queue is empty.
    pub fn respond_always(&self, abi: Abi, response: MockResponse) -> &Self {
        self.state().fallback.insert(abi.symbol().to_owned(), response);
        self
    }

    /// Scalar result of a plain call.
    pub fn number(&self, abi: Abi, value: f64) -> &Self {
        self.state().numbers.insert(abi.symbol().to_owned(), value);
        self
    }

    /// Makes every call of `abi` trap.
    pub fn trap(&self, abi: Abi) -> &Self {
        self.state().traps.insert(abi.symbol().to_owned());
        self
    }

    /// Every symbol invoked so far, releases included, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.iter().map(|(symbol, _)| symbol.clone()).collect()
    }

    pub fn calls_to(&self, abi: Abi) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(symbol, _)| symbol == abi.symbol())
            .count()
    }

    /// Arguments of the most recent call of `abi`.
    pub fn last_args(&self, abi: Abi) -> Option<Vec<Arg>> {
        self.state()
            .calls
            .iter()
            .rev()
            .find(|(symbol, _)| symbol == abi.symbol())
            .map(|(_, args)| args.clone())
    }

    pub fn releases(&self) -> usize {
        self.state().releases
    }

    /// Releases issued with no response outstanding.
    pub fn double_releases(&self) -> usize {
        self.state().double_releases
    }

    /// Responses replaced by a new call before being released. A response
    /// still outstanding now counts as well.
    pub fn leaks(&self) -> usize {
        let state = self.state();
        state.leaks + usize::from(state.outstanding.is_some())
    }

    /// Reads of buffers that were not outstanding.
    pub fn stale_reads(&self) -> usize {
        self.state().stale_reads
    }

    /// True when every response so far was released exactly once.
    pub fn balanced(&self) -> bool {
        self.double_releases() == 0 && self.leaks() == 0 && self.stale_reads() == 0
    }
}

/// Scripted [`NativeModule`].
#[derive(Debug)]
pub struct MockModule {
    handle: MockHandle,
}

fn trap(symbol: &str) -> module::Error {
    module::Error::Trap(wasmtime::Error::msg(format!("mock trap in {}", symbol)))
}

#[async_trait::async_trait]
impl NativeModule for MockModule {
    async fn call_sret(&mut self, symbol: &str, args: &[Arg]) -> module::Result<ResponseTriple> {
        let mut guard = self.handle.state();
        let state = &mut *guard;
        state.calls.push((symbol.to_owned(), args.to_vec()));
        if state.traps.contains(symbol) {
            return Err(trap(symbol));
        }

        let response = state
            .queued
            .get_mut(symbol)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.fallback.get(symbol).cloned())
            .ok_or_else(|| module::Error::MissingExport(symbol.to_owned()))?;

        if state.outstanding.is_some() {
            state.leaks += 1;
        }
        let (status, bytes) = response.into_parts();
        let data = state.next_ptr;
        let len = bytes.len() as u32;
        state.next_ptr += len.max(1).next_multiple_of(8);
        state.outstanding = Some((data, bytes));
        Ok(ResponseTriple { status, data, len })
    }

    async fn call(&mut self, symbol: &str, args: &[Arg]) -> module::Result<Option<f64>> {
        let mut guard = self.handle.state();
        let state = &mut *guard;
        state.calls.push((symbol.to_owned(), args.to_vec()));
        if state.traps.contains(symbol) {
            return Err(trap(symbol));
        }

        if symbol == Abi::ClearResponse.symbol() {
            match state.outstanding.take() {
                Some(_) => state.releases += 1,
                None => state.double_releases += 1,
            }
            return Ok(None);
        }
        if symbol == Abi::Connect.symbol() && !state.numbers.contains_key(symbol) {
            let id = state.next_connection;
            state.next_connection += 1;
            return Ok(Some(id as f64));
        }
        Ok(state.numbers.get(symbol).copied())
    }

    async fn read(&mut self, ptr: u32, len: u32) -> module::Result<Vec<u8>> {
        let mut guard = self.handle.state();
        let state = &mut *guard;
        match &state.outstanding {
            Some((data, bytes)) if *data == ptr && len as usize <= bytes.len() => {
                Ok(bytes[..len as usize].to_vec())
            }
            _ => {
                state.stale_reads += 1;
                Err(module::Error::OutOfBounds { ptr, len })
            }
        }
    }
}

/// When a [`MockLoader`] fires the runtime-initialized notifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotifyMode {
    /// Before `instantiate` returns.
    Immediate,
    /// From a background task, some time after `instantiate` returned.
    After(Duration),
    /// Drops the notifier without firing it.
    Never,
}

/// Loader handing out [`MockModule`]s.
#[derive(Clone, Debug)]
pub struct MockLoader {
    handle: MockHandle,
    locator: Locator,
    delay: Option<Duration>,
    notify: Arc<Mutex<NotifyMode>>,
    instantiations: Arc<AtomicUsize>,
}

impl MockLoader {
    pub fn new(handle: MockHandle) -> Self {
        Self {
            handle,
            locator: Locator::new(ModuleSource::bytes(Vec::<u8>::new())),
            delay: None,
            notify: Arc::new(Mutex::new(NotifyMode::Immediate)),
            instantiations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Suspends every instantiation for `delay`, as a slow fetch would.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn notify(self, mode: NotifyMode) -> Self {
        self.set_notify(mode);
        self
    }

    /// Changes the notify mode of this loader and all its clones.
    pub fn set_notify(&self, mode: NotifyMode) {
        *self.notify.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ModuleLoader for MockLoader {
    fn locate_file(&self, path: &str, prefix: &str) -> loader::Result<ModuleSource> {
        self.locator.locate(path, prefix)
    }

    async fn instantiate(
        &self,
        _functions: RuntimeFunctionTable,
        overrides: ModuleOverrides,
    ) -> loader::Result<Box<dyn NativeModule>> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        overrides.stdio.print("mock module initialized");
        let mode = *self.notify.lock().unwrap_or_else(PoisonError::into_inner);
        match mode {
            NotifyMode::Immediate => overrides.on_runtime_initialized.notify(),
            NotifyMode::After(delay) => {
                let notifier = overrides.on_runtime_initialized;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    notifier.notify();
                });
            }
            NotifyMode::Never => drop(overrides.on_runtime_initialized),
        }
        Ok(Box::new(self.handle.module()))
    }
}
