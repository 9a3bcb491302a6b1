//! # Runtime Function Table
//!
//! Host functions the module imports (file I/O, stdio, platform probes). The
//! table is handed to the loader by value at instantiation time and bound into
//! that module's linker only; nothing is registered process-wide. Once bound it
//! is never mutated.

use std::collections::BTreeMap;
use std::sync::Arc;

use wasmtime::Caller;
use wasmtime::Extern;
use wasmtime::FuncType;
use wasmtime::Linker;
use wasmtime::Memory;
use wasmtime::StoreLimits;
use wasmtime::StoreLimitsBuilder;
use wasmtime::Val;
use wasmtime::ValType;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::config::EngineConfig;

/// Store data of a module instance.
pub struct HostCtx {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
}

impl HostCtx {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            wasi: WasiCtxBuilder::new().build_p1(),
            limits: StoreLimitsBuilder::new()
                .memory_size(config.max_memory_bytes)
                .build(),
        }
    }
}

/// Signature-erased host function body.
pub type HostFn =
    Arc<dyn Fn(Caller<'_, HostCtx>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync>;

/// A host function together with the wasm signature it is imported under.
#[derive(Clone)]
pub struct HostFunction {
    params: Vec<ValType>,
    results: Vec<ValType>,
    func: HostFn,
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// Mapping from import `(namespace, name)` to host implementation.
#[derive(Clone, Debug, Default)]
pub struct RuntimeFunctionTable {
    functions: BTreeMap<(String, String), HostFunction>,
}

impl RuntimeFunctionTable {
    /// Namespace the engine module imports its runtime from.
    pub const DEFAULT_NAMESPACE: &'static str = "env";

    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `name` in the default namespace, replacing any earlier entry.
    pub fn define<F>(
        &mut self,
        name: &str,
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
        func: F,
    ) -> &mut Self
    where
        F: Fn(Caller<'_, HostCtx>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync + 'static,
    {
        self.define_in(Self::DEFAULT_NAMESPACE, name, params, results, func)
    }

    /// Defines `name` in an explicit import namespace.
    pub fn define_in<F>(
        &mut self,
        namespace: &str,
        name: &str,
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
        func: F,
    ) -> &mut Self
    where
        F: Fn(Caller<'_, HostCtx>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync + 'static,
    {
        self.functions.insert(
            (namespace.to_owned(), name.to_owned()),
            HostFunction {
                params: params.into_iter().collect(),
                results: results.into_iter().collect(),
                func: Arc::new(func),
            },
        );
        self
    }

    /// Moves every entry of `other` into this table. Entries of `other` win.
    pub fn merge(&mut self, other: RuntimeFunctionTable) -> &mut Self {
        self.functions.extend(other.functions);
        self
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.functions
            .contains_key(&(namespace.to_owned(), name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Iterates `(namespace, name)` pairs in sorted order.
    pub fn names(&self) -> impl Iterator<Item = (&str, &str)> {
        self.functions
            .keys()
            .map(|(namespace, name)| (namespace.as_str(), name.as_str()))
    }

    /// Binds every entry into the linker.
    pub(crate) fn link(&self, linker: &mut Linker<HostCtx>) -> wasmtime::Result<()> {
        for ((namespace, name), function) in &self.functions {
            let ty = FuncType::new(
                linker.engine(),
                function.params.iter().cloned(),
                function.results.iter().cloned(),
            );
            let func = function.func.clone();
            linker.func_new(namespace, name, ty, move |caller, params, results| {
                func(caller, params, results)
            })?;
        }
        Ok(())
    }
}

/// Looks up the exported linear memory from inside a host function.
pub(crate) fn guest_memory(caller: &mut Caller<'_, HostCtx>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("module does not export 'memory'"))
}

/// Copies a guest region into a host buffer.
pub(crate) fn read_guest(
    caller: &mut Caller<'_, HostCtx>,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let mut buf = vec![0u8; len as usize];
    memory.read(&*caller, ptr as usize, &mut buf)?;
    Ok(buf)
}

/// Copies a host buffer into guest memory.
pub(crate) fn write_guest(
    caller: &mut Caller<'_, HostCtx>,
    ptr: u32,
    bytes: &[u8],
) -> wasmtime::Result<()> {
    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, ptr as usize, bytes)?;
    Ok(())
}

pub(crate) fn param_i32(params: &[Val], index: usize) -> wasmtime::Result<i32> {
    params
        .get(index)
        .and_then(Val::i32)
        .ok_or_else(|| wasmtime::Error::msg(format!("expected i32 argument at {}", index)))
}

pub(crate) fn param_f64(params: &[Val], index: usize) -> wasmtime::Result<f64> {
    params
        .get(index)
        .and_then(Val::f64)
        .ok_or_else(|| wasmtime::Error::msg(format!("expected f64 argument at {}", index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_replaces_and_merges() {
        let mut table = RuntimeFunctionTable::new();
        table.define("probe", [ValType::I32], [ValType::I32], |_, _, results| {
            results[0] = Val::I32(1);
            Ok(())
        });
        table.define("probe", [], [], |_, _, _| Ok(()));
        assert_eq!(table.len(), 1);

        let mut other = RuntimeFunctionTable::new();
        other.define_in("wasi_snapshot_preview1", "sched_yield", [], [ValType::I32], |_, _, results| {
            results[0] = Val::I32(0);
            Ok(())
        });
        table.merge(other);

        let names: Vec<_> = table.names().collect();
        assert_eq!(names, vec![("env", "probe"), ("wasi_snapshot_preview1", "sched_yield")]);
        assert!(table.contains("env", "probe"));
        assert!(!table.contains("env", "missing"));
    }
}
