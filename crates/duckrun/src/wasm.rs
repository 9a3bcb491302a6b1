//! # Wasmtime Module
//!
//! [`NativeModule`] over a wasmtime store and instance. Strings are copied into
//! guest memory through the exported allocator and freed after the call; the
//! hidden return slot of triple calls is allocated the same way.

use wasmtime::Func;
use wasmtime::Instance;
use wasmtime::Memory;
use wasmtime::Store;
use wasmtime::TypedFunc;
use wasmtime::Val;
use wasmtime::ValType;

use crate::module::Arg;
use crate::module::Error;
use crate::module::NativeModule;
use crate::module::ResponseTriple;
use crate::module::Result;
use crate::runtime::HostCtx;

/// Exports run once after instantiation, in order of preference.
const INITIALIZERS: [&str; 2] = ["_initialize", "__wasm_call_ctors"];

/// A live engine module hosted by wasmtime.
pub struct WasmModule {
    store: Store<HostCtx>,
    instance: Instance,
    memory: Memory,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
}

impl WasmModule {
    /// Resolves the exports every call depends on.
    pub fn new(mut store: Store<HostCtx>, instance: Instance) -> Result<Self> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::MissingExport("memory".into()))?;
        let malloc = instance
            .get_typed_func::<i32, i32>(&mut store, "malloc")
            .map_err(|e| Error::Signature { symbol: "malloc".into(), details: e.to_string() })?;
        let free = instance
            .get_typed_func::<i32, ()>(&mut store, "free")
            .map_err(|e| Error::Signature { symbol: "free".into(), details: e.to_string() })?;

        Ok(Self { store, instance, memory, malloc, free })
    }

    /// Runs the module's runtime initializer, if it exports one.
    pub async fn initialize(&mut self) -> Result<()> {
        for symbol in INITIALIZERS {
            if let Some(func) = self.instance.get_func(&mut self.store, symbol) {
                func.call_async(&mut self.store, &[], &mut []).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn func(&mut self, symbol: &str) -> Result<Func> {
        self.instance
            .get_func(&mut self.store, symbol)
            .ok_or_else(|| Error::MissingExport(symbol.into()))
    }

    async fn alloc(&mut self, size: u32) -> Result<u32> {
        let ptr = self.malloc.call_async(&mut self.store, size as i32).await? as u32;
        if ptr == 0 {
            return Err(Error::Trap(wasmtime::Error::msg(format!(
                "malloc({}) returned null",
                size
            ))));
        }
        Ok(ptr)
    }

    async fn dealloc(&mut self, ptr: u32) -> Result<()> {
        self.free.call_async(&mut self.store, ptr as i32).await?;
        Ok(())
    }

    async fn alloc_str(&mut self, s: &str) -> Result<u32> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        let ptr = self.alloc(bytes.len() as u32).await?;
        self.memory
            .write(&mut self.store, ptr as usize, &bytes)
            .map_err(|_| Error::OutOfBounds { ptr, len: bytes.len() as u32 })?;
        Ok(ptr)
    }

    /// Encodes `args` against `params`. Allocations are pushed to `scratch`
    /// as they happen so the caller can free them on every path.
    async fn encode(
        &mut self,
        symbol: &str,
        params: &[ValType],
        args: &[Arg],
        scratch: &mut Vec<u32>,
        vals: &mut Vec<Val>,
    ) -> Result<()> {
        for (arg, ty) in args.iter().zip(params) {
            let val = match arg {
                Arg::Number(n) => number_to_val(symbol, *n, ty)?,
                Arg::String(s) => {
                    let ptr = self.alloc_str(s).await?;
                    scratch.push(ptr);
                    Val::I32(ptr as i32)
                }
            };
            vals.push(val);
        }
        Ok(())
    }

    /// Calls `symbol`, optionally passing a return-slot pointer first.
    async fn invoke(&mut self, symbol: &str, slot: Option<u32>, args: &[Arg]) -> Result<Vec<Val>> {
        let func = self.func(symbol)?;
        let ty = func.ty(&self.store);
        let params: Vec<ValType> = ty.params().collect();
        let leading = usize::from(slot.is_some());

        if params.len() != args.len() + leading {
            return Err(Error::Signature {
                symbol: symbol.into(),
                details: format!("expected {} parameters, got {}", params.len(), args.len() + leading),
            });
        }

        let mut vals = Vec::with_capacity(params.len());
        if let Some(ptr) = slot {
            vals.push(Val::I32(ptr as i32));
        }

        let mut scratch = Vec::new();
        let encoded = self
            .encode(symbol, &params[leading..], args, &mut scratch, &mut vals)
            .await;

        let mut results = vec![Val::I32(0); ty.results().len()];
        let called = match encoded {
            Ok(()) => func
                .call_async(&mut self.store, &vals, &mut results)
                .await
                .map_err(Error::Trap),
            Err(e) => Err(e),
        };

        for ptr in scratch {
            self.dealloc(ptr).await?;
        }
        called?;
        Ok(results)
    }

    fn read_words(&self, slot: u32) -> Result<[f64; 3]> {
        let mut raw = [0u8; ResponseTriple::SLOT_SIZE as usize];
        self.memory
            .read(&self.store, slot as usize, &mut raw)
            .map_err(|_| Error::OutOfBounds { ptr: slot, len: ResponseTriple::SLOT_SIZE })?;

        let mut words = [0f64; 3];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = f64::from_le_bytes(bytes);
        }
        Ok(words)
    }
}

#[async_trait::async_trait]
impl NativeModule for WasmModule {
    async fn call_sret(&mut self, symbol: &str, args: &[Arg]) -> Result<ResponseTriple> {
        let slot = self.alloc(ResponseTriple::SLOT_SIZE).await?;
        let words = match self.invoke(symbol, Some(slot), args).await {
            Ok(_) => self.read_words(slot),
            Err(e) => Err(e),
        };
        self.dealloc(slot).await?;
        Ok(ResponseTriple::from_words(words?))
    }

    async fn call(&mut self, symbol: &str, args: &[Arg]) -> Result<Option<f64>> {
        let results = self.invoke(symbol, None, args).await?;
        match results.first() {
            None => Ok(None),
            Some(val) => val_to_number(symbol, val).map(Some),
        }
    }

    async fn read(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len as usize];
        self.memory
            .read(&self.store, ptr as usize, &mut buf)
            .map_err(|_| Error::OutOfBounds { ptr, len })?;
        Ok(buf)
    }
}

fn number_to_val(symbol: &str, n: f64, ty: &ValType) -> Result<Val> {
    match ty {
        ValType::I32 => Ok(Val::I32(n as i64 as i32)),
        ValType::I64 => Ok(Val::I64(n as i64)),
        ValType::F32 => Ok(Val::F32((n as f32).to_bits())),
        ValType::F64 => Ok(Val::F64(n.to_bits())),
        other => Err(Error::Signature {
            symbol: symbol.into(),
            details: format!("cannot pass a number as {:?}", other),
        }),
    }
}

/// i32 results are addresses or ids, so they are read as unsigned.
fn val_to_number(symbol: &str, val: &Val) -> Result<f64> {
    match val {
        Val::I32(v) => Ok(*v as u32 as f64),
        Val::I64(v) => Ok(*v as f64),
        Val::F32(bits) => Ok(f32::from_bits(*bits) as f64),
        Val::F64(bits) => Ok(f64::from_bits(*bits)),
        _ => Err(Error::Signature {
            symbol: symbol.into(),
            details: "result is not numeric".into(),
        }),
    }
}
