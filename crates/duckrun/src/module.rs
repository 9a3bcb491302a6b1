//! # Native Module Interface
//!
//! The raw calling surface of one live engine module. Implementations only move
//! values across the sandbox boundary; interpreting responses and releasing
//! their buffers is the job of [`crate::marshal`].

use crate::abi::StatusCode;

#[derive(Debug)]
pub enum Error {
    /// The module does not export the requested symbol.
    MissingExport(String),
    /// The export exists but its signature does not fit the call.
    Signature { symbol: String, details: String },
    /// The guest trapped while executing.
    Trap(wasmtime::Error),
    /// A pointer/length pair does not lie inside linear memory.
    OutOfBounds { ptr: u32, len: u32 },
    /// The thread hosting the module has gone away.
    WorkerClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingExport(symbol) => write!(f, "Module does not export '{}'", symbol),
            Self::Signature { symbol, details } => {
                write!(f, "Signature mismatch for '{}': {}", symbol, details)
            }
            Self::Trap(e) => write!(f, "Module trapped: {}", e),
            Self::OutOfBounds { ptr, len } => {
                write!(f, "Memory access out of bounds: ptr={} len={}", ptr, len)
            }
            Self::WorkerClosed => write!(f, "Module worker closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<wasmtime::Error> for Error {
    fn from(e: wasmtime::Error) -> Self {
        Self::Trap(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single call argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Copied into guest memory as a NUL terminated UTF-8 string.
    String(String),
    /// Converted to whatever value type the export declares.
    Number(f64),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Arg {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<u32> for Arg {
    fn from(n: u32) -> Self {
        Self::Number(n as f64)
    }
}

/// `(status, pointer, length)` as written by a triple-returning export.
///
/// `data` points into module-owned linear memory and stays valid until the
/// matching release. It is not reference counted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResponseTriple {
    pub status: StatusCode,
    pub data: u32,
    pub len: u32,
}

impl ResponseTriple {
    /// Size of the return slot: three little-endian f64 words.
    pub const SLOT_SIZE: u32 = 3 * 8;

    /// Decodes the raw words of a return slot.
    pub fn from_words([status, data, len]: [f64; 3]) -> Self {
        Self {
            status: StatusCode::from_raw(status),
            data: data as u32,
            len: len as u32,
        }
    }
}

/// Raw ABI surface of a live module instance.
///
/// Callers hold exclusive access for the duration of a call sequence, so
/// implementations never see interleaved calls.
#[async_trait::async_trait]
pub trait NativeModule: Send + 'static {
    /// Invokes an export that reports through a hidden return-slot pointer
    /// passed as its first argument.
    async fn call_sret(&mut self, symbol: &str, args: &[Arg]) -> Result<ResponseTriple>;

    /// Invokes an export and returns its scalar result, if it has one.
    async fn call(&mut self, symbol: &str, args: &[Arg]) -> Result<Option<f64>>;

    /// Copies `len` bytes at `ptr` out of linear memory.
    async fn read(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_from_words() {
        let triple = ResponseTriple::from_words([0.0, 4096.0, 12.0]);
        assert_eq!(triple.status, StatusCode::Success);
        assert_eq!(triple.data, 4096);
        assert_eq!(triple.len, 12);

        let failed = ResponseTriple::from_words([1.0, 8.0, 3.0]);
        assert_eq!(failed.status, StatusCode::Error);
    }
}
