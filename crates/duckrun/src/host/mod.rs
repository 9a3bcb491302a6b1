//! # Host functions implemented natively
//!
//! Built-in sets of host functions the engine module calls back into. Each set
//! lives in its own module and either links itself directly or contributes
//! entries to a [`crate::runtime::RuntimeFunctionTable`].

pub mod fs;
pub mod stdio;

pub use fs::FileSystem;
pub use stdio::Stdio;

#[derive(Debug)]
pub enum Error {
    Link(String),
    Wasmtime(wasmtime::Error),
    Io(std::io::Error),
    /// A path is absolute or escapes the file system root.
    Path(String),
    UnknownFile(u32),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Link(msg) => write!(f, "Linker error: {}", msg),
            Self::Wasmtime(e) => write!(f, "Wasmtime error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Path(path) => write!(f, "Path not allowed: {}", path),
            Self::UnknownFile(id) => write!(f, "File {} is not open", id),
        }
    }
}

impl std::error::Error for Error {}

impl From<wasmtime::Error> for Error {
    fn from(e: wasmtime::Error) -> Self {
        Self::Wasmtime(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
