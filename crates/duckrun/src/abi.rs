//! # ABI Surface
//!
//! Names of the functions exported by the engine module and the small value
//! types that travel with them. Symbol names, argument order and the
//! triple-returning convention must stay compatible with the module build.

use std::fmt;

/// Functions exported by the engine module.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Abi {
    Tokenize,
    FlushFiles,
    GetVersion,
    GetFeatureFlags,
    Connect,
    Disconnect,
    QueryRun,
    QuerySend,
    QueryFetchResults,
    ImportCsvTable,
    ImportJsonTable,
    /// Frees the buffers referenced by the most recent response triple.
    ClearResponse,
}

impl Abi {
    /// Returns the exported symbol name.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Tokenize => "duckdb_web_tokenize",
            Self::FlushFiles => "duckdb_web_flush_files",
            Self::GetVersion => "duckdb_web_get_version",
            Self::GetFeatureFlags => "duckdb_web_get_feature_flags",
            Self::Connect => "duckdb_web_connect",
            Self::Disconnect => "duckdb_web_disconnect",
            Self::QueryRun => "duckdb_web_query_run",
            Self::QuerySend => "duckdb_web_query_send",
            Self::QueryFetchResults => "duckdb_web_query_fetch_results",
            Self::ImportCsvTable => "duckdb_web_import_csv_table",
            Self::ImportJsonTable => "duckdb_web_import_json_table",
            Self::ClearResponse => "duckdb_web_clear_response",
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Status word of a response triple.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    /// The data region holds a UTF-8 diagnostic instead of a payload.
    Error,
}

impl StatusCode {
    /// Interprets the raw status word. Anything but zero is a failure.
    pub fn from_raw(raw: f64) -> Self {
        if raw == 0.0 { Self::Success } else { Self::Error }
    }
}

/// Capabilities compiled into the module. Fixed at module build time.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct FeatureFlags(u32);

impl FeatureFlags {
    pub const FAST_EXCEPTIONS: Self = Self(1 << 0);
    pub const THREADS: Self = Self(1 << 1);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Display for FeatureFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::FAST_EXCEPTIONS) {
            names.push("fast-exceptions");
        }
        if self.contains(Self::THREADS) {
            names.push("threads");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_zero_is_success() {
        assert_eq!(StatusCode::from_raw(0.0), StatusCode::Success);
        assert_eq!(StatusCode::from_raw(1.0), StatusCode::Error);
        assert_eq!(StatusCode::from_raw(255.0), StatusCode::Error);
    }

    #[test]
    fn feature_flags_bits() {
        let flags = FeatureFlags::from_bits(0b10);
        assert!(flags.contains(FeatureFlags::THREADS));
        assert!(!flags.contains(FeatureFlags::FAST_EXCEPTIONS));
        assert_eq!(flags.to_string(), "threads");
        assert_eq!(FeatureFlags::from_bits(3).to_string(), "fast-exceptions|threads");
        assert_eq!(FeatureFlags::default().to_string(), "none");
    }
}
