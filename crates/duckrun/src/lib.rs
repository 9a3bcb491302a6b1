pub mod abi;
pub mod config;
pub mod connection;
pub mod engine;
pub mod host;
pub mod loader;
pub mod marshal;
pub mod mock;
pub mod module;
pub mod options;
pub mod runtime;
pub mod tokens;
pub mod wasm;

pub use abi::FeatureFlags;
pub use config::EngineConfig;
pub use connection::Connection;
pub use connection::ConnectionId;
pub use connection::QueryStream;
pub use engine::Engine;
pub use engine::EngineBuilder;
pub use engine::EngineState;
pub use engine::Error;
pub use engine::Result;
pub use loader::InProcessLoader;
pub use loader::Locator;
pub use loader::ModuleLoader;
pub use loader::ModuleSource;
pub use loader::WorkerLoader;
pub use options::CsvTableOptions;
pub use options::JsonTableOptions;
pub use runtime::RuntimeFunctionTable;
pub use tokens::ScriptTokens;
