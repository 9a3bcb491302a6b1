//! File locator for the module and its auxiliary resources.

use crate::loader::Error;
use crate::loader::ModuleSource;
use crate::loader::Result;

/// File name the loaders request the main module under.
pub const MAIN_MODULE_FILE: &str = "duckdb.wasm";
/// Suffix of the main module file.
pub const MAIN_MODULE_SUFFIX: &str = ".wasm";
/// Suffix of the pthread worker script.
pub const WORKER_SUFFIX: &str = ".worker.js";

/// Resolves requested files to configured resources.
#[derive(Clone, Debug)]
pub struct Locator {
    main_module: ModuleSource,
    pthread_worker: Option<ModuleSource>,
}

impl Locator {
    pub fn new(main_module: ModuleSource) -> Self {
        Self {
            main_module,
            pthread_worker: None,
        }
    }

    pub fn with_worker(mut self, worker: ModuleSource) -> Self {
        self.pthread_worker = Some(worker);
        self
    }

    pub fn main_module(&self) -> &ModuleSource {
        &self.main_module
    }

    pub fn locate(&self, path: &str, prefix: &str) -> Result<ModuleSource> {
        if path.ends_with(WORKER_SUFFIX) {
            return self.pthread_worker.clone().ok_or(Error::MissingWorker);
        }
        if path.ends_with(MAIN_MODULE_SUFFIX) {
            return Ok(self.main_module.clone());
        }
        Err(Error::UnexpectedFile {
            prefix: prefix.to_owned(),
            path: path.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_by_suffix() {
        let locator = Locator::new(ModuleSource::path("engine.wasm"));
        assert!(matches!(
            locator.locate("duckdb-eh.wasm", ""),
            Ok(ModuleSource::Path(p)) if p.ends_with("engine.wasm")
        ));
        assert!(matches!(locator.locate("duckdb.worker.js", ""), Err(Error::MissingWorker)));

        let err = locator.locate("data.bin", "/static/").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Instantiation requested unexpected file: prefix=/static/ path=data.bin"
        );
    }

    #[test]
    fn worker_when_configured() {
        let locator = Locator::new(ModuleSource::bytes(vec![0u8]))
            .with_worker(ModuleSource::path("pthread.worker.js"));
        assert!(matches!(
            locator.locate("duckdb.worker.js", ""),
            Ok(ModuleSource::Path(p)) if p.ends_with("pthread.worker.js")
        ));
    }
}
