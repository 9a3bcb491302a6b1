//! Integration tests driving a real wasm module through wasmtime.

use std::sync::Arc;
use std::sync::Mutex;

use duckrun::CsvTableOptions;
use duckrun::Engine;
use duckrun::EngineConfig;
use duckrun::EngineState;
use duckrun::Error;
use duckrun::FeatureFlags;
use duckrun::InProcessLoader;
use duckrun::JsonTableOptions;
use duckrun::Locator;
use duckrun::ModuleLoader;
use duckrun::ModuleSource;
use duckrun::WorkerLoader;
use duckrun::host::FileSystem;
use duckrun::host::Stdio;
use duckrun::loader;
use duckrun::tokens::TokenType;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The engine fixture, compiled from text by wasmtime.
fn fixture() -> ModuleSource {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/engine.wat");
    let bytes = std::fs::read(path).unwrap_or_else(|_| panic!("Could not read fixture: {}", path));
    ModuleSource::bytes(bytes)
}

fn config() -> EngineConfig {
    EngineConfig::new().wasi(false)
}

fn in_process() -> InProcessLoader {
    InProcessLoader::new(Locator::new(fixture()), config()).expect("Failed to create loader")
}

fn capture() -> (Stdio, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let out = lines.clone();
    let err = lines.clone();
    let stdio = Stdio::new(
        move |line| out.lock().unwrap().push(line.to_owned()),
        move |line| err.lock().unwrap().push(format!("stderr: {}", line)),
    );
    (stdio, lines)
}

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("duckrun-wat-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn test_open_routes_stdout() -> anyhow::Result<()> {
    init_tracing();
    let (stdio, lines) = capture();
    let engine = Engine::builder(in_process()).stdio(stdio).build();

    assert_eq!(engine.state(), EngineState::Uninitialized);
    engine.open().await?;
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(*lines.lock().unwrap(), vec!["engine ready"]);
    Ok(())
}

#[tokio::test]
async fn test_version_flags_and_tokens() -> anyhow::Result<()> {
    init_tracing();
    let engine = Engine::new(in_process());
    engine.open().await?;

    assert_eq!(engine.get_version().await?, "v1.1.0");

    let flags = engine.get_feature_flags().await?;
    assert_eq!(flags, engine.get_feature_flags().await?);
    assert_eq!(flags.bits(), 3);
    assert!(flags.contains(FeatureFlags::THREADS));

    let tokens = engine.tokenize("SELECT 1").await?;
    let kinds: Vec<_> = tokens.iter().map(|t| (t.offset, t.kind)).collect();
    assert_eq!(kinds, vec![(0, TokenType::Keyword), (7, TokenType::NumericConstant)]);

    engine.flush_files().await?;
    Ok(())
}

#[tokio::test]
async fn test_run_query_and_errors() -> anyhow::Result<()> {
    init_tracing();
    let engine = Engine::new(in_process());
    engine.open().await?;
    let conn = engine.connect().await?;

    assert_eq!(conn.run_query("SELECT 42").await?, b"SELECT 42");

    let err = conn.run_query("DROP TABLE t").await.unwrap_err();
    assert!(matches!(&err, Error::Protocol(_)));
    assert_eq!(err.to_string(), "syntax error");

    // The module traps on a second response without a release in between,
    // so further calls succeeding shows the error was released.
    assert_eq!(conn.run_query("SELECT 43").await?, b"SELECT 43");
    assert_eq!(engine.get_version().await?, "v1.1.0");
    Ok(())
}

#[tokio::test]
async fn test_streamed_query() -> anyhow::Result<()> {
    init_tracing();
    let engine = Engine::new(in_process());
    engine.open().await?;
    let conn = engine.connect().await?;

    for _ in 0..2 {
        let mut stream = conn.stream("SELECT * FROM t").await?;
        assert_eq!(stream.header(), b"schema");

        let mut chunks = 0;
        while let Some(chunk) = stream.next().await? {
            assert_eq!(chunk, b"CHUNK");
            chunks += 1;
        }
        assert_eq!(chunks, 3);
    }

    assert!(matches!(conn.fetch_query_results().await, Err(Error::NoActiveStream(_))));
    Ok(())
}

#[tokio::test]
async fn test_connections_and_disconnect() -> anyhow::Result<()> {
    init_tracing();
    let engine = Engine::new(in_process());
    engine.open().await?;

    let a = engine.connect().await?;
    let b = engine.connect().await?;
    assert_eq!(a.id().0, 1);
    assert_eq!(b.id().0, 2);
    assert_eq!(engine.connections(), 2);

    let id = a.id();
    a.disconnect().await?;
    assert!(matches!(engine.run_query(id, "SELECT 1").await, Err(Error::UnknownConnection(_))));
    assert_eq!(b.run_query("SELECT 2").await?, b"SELECT 2");
    Ok(())
}

#[tokio::test]
async fn test_import_through_file_system() -> anyhow::Result<()> {
    init_tracing();
    let root = scratch_dir("import");
    std::fs::write(root.join("people.csv"), "id,name\n1,duck\n")?;
    let fs = FileSystem::new(&root);

    let engine = Engine::builder(in_process()).functions(fs.functions()).build();
    engine.open().await?;
    let conn = engine.connect().await?;

    let options = CsvTableOptions::new("people").header(true);
    conn.import_csv_from_path("people.csv", &options).await?;

    let err = conn
        .import_csv_from_path("missing.csv", &options)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "file not found");

    conn.import_json_from_path("events.json", &JsonTableOptions::new("events"))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_unlinked_import_traps() -> anyhow::Result<()> {
    init_tracing();
    let engine = Engine::new(in_process());
    engine.open().await?;
    let conn = engine.connect().await?;

    let result = conn
        .import_csv_from_path("people.csv", &CsvTableOptions::new("people"))
        .await;
    assert!(matches!(result, Err(Error::Module(_))));
    Ok(())
}

#[tokio::test]
async fn test_worker_loader() -> anyhow::Result<()> {
    init_tracing();
    let (stdio, lines) = capture();
    let loader = WorkerLoader::in_process(
        Locator::new(fixture()),
        config().worker_thread_name("duckrun-wat-worker"),
    )?;
    assert_eq!(loader.thread_name(), "duckrun-wat-worker");
    let engine = Engine::builder(loader).stdio(stdio).build();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.open().await }));
    }
    for task in tasks {
        task.await??;
    }
    assert_eq!(*lines.lock().unwrap(), vec!["engine ready"]);

    let conn = engine.connect().await?;
    assert_eq!(conn.run_query("SELECT 'worker'").await?, b"SELECT 'worker'");
    assert_eq!(conn.run_query("VACUUM").await.unwrap_err().to_string(), "syntax error");

    let mut stream = conn.stream("SELECT 1").await?;
    let mut chunks = 0;
    while stream.next().await?.is_some() {
        chunks += 1;
    }
    assert_eq!(chunks, 3);
    Ok(())
}

#[tokio::test]
async fn test_missing_module_fails_open() {
    init_tracing();
    let loader = InProcessLoader::new(
        Locator::new(ModuleSource::path("does/not/exist.wasm")),
        config(),
    )
    .unwrap();
    let engine = Engine::new(loader);

    let err = engine.open().await.unwrap_err();
    assert!(matches!(err, Error::Loader(ref e) if matches!(**e, loader::Error::Fetch { .. })));
    assert_eq!(engine.state(), EngineState::Uninitialized);
}

#[tokio::test]
async fn test_memory_limit_rejects_module() {
    init_tracing();
    let loader = InProcessLoader::new(
        Locator::new(fixture()),
        config().max_memory_bytes(64 * 1024),
    )
    .unwrap();
    let engine = Engine::new(loader);

    assert!(matches!(
        engine.open().await,
        Err(Error::Loader(e)) if matches!(*e, loader::Error::Instantiate(_))
    ));
}

#[test]
fn test_locate_file() {
    let loader = in_process();
    assert!(matches!(loader.locate_file("duckdb.wasm", ""), Ok(ModuleSource::Bytes(_))));
    assert!(matches!(
        loader.locate_file("duckdb-browser.worker.js", ""),
        Err(loader::Error::MissingWorker)
    ));
    assert!(matches!(
        loader.locate_file("extension.duckdb_extension", "/ext/"),
        Err(loader::Error::UnexpectedFile { .. })
    ));
}
