//! Directory-backed adapter.
//!
//! Parsed file contents are cached per path together with the modification
//! time they were read at. A background poller, started when the
//! configuration sets `polling-interval`, re-reads any matching file whose
//! modification time moved past the cached copy; query paths apply the same
//! check, so a changed file is never served stale.

mod loaders;
mod query;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use apex_data_core::{
    ConnectionStatus, DataSourceConfiguration, DataSourceError, DataSourceMetrics, DataSourceType,
    FileFormatConfig, Params, Record, Result, Value,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use self::loaders::FileFormat;
use self::query::{glob_regex, path_expression, select, FileQuery};
use super::{data_cache_key, AdapterCore};
use crate::resilience::TtlCache;
use crate::traits::ExternalDataSource;
use crate::worker::{BackgroundRunnable, BackgroundWorker, WorkerSchedule};

const POLLER_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ParsedFile {
    modified: SystemTime,
    loaded_at: Instant,
    records: Arc<Vec<Record>>,
}

/// Shared between the adapter and its poller.
struct FileStore {
    source: String,
    base_path: PathBuf,
    pattern: Option<Regex>,
    format: FileFormatConfig,
    ttl: Option<Duration>,
    files: DashMap<PathBuf, ParsedFile>,
    metrics: Arc<DataSourceMetrics>,
}

impl FileStore {
    /// Regular files directly under the base path whose names match `pattern`.
    async fn list(&self, pattern: &Regex) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        let mut matches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| pattern.is_match(n)) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                matches.push((entry.path(), meta.modified()?));
            }
        }
        matches.sort();
        Ok(matches)
    }

    async fn matching(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        let Some(pattern) = &self.pattern else {
            return Ok(Vec::new());
        };
        self.list(pattern).await.map_err(|e| io_error(&e, &self.base_path))
    }

    /// Most recently modified file matching the configured pattern.
    async fn latest(&self) -> Result<Option<(PathBuf, SystemTime)>> {
        Ok(self
            .matching()
            .await?
            .into_iter()
            .max_by_key(|(_, modified)| *modified))
    }

    fn is_fresh(&self, cached: &ParsedFile, modified: SystemTime) -> bool {
        cached.modified >= modified && self.ttl.is_none_or(|ttl| cached.loaded_at.elapsed() < ttl)
    }

    /// Records of `path`, parsed again only when the file changed or the
    /// cached copy outlived its TTL.
    async fn records(&self, path: &Path, modified: SystemTime) -> Result<Arc<Vec<Record>>> {
        if let Some(cached) = self.files.get(path) {
            if self.is_fresh(&cached, modified) {
                self.metrics.record_cache_hit();
                return Ok(Arc::clone(&cached.records));
            }
        }
        self.metrics.record_cache_miss();
        self.load(path, modified).await
    }

    async fn load(&self, path: &Path, modified: SystemTime) -> Result<Arc<Vec<Record>>> {
        let format = FileFormat::for_path(path, &self.format)?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error(&e, path))?;
        self.metrics.record_bytes_read(text.len() as u64);
        let records = Arc::new(loaders::parse(&text, format, &self.format)?);
        self.files.insert(
            path.to_path_buf(),
            ParsedFile {
                modified,
                loaded_at: Instant::now(),
                records: Arc::clone(&records),
            },
        );
        tracing::debug!(source = %self.source, path = %path.display(), rows = records.len(), "loaded file");
        Ok(records)
    }

    /// Re-reads every matching file that changed since it was cached. Returns
    /// the number of files reloaded; per-file failures are logged.
    async fn scan(&self) -> usize {
        let files = match self.matching().await {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(source = %self.source, error = %err, "file scan failed");
                return 0;
            }
        };
        let mut reloaded = 0;
        for (path, modified) in files {
            let stale = self
                .files
                .get(&path)
                .is_none_or(|cached| cached.modified < modified);
            if !stale {
                continue;
            }
            match self.load(&path, modified).await {
                Ok(_) => reloaded += 1,
                Err(err) => {
                    tracing::warn!(source = %self.source, path = %path.display(), error = %err, "failed to load file");
                }
            }
        }
        reloaded
    }
}

fn io_error(err: &std::io::Error, path: &Path) -> DataSourceError {
    let message = format!("File access failed for {}: {err}", path.display());
    match err.kind() {
        std::io::ErrorKind::NotFound => DataSourceError::not_found(message),
        _ => DataSourceError::execution(message),
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Scans on every tick; a submitted request scans immediately and reports
/// how many files were reloaded.
struct FilePoller {
    store: Arc<FileStore>,
}

#[async_trait]
impl BackgroundRunnable for FilePoller {
    type Task = oneshot::Sender<usize>;

    async fn run(&mut self, reply: Self::Task) {
        let reloaded = self.store.scan().await;
        let _ = reply.send(reloaded);
    }

    async fn on_tick(&mut self) {
        let reloaded = self.store.scan().await;
        if reloaded > 0 {
            tracing::debug!(source = %self.store.source, reloaded, "poll picked up changed files");
        }
    }
}

// ---------------------------------------------------------------------------
// FileSystemDataSource
// ---------------------------------------------------------------------------

pub struct FileSystemDataSource {
    core: AdapterCore,
    store: RwLock<Option<Arc<FileStore>>>,
    lookups: RwLock<Option<Arc<TtlCache<Value>>>>,
    poller: Mutex<Option<BackgroundWorker<FilePoller>>>,
}

impl FileSystemDataSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: AdapterCore::new(),
            store: RwLock::new(None),
            lookups: RwLock::new(None),
            poller: Mutex::new(None),
        }
    }

    fn store(&self, operation: &str) -> Result<Arc<FileStore>> {
        self.core.ensure_operational(operation)?;
        self.store.read().clone().ok_or_else(|| {
            DataSourceError::connection("File store not initialized")
                .in_context(&self.core.name(), operation)
        })
    }

    /// Runs one poll cycle now. Returns the number of files reloaded, or
    /// `None` when no poller is running.
    pub async fn poll_now(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        {
            let poller = self.poller.lock().await;
            poller.as_ref()?.submit(tx).await.ok()?;
        }
        rx.await.ok()
    }

    fn open_store(config: &DataSourceConfiguration, metrics: Arc<DataSourceMetrics>) -> Result<FileStore> {
        let connection = config.connection.clone().unwrap_or_default();
        let Some(base) = connection.base_path.as_deref().filter(|b| !b.trim().is_empty()) else {
            return Err(DataSourceError::configuration(
                "Base path is required for file system data sources",
            ));
        };
        let base_path = PathBuf::from(base);
        if !base_path.exists() {
            return Err(DataSourceError::configuration(format!(
                "Base path does not exist: {}",
                base_path.display()
            )));
        }
        if !base_path.is_dir() {
            return Err(DataSourceError::configuration(format!(
                "Base path is not a directory: {}",
                base_path.display()
            )));
        }
        let pattern = connection
            .file_pattern
            .as_deref()
            .map(glob_regex)
            .transpose()?;
        Ok(FileStore {
            source: config.name.clone(),
            base_path,
            pattern,
            format: config.file_format.clone().unwrap_or_default(),
            ttl: config
                .cache
                .as_ref()
                .filter(|c| c.enabled)
                .map(apex_data_core::CacheConfig::ttl),
            files: DashMap::new(),
            metrics,
        })
    }

    async fn stop_poller(&self) {
        let running = self.poller.lock().await.take();
        if let Some(mut poller) = running {
            if !poller.stop(POLLER_GRACE).await {
                tracing::warn!(source = %self.core.name(), "file poller aborted after grace period");
            }
        }
    }

    async fn latest_records(&self, store: &FileStore, kind: &str) -> Result<Vec<Record>> {
        if store.pattern.is_none() {
            return Err(DataSourceError::configuration(format!(
                "File pattern is required for {kind} queries"
            )));
        }
        match store.latest().await? {
            Some((path, modified)) => Ok(store.records(&path, modified).await?.to_vec()),
            None => Ok(Vec::new()),
        }
    }

    async fn run_query(&self, store: &FileStore, query: &str, params: &Params) -> Result<Vec<Record>> {
        match FileQuery::parse(query, params) {
            FileQuery::PathExpression(expression) => {
                let records = self.latest_records(store, "path expression").await?;
                Ok(path_expression(&records, &expression))
            }
            FileQuery::Select(sql) => {
                let records = self.latest_records(store, "select").await?;
                Ok(select(&records, &sql, params))
            }
            FileQuery::Glob(pattern) => {
                let pattern = glob_regex(&pattern)?;
                let files = store
                    .list(&pattern)
                    .await
                    .map_err(|e| io_error(&e, &store.base_path))?;
                let mut rows = Vec::new();
                for (path, modified) in files {
                    rows.extend(store.records(&path, modified).await?.iter().cloned());
                }
                Ok(rows)
            }
        }
    }
}

impl Default for FileSystemDataSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Row whose key column equals `key`, falling back to the first row.
fn find_by_key(records: &[Record], key_column: Option<&str>, key: &Value) -> Option<Record> {
    key_column
        .and_then(|column| {
            records.iter().find(|r| {
                r.get(column)
                    .is_some_and(|v| v == key || v.matches_text(&key.to_plain_string()))
            })
        })
        .or_else(|| records.first())
        .cloned()
}

#[async_trait]
impl ExternalDataSource for FileSystemDataSource {
    fn configuration(&self) -> Arc<DataSourceConfiguration> {
        self.core.config()
    }

    fn source_type(&self) -> DataSourceType {
        DataSourceType::FileSystem
    }

    fn metrics(&self) -> Arc<DataSourceMetrics> {
        self.core.metrics()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.core.status()
    }

    async fn initialize(&self, config: &DataSourceConfiguration) -> Result<()> {
        self.core.set_config(config);
        self.core.begin_connect();
        self.stop_poller().await;

        let store = match Self::open_store(config, self.core.metrics()) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                let err = err.in_context(&config.name, "initialize");
                self.core.connect_failed(&err);
                return Err(err);
            }
        };
        let loaded = store.scan().await;
        if config.cache_enabled() {
            if let Some(cache) = &config.cache {
                *self.lookups.write() = Some(Arc::new(TtlCache::new(cache, Some(self.core.metrics()))));
            }
        }

        let interval = config
            .connection
            .as_ref()
            .and_then(|c| c.polling_interval)
            .filter(|secs| *secs > 0);
        if let Some(secs) = interval {
            let worker = BackgroundWorker::start(
                format!("file-poller-{}", config.name),
                FilePoller {
                    store: Arc::clone(&store),
                },
                WorkerSchedule::every(Duration::from_secs(secs)),
            );
            *self.poller.lock().await = Some(worker);
        }
        *self.store.write() = Some(store);

        self.core.connect_succeeded("File system data source initialized");
        tracing::info!(source = %config.name, files = loaded, polling_secs = ?interval, "file system data source initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.core.set_status(ConnectionStatus::shutting_down());
        self.stop_poller().await;
        if let Some(store) = self.store.write().take() {
            store.files.clear();
        }
        if let Some(cache) = self.lookups.write().take() {
            cache.clear();
        }
        self.core.set_status(ConnectionStatus::shutdown());
        tracing::debug!(source = %self.core.name(), "file system data source shut down");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.core.status().is_operational() && self.test_connection().await
    }

    async fn test_connection(&self) -> bool {
        let Some(store) = self.store.read().clone() else {
            return false;
        };
        tokio::fs::metadata(&store.base_path)
            .await
            .is_ok_and(|meta| meta.is_dir())
    }

    async fn get_data(&self, data_type: &str, params: &[Value]) -> Result<Option<Value>> {
        let store = self.store("get_data")?;
        let key = data_cache_key(data_type, params);
        let lookups = self.lookups.read().clone();
        if let Some(cached) = lookups.as_ref().and_then(|c| c.get(&key)) {
            return Ok(Some(cached));
        }

        let key_column = store.format.key_column.clone();
        let value = self
            .core
            .timed("get_data", async {
                let Some((path, modified)) = store.latest().await? else {
                    return Ok(None);
                };
                let records = store.records(&path, modified).await?;
                Ok::<_, DataSourceError>(match params.first() {
                    None => Some(Value::Array(records.iter().cloned().map(Value::Map).collect())),
                    Some(param) => {
                        find_by_key(&records, key_column.as_deref(), param).map(Value::Map)
                    }
                })
            })
            .await?;
        if let (Some(cache), Some(value)) = (&lookups, &value) {
            cache.put(key, value.clone());
        }
        Ok(value)
    }

    async fn query(&self, query: &str, params: &Params) -> Result<Vec<Record>> {
        let store = self.store("query")?;
        let config = self.core.config();
        let resolved = config.queries.get(query).map_or(query, String::as_str);
        let rows = self
            .core
            .timed("query", self.run_query(&store, resolved, params))
            .await?;
        self.core.metrics().record_records_processed(rows.len() as u64);
        Ok(rows)
    }

    async fn batch_update(&self, _statements: &[String]) -> Result<Vec<u64>> {
        Err(DataSourceError::execution(
            "Batch updates not supported for file system data source",
        )
        .with_retryable(false)
        .in_context(&self.core.name(), "batch_update"))
    }

    async fn refresh(&self) -> Result<()> {
        let store = self.store("refresh")?;
        store.files.clear();
        if let Some(cache) = self.lookups.read().clone() {
            cache.clear();
        }
        let reloaded = store.scan().await;
        tracing::info!(source = %self.core.name(), reloaded, "file system data source refreshed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use apex_data_core::{CacheConfig, ConnectionConfig, ErrorKind};

    use super::*;

    fn config(dir: &Path, pattern: &str, polling: Option<u64>) -> DataSourceConfiguration {
        DataSourceConfiguration {
            connection: Some(ConnectionConfig {
                base_path: Some(dir.display().to_string()),
                file_pattern: Some(pattern.into()),
                polling_interval: polling,
                ..ConnectionConfig::default()
            }),
            file_format: Some(FileFormatConfig {
                key_column: Some("code".into()),
                ..FileFormatConfig::default()
            }),
            queries: BTreeMap::from([(
                "by-code".to_string(),
                "SELECT * WHERE code = :code".to_string(),
            )]),
            ..DataSourceConfiguration::new("files", DataSourceType::FileSystem)
        }
    }

    fn write_at(path: &Path, contents: &str, offset_secs: u64) {
        fs::write(path, contents).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(offset_secs))
            .unwrap();
    }

    #[tokio::test]
    async fn missing_base_path_is_a_configuration_error() {
        let ds = FileSystemDataSource::new();
        let mut cfg = config(Path::new("/definitely/not/here"), "*.csv", None);
        let err = ds.initialize(&cfg).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_retryable());
        assert!(err.message().contains("Base path does not exist"));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.csv");
        fs::write(&file, "a\n1\n").unwrap();
        cfg.connection.as_mut().unwrap().base_path = Some(file.display().to_string());
        let err = ds.initialize(&cfg).await.unwrap_err();
        assert!(err.message().contains("not a directory"));
    }

    #[tokio::test]
    async fn query_shapes_against_latest_file() {
        let dir = tempfile::tempdir().unwrap();
        write_at(&dir.path().join("old.csv"), "code,qty\nX,1\n", 0);
        write_at(&dir.path().join("new.csv"), "code,qty\nA,10\nB,20\n", 5);

        let ds = FileSystemDataSource::new();
        ds.initialize(&config(dir.path(), "*.csv", None)).await.unwrap();

        let all = ds.query("$[*]", &Params::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = ds.query("$[?(@.code == 'B')]", &Params::new()).await.unwrap();
        assert_eq!(filtered[0]["qty"], Value::Int(20));

        let mut params = Params::new();
        params.insert("code".into(), Value::from("A"));
        let named = ds.query("by-code", &params).await.unwrap();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0]["qty"], Value::Int(10));

        // Globs read every matching file.
        assert_eq!(ds.query("*.csv", &Params::new()).await.unwrap().len(), 3);
        assert!(ds.query("$..deep", &Params::new()).await.unwrap().is_empty());
        ds.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn get_data_by_key_column() {
        let dir = tempfile::tempdir().unwrap();
        write_at(&dir.path().join("codes.json"), r#"[{"code": "A", "v": 1}, {"code": "B", "v": 2}]"#, 0);

        let mut cfg = config(dir.path(), "*.json", None);
        cfg.cache = Some(CacheConfig::default());
        let ds = FileSystemDataSource::new();
        ds.initialize(&cfg).await.unwrap();

        let b = ds.get_data("codes", &[Value::from("B")]).await.unwrap().unwrap();
        assert_eq!(b.as_map().unwrap()["v"], Value::Int(2));
        let all = ds.get_data("codes", &[]).await.unwrap().unwrap();
        assert!(matches!(all, Value::Array(ref items) if items.len() == 2));

        // Unknown key falls back to the first row.
        let fallback = ds.get_data("codes", &[Value::from("Z")]).await.unwrap().unwrap();
        assert_eq!(fallback.as_map().unwrap()["code"], Value::from("A"));
        ds.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn poll_cycle_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        write_at(&dir.path().join("a.csv"), "code\nA\n", 0);

        let ds = FileSystemDataSource::new();
        ds.initialize(&config(dir.path(), "*.csv", Some(3600))).await.unwrap();
        assert_eq!(ds.query("$[*]", &Params::new()).await.unwrap().len(), 1);

        write_at(&dir.path().join("b.csv"), "code\nB\nC\n", 10);
        assert_eq!(ds.poll_now().await, Some(1));

        let rows = ds.query("$[*]", &Params::new()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["code"], Value::from("B"));
        ds.shutdown().await.unwrap();
        assert_eq!(ds.poll_now().await, None);
    }

    #[tokio::test]
    async fn batch_update_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let ds = FileSystemDataSource::new();
        ds.initialize(&config(dir.path(), "*.csv", None)).await.unwrap();
        assert!(ds.is_healthy().await);

        let err = ds.batch_update(&["x".into()]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(!err.is_retryable());
        assert!(ds.query("$[*]", &Params::new()).await.unwrap().is_empty());
    }
}
