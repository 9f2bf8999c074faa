// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// JSON file backend implementation

use super::backend::StatsBackend;
use crate::config::JsonStoreConfig;
use crate::error::{Result, StatsError};
use crate::metric::{CaptureMatch, Captures, Context, MetricPoint, MetricValue};
use crate::offload::Offloader;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

/// Payload part of a stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostData {
    pub name: String,
    pub value: MetricValue,
}

/// One entry of a series file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub post_data: PostData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

/// Backend appending points to one JSON array file per series.
///
/// Each append rewrites the whole file, so writes to the same series are
/// serialized through a per-series lock.
pub struct JsonStorageBackend {
    name: String,
    base_dir: PathBuf,
    sync_writes: bool,
    captures: Captures,
    offloader: Offloader,
    ready: OnceCell<()>,
    series_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JsonStorageBackend {
    pub fn new(
        name: impl Into<String>,
        config: JsonStoreConfig,
        captures: Captures,
        offloader: Offloader,
    ) -> Self {
        let name = name.into();
        info!(
            "Initializing json backend '{}' at: {}",
            name,
            config.base_dir.display()
        );

        Self {
            name,
            base_dir: config.base_dir,
            sync_writes: config.sync_writes,
            captures,
            offloader,
            ready: OnceCell::new(),
            series_locks: DashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create the base directory once
    async fn ensure_base_directory(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                debug!("Ensuring base directory: {}", self.base_dir.display());
                fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                    StatsError::backend_write(
                        &self.name,
                        format!(
                            "failed to create base directory {}: {}",
                            self.base_dir.display(),
                            e
                        ),
                    )
                })
            })
            .await?;
        Ok(())
    }

    /// Path of a series file; rejects names that would leave the base directory
    fn series_path(&self, series_name: &str) -> Result<PathBuf> {
        let mut components = Path::new(series_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.base_dir.join(series_name)),
            _ => Err(StatsError::malformed(
                &self.name,
                format!("invalid series name '{}'", series_name),
            )),
        }
    }

    fn series_lock(&self, series_name: &str) -> Arc<Mutex<()>> {
        self.series_locks
            .entry(series_name.to_string())
            .or_default()
            .clone()
    }

    /// Read all records of a series in append order
    pub async fn read_series(&self, series_name: &str) -> Result<Vec<SeriesRecord>> {
        let path = self.series_path(series_name)?;
        let backend = self.name.clone();

        self.offloader
            .submit(move || {
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => {
                        return Err(StatsError::backend_write(
                            &backend,
                            format!("failed to read {}: {}", path.display(), e),
                        ))
                    }
                };
                parse_records(&path, &content)
            })
            .await
    }
}

fn parse_records(path: &Path, content: &str) -> Result<Vec<SeriesRecord>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(content).map_err(|source| StatsError::CorruptStore {
        path: path.display().to_string(),
        source,
    })
}

/// Read-modify-write of one series file. Callers hold the series lock.
fn append_record(backend: &str, path: &Path, record: SeriesRecord, sync: bool) -> Result<usize> {
    let io_err = |what: &str, e: std::io::Error| {
        StatsError::backend_write(backend, format!("failed to {} {}: {}", what, path.display(), e))
    };

    let mut file: File = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| io_err("open", e))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| io_err("read", e))?;

    // A parse failure leaves the file untouched
    let mut records = parse_records(path, &content)?;
    records.push(record);

    let serialized = serde_json::to_vec(&records)
        .map_err(|e| StatsError::backend_write(backend, format!("failed to serialize records: {}", e)))?;

    file.seek(SeekFrom::Start(0))
        .map_err(|e| io_err("seek", e))?;
    file.write_all(&serialized)
        .map_err(|e| io_err("write", e))?;
    file.set_len(serialized.len() as u64)
        .map_err(|e| io_err("truncate", e))?;
    file.flush().map_err(|e| io_err("flush", e))?;

    if sync {
        file.sync_all().map_err(|e| io_err("sync", e))?;
    }

    Ok(records.len())
}

#[async_trait]
impl StatsBackend for JsonStorageBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        "json"
    }

    fn captures(&self) -> &Captures {
        &self.captures
    }

    async fn initialize(&self) -> Result<()> {
        self.ensure_base_directory().await
    }

    async fn post(&self, point: &MetricPoint) -> Result<()> {
        let mut context = point.context().clone();
        match self.captures.check(point) {
            CaptureMatch::Rejected => {
                debug!(
                    "json backend '{}' does not capture '{}' for builder '{}'",
                    self.name,
                    point.name(),
                    point.builder_name()
                );
                return Ok(());
            }
            CaptureMatch::Matched(capture) => {
                for (key, value) in &capture.extra_tags {
                    context.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            CaptureMatch::Unfiltered => {}
        }

        if !point.value().is_finite() {
            return Err(StatsError::malformed(
                &self.name,
                format!("non-finite value {} for '{}'", point.value(), point.name()),
            ));
        }

        let series_name = point.series_name();
        let path = self.series_path(&series_name)?;
        self.ensure_base_directory().await?;

        let record = SeriesRecord {
            post_data: PostData {
                name: point.name().to_string(),
                value: point.value().clone(),
            },
            context: (!context.is_empty()).then_some(context),
        };

        debug!("Writing {:?} to json backend '{}'", record, self.name);

        // The guard moves into the blocking op so the series stays locked
        // until the write finishes, even when the caller gives up on a deadline
        let guard = self.series_lock(&series_name).lock_owned().await;

        let backend = self.name.clone();
        let sync = self.sync_writes;
        let count = self
            .offloader
            .submit(move || {
                let _guard = guard;
                append_record(&backend, &path, record, sync)
            })
            .await?;

        debug!(
            "Series '{}' of json backend '{}' now holds {} records",
            series_name, self.name, count
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{builder_context, Capture};
    use tempfile::TempDir;

    fn create_test_backend(captures: Captures) -> (JsonStorageBackend, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = JsonStoreConfig {
            base_dir: temp_dir.path().join("stats"),
            sync_writes: false,
        };
        let backend = JsonStorageBackend::new("json", config, captures, Offloader::new(4, None));
        (backend, temp_dir)
    }

    #[tokio::test]
    async fn test_initialize_creates_base_dir() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());
        assert!(!backend.base_dir().exists());

        backend.initialize().await.unwrap();
        assert!(backend.base_dir().is_dir());

        // Idempotent
        backend.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_post_writes_record() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());

        let point = MetricPoint::new("build_duration", 42.5, builder_context("linux-x64"))
            .unwrap()
            .with_series("series");
        backend.post(&point).await.unwrap();

        let content = std::fs::read_to_string(backend.base_dir().join("series")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([{
                "post_data": {"name": "build_duration", "value": 42.5},
                "context": {"builder_name": "linux-x64"}
            }])
        );
    }

    #[tokio::test]
    async fn test_appends_in_order() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());

        for i in 0..5 {
            let point = MetricPoint::new("count", i, builder_context("b")).unwrap();
            backend.post(&point).await.unwrap();
        }

        let records = backend.read_series("b-count").await.unwrap();
        let values: Vec<_> = records.iter().map(|r| r.post_data.value.clone()).collect();
        assert_eq!(values, (0..5).map(MetricValue::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shorter_rewrite_truncates() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());
        backend.initialize().await.unwrap();

        // Trailing whitespace beyond the new content must not survive
        let path = backend.base_dir().join("b-x");
        std::fs::write(&path, format!("[]{}", " ".repeat(4096))).unwrap();

        let point = MetricPoint::new("x", 1, builder_context("b")).unwrap();
        backend.post(&point).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with(']'));
        assert_eq!(backend.read_series("b-x").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_store_is_not_overwritten() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());
        backend.initialize().await.unwrap();

        let path = backend.base_dir().join("b-x");
        std::fs::write(&path, "{not json").unwrap();

        let point = MetricPoint::new("x", 1, builder_context("b")).unwrap();
        let result = backend.post(&point).await;
        assert!(matches!(result, Err(StatsError::CorruptStore { .. })));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[tokio::test]
    async fn test_invalid_series_name() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());

        for series in ["../escape", "a/b", "", ".."] {
            let point = MetricPoint::new("x", 1, builder_context("b"))
                .unwrap()
                .with_series(series);
            let result = backend.post(&point).await;
            assert!(
                matches!(result, Err(StatsError::MalformedInput { .. })),
                "series {:?} accepted",
                series
            );
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_to_one_series() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());
        let backend = Arc::new(backend);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let backend = backend.clone();
            tasks.spawn(async move {
                let point = MetricPoint::new("n", i, builder_context("b")).unwrap();
                backend.post(&point).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let records = backend.read_series("b-n").await.unwrap();
        assert_eq!(records.len(), 32);
    }

    #[tokio::test]
    async fn test_captures_filter_and_tag() {
        let captures = Captures::new(vec![
            Capture::new("linux", "duration").with_tag("arch", "x64")
        ]);
        let (backend, _temp_dir) = create_test_backend(captures);

        let ignored = MetricPoint::new("other", 1, builder_context("linux")).unwrap();
        backend.post(&ignored).await.unwrap();
        assert!(backend.read_series("linux-other").await.unwrap().is_empty());

        let kept = MetricPoint::new("duration", 3, builder_context("linux")).unwrap();
        backend.post(&kept).await.unwrap();

        let records = backend.read_series("linux-duration").await.unwrap();
        assert_eq!(records.len(), 1);
        let context = records[0].context.as_ref().unwrap();
        assert_eq!(context["arch"], "x64");
        assert_eq!(context["builder_name"], "linux");
    }

    #[tokio::test]
    async fn test_non_finite_value_keeps_series_usable() {
        let (backend, _temp_dir) = create_test_backend(Captures::default());

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let point = MetricPoint::new("x", bad, builder_context("b")).unwrap();
            let result = backend.post(&point).await;
            assert!(matches!(result, Err(StatsError::MalformedInput { .. })));
        }

        let point = MetricPoint::new("x", 1.0, builder_context("b")).unwrap();
        backend.post(&point).await.unwrap();

        let records = backend.read_series("b-x").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].post_data.value, MetricValue::Float(1.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_deadline_keeps_series_serialized() {
        let temp_dir = TempDir::new().unwrap();
        let config = JsonStoreConfig {
            base_dir: temp_dir.path().join("stats"),
            sync_writes: false,
        };
        let offloader = Offloader::new(4, Some(std::time::Duration::from_micros(1)));
        let backend = Arc::new(JsonStorageBackend::new("json", config, Captures::default(), offloader));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..200 {
            let backend = backend.clone();
            tasks.spawn(async move {
                let point = MetricPoint::new("x", i, builder_context("b")).unwrap();
                backend.post(&point).await
            });
        }

        let mut timed_out = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(()) => {}
                Err(StatsError::Timeout(_)) => timed_out += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        // Every post took the series lock before returning, so acquiring it
        // here waits for the last write still running past its deadline
        let _settled = backend.series_lock("b-x").lock_owned().await;

        let content = std::fs::read_to_string(backend.base_dir().join("b-x")).unwrap();
        let records = parse_records(Path::new("b-x"), &content).unwrap();
        assert_eq!(records.len(), 200, "{} posts timed out", timed_out);
    }
}
