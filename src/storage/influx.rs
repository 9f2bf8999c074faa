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

// InfluxDB backend implementation

use super::backend::StatsBackend;
use crate::config::InfluxConfig;
use crate::error::{Result, StatsError};
use crate::metric::{CaptureMatch, Captures, MetricPoint, MetricValue, BUILDER_NAME};
use crate::offload::Offloader;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

/// A point as handed to the time-series client
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub fields: BTreeMap<String, MetricValue>,
    pub tags: BTreeMap<String, String>,
    /// Nanoseconds since the epoch; the server assigns one when absent
    pub timestamp_ns: Option<i64>,
}

impl Point {
    /// Render the point as one line of InfluxDB line protocol
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            // Empty tag values are not representable
            if value.is_empty() {
                continue;
            }
            line.push_str(&format!(
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            ));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, &[',', '=', ' ']), field_value(value)))
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));

        if let Some(ts) = self.timestamp_ns {
            line.push_str(&format!(" {}", ts));
        }

        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn field_value(value: &MetricValue) -> String {
    match value {
        MetricValue::Bool(b) => b.to_string(),
        MetricValue::Int(i) => format!("{}i", i),
        MetricValue::Float(f) => f.to_string(),
        MetricValue::Text(s) => format!("\"{}\"", escape(s, &['"'])),
    }
}

/// Blocking write access to a time-series store
pub trait TimeSeriesClient: Send + Sync {
    fn write_points(&self, points: &[Point]) -> Result<()>;
}

/// InfluxDB 1.x client writing line protocol over HTTP
///
/// `write_points` blocks the calling thread until the request completes and
/// must therefore run on an offload worker, never on a runtime thread.
pub struct InfluxHttpClient {
    client: Client,
    runtime: Handle,
    write_url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl InfluxHttpClient {
    pub fn new(config: &InfluxConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let runtime = Handle::try_current().context("No tokio runtime available")?;

        let client = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        let base = if config.url.starts_with("http://") || config.url.starts_with("https://") {
            config.url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.url.trim_end_matches('/'))
        };
        let write_url = format!("{}:{}/write", base, config.port);
        reqwest::Url::parse(&write_url).context("Invalid InfluxDB url")?;

        Ok(Self {
            client,
            runtime,
            write_url,
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn send(&self, body: String) -> anyhow::Result<()> {
        use anyhow::{bail, Context};

        let mut query = vec![("db", self.database.as_str())];
        if let Some(user) = &self.user {
            query.push(("u", user.as_str()));
        }
        if let Some(password) = &self.password {
            query.push(("p", password.as_str()));
        }

        let response = self
            .client
            .post(&self.write_url)
            .query(&query)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("InfluxDB write failed with status {}: {}", status, error_text);
        }

        Ok(())
    }
}

impl TimeSeriesClient for InfluxHttpClient {
    fn write_points(&self, points: &[Point]) -> Result<()> {
        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        self.runtime
            .block_on(self.send(body))
            .map_err(|e| StatsError::backend_write("influxdb", format!("{:#}", e)))
    }
}

/// Backend delegating points to InfluxDB
pub struct InfluxStorageBackend {
    name: String,
    config: InfluxConfig,
    captures: Captures,
    offloader: Offloader,
    /// Present only once the client was constructed successfully
    client: Option<Arc<dyn TimeSeriesClient>>,
}

impl InfluxStorageBackend {
    /// Construct the HTTP client. A construction failure is logged and leaves
    /// the backend registered but uninitialized.
    pub fn new(
        name: impl Into<String>,
        config: InfluxConfig,
        captures: Captures,
        offloader: Offloader,
    ) -> Self {
        let name = name.into();
        let client = match InfluxHttpClient::new(&config) {
            Ok(client) => {
                info!(
                    "InfluxDB backend '{}' writing to {}:{} database '{}'",
                    name, config.url, config.port, config.database
                );
                Some(Arc::new(client) as Arc<dyn TimeSeriesClient>)
            }
            Err(e) => {
                error!("InfluxDB backend '{}' failed to initialize: {:#}", name, e);
                None
            }
        };

        Self {
            name,
            config,
            captures,
            offloader,
            client,
        }
    }

    /// Use an already constructed client
    pub fn with_client(
        name: impl Into<String>,
        config: InfluxConfig,
        captures: Captures,
        offloader: Offloader,
        client: Arc<dyn TimeSeriesClient>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            captures,
            offloader,
            client: Some(client),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.client.is_some()
    }

    pub fn config(&self) -> &InfluxConfig {
        &self.config
    }

    fn build_point(&self, point: &MetricPoint, extra_tags: Option<&HashMap<String, String>>) -> Point {
        let mut tags = BTreeMap::new();
        tags.insert(BUILDER_NAME.to_string(), point.builder_name().to_string());
        if let Some(extra) = extra_tags {
            tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        tags.extend(point.context().iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), MetricValue::Text(point.name().to_string()));
        fields.insert("value".to_string(), point.value().clone());

        Point {
            measurement: point.series_name(),
            fields,
            tags,
            timestamp_ns: point.timestamp().timestamp_nanos_opt(),
        }
    }
}

#[async_trait]
impl StatsBackend for InfluxStorageBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        "influxdb"
    }

    fn captures(&self) -> &Captures {
        &self.captures
    }

    async fn post(&self, point: &MetricPoint) -> Result<()> {
        let Some(client) = self.client.clone() else {
            error!("Service {} not initialized", self.name);
            return Err(StatsError::NotInitialized {
                backend: self.name.clone(),
            });
        };

        let extra_tags = match self.captures.check(point) {
            CaptureMatch::Rejected => return Ok(()),
            CaptureMatch::Matched(capture) => Some(&capture.extra_tags),
            CaptureMatch::Unfiltered => None,
        };

        if !point.value().is_finite() {
            return Err(StatsError::malformed(
                &self.name,
                format!("non-finite value {} for '{}'", point.value(), point.name()),
            ));
        }

        let data = self.build_point(point, extra_tags);
        debug!(
            "Sending data to InfluxDB backend '{}': name={:?} value={:?} context={:?}",
            self.name,
            point.name(),
            point.value(),
            point.context()
        );

        let backend = self.name.clone();
        self.offloader
            .submit(move || {
                client.write_points(&[data]).map_err(|e| match e {
                    StatsError::BackendWrite { message, .. } => StatsError::BackendWrite { backend, message },
                    other => other,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{builder_context, Capture};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        written: Mutex<Vec<Point>>,
    }

    impl TimeSeriesClient for RecordingClient {
        fn write_points(&self, points: &[Point]) -> Result<()> {
            self.written.lock().unwrap().extend_from_slice(points);
            Ok(())
        }
    }

    struct FailingClient;

    impl TimeSeriesClient for FailingClient {
        fn write_points(&self, _points: &[Point]) -> Result<()> {
            Err(StatsError::backend_write("influxdb", "connection refused"))
        }
    }

    fn backend_with(client: Arc<dyn TimeSeriesClient>, captures: Captures) -> InfluxStorageBackend {
        InfluxStorageBackend::with_client(
            "influx",
            InfluxConfig::default(),
            captures,
            Offloader::new(2, None),
            client,
        )
    }

    #[tokio::test]
    async fn test_post_builds_tagged_point() {
        let client = Arc::new(RecordingClient::default());
        let backend = backend_with(client.clone(), Captures::default());

        let mut context = builder_context("linux-x64");
        context.insert("step_name".to_string(), "compile".to_string());
        let point = MetricPoint::new("build_duration", 42.5, context).unwrap();
        backend.post(&point).await.unwrap();

        let written = client.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        let data = &written[0];
        assert_eq!(data.measurement, "linux-x64-build_duration");
        assert_eq!(data.fields["name"], MetricValue::from("build_duration"));
        assert_eq!(data.fields["value"], MetricValue::Float(42.5));
        assert_eq!(data.tags["builder_name"], "linux-x64");
        assert_eq!(data.tags["step_name"], "compile");
    }

    #[tokio::test]
    async fn test_non_finite_value_is_rejected() {
        let client = Arc::new(RecordingClient::default());
        let backend = backend_with(client.clone(), Captures::default());

        let point = MetricPoint::new("load", f64::NAN, builder_context("linux-x64")).unwrap();
        let result = backend.post(&point).await;
        assert!(matches!(result, Err(StatsError::MalformedInput { .. })));
        assert!(client.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_tags_are_merged() {
        let client = Arc::new(RecordingClient::default());
        let captures = Captures::new(vec![
            Capture::new("TestBuilder", "test").with_tag("team", "infra")
        ]);
        let backend = backend_with(client.clone(), captures);

        let skipped = MetricPoint::new("other", 1, builder_context("TestBuilder")).unwrap();
        backend.post(&skipped).await.unwrap();

        let point = MetricPoint::new("test", 10, builder_context("TestBuilder"))
            .unwrap()
            .with_series("TestBuilder-test");
        backend.post(&point).await.unwrap();

        let written = client.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].tags["team"], "infra");
        assert_eq!(written[0].tags["builder_name"], "TestBuilder");
    }

    #[tokio::test]
    async fn test_client_error_names_backend() {
        let backend = backend_with(Arc::new(FailingClient), Captures::default());
        let point = MetricPoint::new("x", 1, builder_context("b")).unwrap();

        match backend.post(&point).await {
            Err(StatsError::BackendWrite { backend, message }) => {
                assert_eq!(backend, "influx");
                assert!(message.contains("connection refused"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_construction_outside_runtime_is_not_initialized() {
        let backend = InfluxStorageBackend::new(
            "influx",
            InfluxConfig::default(),
            Captures::default(),
            Offloader::new(1, None),
        );
        assert!(!backend.is_initialized());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let point = MetricPoint::new("x", 1, builder_context("b")).unwrap();
        let result = runtime.block_on(backend.post(&point));
        assert!(matches!(result, Err(StatsError::NotInitialized { .. })));
    }

    #[tokio::test]
    async fn test_construction_inside_runtime_is_initialized() {
        let backend = InfluxStorageBackend::new(
            "influx",
            InfluxConfig::default(),
            Captures::default(),
            Offloader::new(1, None),
        );
        assert!(backend.is_initialized());
    }

    #[test]
    fn test_line_protocol() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), MetricValue::from("build duration"));
        fields.insert("value".to_string(), MetricValue::Int(10));
        let mut tags = BTreeMap::new();
        tags.insert("builder_name".to_string(), "linux x64".to_string());
        tags.insert("empty".to_string(), String::new());

        let point = Point {
            measurement: "linux,x64-build".to_string(),
            fields,
            tags,
            timestamp_ns: Some(1_000),
        };

        assert_eq!(
            point.to_line_protocol(),
            r#"linux\,x64-build,builder_name=linux\ x64 name="build duration",value=10i 1000"#
        );
    }
}
