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

// Configuration types for build-metrics

use crate::metric::Capture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub service: ServiceSettings,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub fanout: FanoutMode,

    #[serde(default)]
    pub workers: WorkerConfig,
}

/// How a posted value is dispatched to the active backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// Await each backend before starting the next
    #[default]
    Sequential,
    /// Dispatch to all backends at once, then wait for all of them
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub deadline_seconds: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            deadline_seconds: None,
        }
    }
}

impl WorkerConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_seconds.map(Duration::from_secs)
    }
}

/// One storage backend entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Backend type: "json", "influxdb", "noop"
    #[serde(rename = "type")]
    pub backend: String,

    /// Name used in logs; defaults to the backend type
    #[serde(default)]
    pub name: Option<String>,

    /// Metrics this backend persists. Empty persists everything.
    #[serde(default)]
    pub captures: Vec<Capture>,

    /// Backend-specific configuration
    #[serde(flatten)]
    pub settings: BackendSettings,
}

impl BackendConfig {
    pub fn json(name: &str, json: JsonStoreConfig) -> Self {
        Self {
            backend: "json".to_string(),
            name: Some(name.to_string()),
            captures: Vec::new(),
            settings: BackendSettings::Json { json },
        }
    }

    pub fn influxdb(name: &str, influxdb: InfluxConfig) -> Self {
        Self {
            backend: "influxdb".to_string(),
            name: Some(name.to_string()),
            captures: Vec::new(),
            settings: BackendSettings::Influx { influxdb },
        }
    }

    pub fn noop(name: &str) -> Self {
        Self {
            backend: "noop".to_string(),
            name: Some(name.to_string()),
            captures: Vec::new(),
            settings: BackendSettings::Empty {},
        }
    }

    pub fn with_captures(mut self, captures: Vec<Capture>) -> Self {
        self.captures = captures;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.backend)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BackendSettings {
    Json {
        #[serde(rename = "json")]
        json: JsonStoreConfig,
    },
    Influx {
        #[serde(rename = "influxdb")]
        influxdb: InfluxConfig,
    },
    Empty {},
}

impl BackendSettings {
    pub fn as_json(&self) -> Option<&JsonStoreConfig> {
        match self {
            BackendSettings::Json { json } => Some(json),
            _ => None,
        }
    }

    pub fn as_json_mut(&mut self) -> Option<&mut JsonStoreConfig> {
        match self {
            BackendSettings::Json { json } => Some(json),
            _ => None,
        }
    }

    pub fn as_influx(&self) -> Option<&InfluxConfig> {
        match self {
            BackendSettings::Influx { influxdb } => Some(influxdb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonStoreConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// fsync every series file after rewriting it
    #[serde(default)]
    pub sync_writes: bool,
}

impl Default for JsonStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            sync_writes: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InfluxConfig {
    pub url: String,

    #[serde(default = "default_influx_port")]
    pub port: u16,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    pub database: String,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "localhost".to_string(),
            port: default_influx_port(),
            user: None,
            password: None,
            database: "buildbot".to_string(),
            timeout_seconds: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// `$HOME/buildbot`, or `./buildbot` when no home directory is known
pub fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("buildbot")
}

// Default value functions
fn default_max_workers() -> usize { 4 }
fn default_influx_port() -> u16 { 8086 }
fn default_timeout() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }
