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

// Metrics fan-out layer for build automation servers
//
// Build steps and internal components post named values with a context
// (at least `builder_name`); the stats service forwards each value to every
// configured storage backend:
// - JSON files, one append-only array per series
// - InfluxDB, as tagged points
// Backend failures are logged and never reach the caller, and blocking
// backend I/O runs on a bounded offload pool.

pub mod config;
pub mod error;
pub mod metric;
pub mod offload;
pub mod service;
pub mod storage;

// Re-export main types
pub use config::{load_config, load_config_with_env, FanoutMode, StatsConfig};
pub use error::{Result, StatsError};
pub use metric::{builder_context, Capture, Captures, Context, MetricPoint, MetricValue, BUILDER_NAME};
pub use offload::{OffloadHandle, Offloader};
pub use service::{PostReport, ServiceState, StatsService};
pub use storage::{
    BackendFactory, InfluxStorageBackend, JsonStorageBackend, NoopBackend, StatsBackend,
};
