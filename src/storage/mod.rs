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

// Stats storage module
//
// Provides a trait-based abstraction for stats backends, so the stats
// service can fan values out to different storage systems
// (JSON files, InfluxDB, ...).
//
// This module focuses on WRITE operations. The JSON backend additionally
// exposes its series for inspection.

pub mod backend;
pub mod factory;
pub mod influx;
pub mod json;

pub use backend::{NoopBackend, StatsBackend};
pub use factory::BackendFactory;
pub use influx::{InfluxHttpClient, InfluxStorageBackend, Point, TimeSeriesClient};
pub use json::{JsonStorageBackend, PostData, SeriesRecord};
