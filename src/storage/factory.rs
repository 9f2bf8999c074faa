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

// Backend factory for creating stats backends from configuration

use super::backend::{NoopBackend, StatsBackend};
use super::influx::InfluxStorageBackend;
use super::json::JsonStorageBackend;
use crate::config::BackendConfig;
use crate::error::{Result, StatsError};
use crate::metric::Captures;
use crate::offload::Offloader;
use std::sync::Arc;

/// Backend types the factory can build
pub const SUPPORTED_BACKENDS: &[&str] = &["json", "influxdb", "noop"];

pub struct BackendFactory;

impl BackendFactory {
    /// Create a stats backend from configuration
    ///
    /// Blocking I/O of the created backend is submitted to `offloader`.
    pub fn create(config: &BackendConfig, offloader: &Offloader) -> Result<Arc<dyn StatsBackend>> {
        let name = config.display_name().to_string();
        let captures = Captures::new(config.captures.clone());

        match config.backend.as_str() {
            "json" => {
                let json_config = config.settings.as_json().ok_or_else(|| {
                    StatsError::configuration(&name, "json", "json config missing")
                })?;

                Ok(Arc::new(JsonStorageBackend::new(
                    name,
                    json_config.clone(),
                    captures,
                    offloader.clone(),
                )))
            }

            "influxdb" => {
                let influx_config = config.settings.as_influx().ok_or_else(|| {
                    StatsError::configuration(&name, "influxdb", "influxdb config missing")
                })?;

                Ok(Arc::new(InfluxStorageBackend::new(
                    name,
                    influx_config.clone(),
                    captures,
                    offloader.clone(),
                )))
            }

            "noop" => Ok(Arc::new(NoopBackend::new(name).with_captures(captures))),

            unknown => Err(StatsError::configuration(
                name,
                unknown,
                format!(
                    "unsupported backend type. Supported: {}",
                    SUPPORTED_BACKENDS.join(", ")
                ),
            )),
        }
    }
}
