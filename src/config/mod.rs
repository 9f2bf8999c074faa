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

// Configuration management module

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StatsConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<StatsConfig> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("STATS_LOG_LEVEL") {
        config.logging.level = level;
    }

    // Redirects every json backend, handy for local runs
    if let Ok(base_dir) = std::env::var("STATS_JSON_BASE_DIR") {
        for backend in &mut config.backends {
            if let Some(json) = backend.settings.as_json_mut() {
                json.base_dir = PathBuf::from(&base_dir);
            }
        }
    }

    Ok(config)
}
