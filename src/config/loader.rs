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

// Configuration loader with environment variable substitution

use super::types::StatsConfig;
use crate::storage::factory::SUPPORTED_BACKENDS;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<StatsConfig> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        Self::parse(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn parse(content: &str) -> Result<StatsConfig> {
        let content = Self::substitute_env_vars(content);

        let config: StatsConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${INFLUX_DB:-builds} -> builds (if INFLUX_DB not set)
    fn substitute_env_vars(content: &str) -> String {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
        });

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    // Keep original if no default and var not found
                    None => format!("${{{}}}", var_name),
                },
            }
        })
        .to_string()
    }

    /// Validate configuration
    pub fn validate(config: &StatsConfig) -> Result<()> {
        if config.service.workers.max_workers == 0 {
            bail!("service.workers.max_workers must be > 0");
        }

        if config.service.workers.deadline_seconds == Some(0) {
            bail!("service.workers.deadline_seconds must be > 0 when set");
        }

        let mut names = HashSet::new();
        for backend in &config.backends {
            let name = backend.display_name();
            if !names.insert(name) {
                bail!("Duplicate backend name: '{}'", name);
            }

            match backend.backend.as_str() {
                "json" => {
                    if backend.settings.as_json().is_none() {
                        bail!("json backend '{}' selected but json config missing", name);
                    }
                }
                "influxdb" => {
                    let Some(influx) = backend.settings.as_influx() else {
                        bail!("influxdb backend '{}' selected but influxdb config missing", name);
                    };
                    if influx.port == 0 {
                        bail!("influxdb backend '{}': port must be > 0", name);
                    }
                    if influx.database.is_empty() {
                        bail!("influxdb backend '{}': database cannot be empty", name);
                    }
                }
                "noop" => {}
                unknown => bail!(
                    "Unknown backend type: '{}'. Supported: {}",
                    unknown,
                    SUPPORTED_BACKENDS.join(", ")
                ),
            }

            for capture in &backend.captures {
                if capture.builder_name.is_empty() || capture.property_name.is_empty() {
                    bail!(
                        "backend '{}': captures need both builder_name and property_name",
                        name
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("BUILD_METRICS_TEST_VAR", "test_value");

        let input = "url: ${BUILD_METRICS_TEST_VAR}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "url: test_value");

        std::env::remove_var("BUILD_METRICS_TEST_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("BUILD_METRICS_TEST_VAR2");

        let input = "database: ${BUILD_METRICS_TEST_VAR2:-builds}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "database: builds");
    }

    #[test]
    fn test_unset_var_without_default_is_kept() {
        std::env::remove_var("BUILD_METRICS_TEST_VAR3");

        let output = ConfigLoader::substitute_env_vars("x: ${BUILD_METRICS_TEST_VAR3}");
        assert_eq!(output, "x: ${BUILD_METRICS_TEST_VAR3}");
    }

    #[test]
    fn test_validation_zero_workers() {
        let mut config = StatsConfig::default();
        config.service.workers.max_workers = 0;

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("max_workers"));
    }

    #[test]
    fn test_validation_unknown_backend() {
        let mut config = StatsConfig::default();
        let mut backend = BackendConfig::noop("x");
        backend.backend = "graphite".to_string();
        config.backends.push(backend);

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("graphite"));
    }

    #[test]
    fn test_validation_duplicate_names() {
        let mut config = StatsConfig::default();
        config.backends.push(BackendConfig::noop("same"));
        config.backends.push(BackendConfig::noop("same"));

        let result = ConfigLoader::validate(&config);
        assert!(result.unwrap_err().to_string().contains("Duplicate"));
    }

    #[test]
    fn test_validation_missing_settings_block() {
        let yaml = r#"
backends:
  - type: json
    name: store
"#;
        let result = ConfigLoader::parse(yaml);
        assert!(result.unwrap_err().to_string().contains("json config missing"));
    }
}
