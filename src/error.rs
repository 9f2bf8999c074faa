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

//! Error taxonomy for the stats service and its backends.
//!
//! Configuration and input errors surface to the caller of
//! `reconfigure`/`post`. Everything a single backend raises during fan-out is
//! caught at the service boundary and only logged.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StatsError>;

#[derive(Debug, Error)]
pub enum StatsError {
    /// A configured backend does not satisfy the backend contract.
    #[error("invalid stats backend '{name}' of type '{actual_type}': {reason}")]
    Configuration {
        name: String,
        actual_type: String,
        reason: String,
    },

    /// `post` was called without the required context key.
    #[error("context does not have required key '{key}'")]
    MissingContext { key: &'static str },

    /// The backend never completed construction.
    #[error("stats backend '{backend}' not initialized")]
    NotInitialized { backend: String },

    /// Existing series content could not be parsed. The file is left as is.
    #[error("series store {path} is corrupt: {source}")]
    CorruptStore {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// I/O failure while writing to a backend.
    #[error("write to stats backend '{backend}' failed: {message}")]
    BackendWrite { backend: String, message: String },

    /// The point cannot be stored as given (e.g. a series name escaping the store).
    #[error("malformed input for stats backend '{backend}': {message}")]
    MalformedInput { backend: String, message: String },

    #[error("stats service is stopped")]
    Stopped,

    #[error("offloaded operation exceeded deadline of {0:?}")]
    Timeout(Duration),

    /// The offloaded operation panicked or its worker was torn down.
    #[error("offloaded operation failed: {0}")]
    Offload(String),
}

impl StatsError {
    pub fn backend_write(backend: &str, message: impl Into<String>) -> Self {
        StatsError::BackendWrite {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(backend: &str, message: impl Into<String>) -> Self {
        StatsError::MalformedInput {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn configuration(
        name: impl Into<String>,
        actual_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        StatsError::Configuration {
            name: name.into(),
            actual_type: actual_type.into(),
            reason: reason.into(),
        }
    }
}
