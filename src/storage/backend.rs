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

// Stats backend trait

use crate::error::Result;
use crate::metric::{Captures, MetricPoint};
use async_trait::async_trait;

/// Storage sink for posted metric values
///
/// Implementations check their own ready state before doing I/O and report
/// "not initialized", I/O failures and malformed input as distinct
/// [`StatsError`](crate::error::StatsError) variants. Blocking work belongs on
/// the [`Offloader`](crate::offload::Offloader).
#[async_trait]
pub trait StatsBackend: Send + Sync {
    /// Name identifying this backend in logs and post reports
    fn name(&self) -> &str;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;

    /// Prepare the backend after registration (create directories etc.)
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Persist a single point
    ///
    /// The default accepts the point without side effect.
    async fn post(&self, _point: &MetricPoint) -> Result<()> {
        Ok(())
    }

    /// Metrics this backend persists; empty persists everything
    fn captures(&self) -> &Captures;
}

/// Backend that accepts every point and stores nothing
#[derive(Debug, Default)]
pub struct NoopBackend {
    name: String,
    captures: Captures,
}

impl NoopBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            captures: Captures::default(),
        }
    }

    pub fn with_captures(mut self, captures: Captures) -> Self {
        self.captures = captures;
        self
    }
}

#[async_trait]
impl StatsBackend for NoopBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> &str {
        "noop"
    }

    fn captures(&self) -> &Captures {
        &self.captures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::builder_context;

    #[tokio::test]
    async fn test_noop_backend_accepts_everything() {
        let backend = NoopBackend::new("sink");
        let point = MetricPoint::new("test", 10, builder_context("TestBuilder")).unwrap();

        assert!(backend.initialize().await.is_ok());
        assert!(backend.post(&point).await.is_ok());
        assert_eq!(backend.name(), "sink");
        assert_eq!(backend.backend_type(), "noop");
        assert!(backend.captures().is_empty());
    }
}
