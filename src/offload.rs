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

// Offloading of blocking work (file and network I/O) to the blocking pool

use crate::config::WorkerConfig;
use crate::error::{Result, StatsError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs blocking operations off the caller's task.
///
/// At most `max_workers` submitted operations run at the same time; the rest
/// wait for a permit. Cloning shares the same limit.
#[derive(Clone, Debug)]
pub struct Offloader {
    permits: Arc<Semaphore>,
    deadline: Option<Duration>,
}

impl Offloader {
    pub fn new(max_workers: usize, deadline: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            deadline,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.max_workers, config.deadline())
    }

    /// Submit a blocking operation. Must be called from within a tokio runtime.
    ///
    /// The returned handle resolves to whatever `op` returns. A panic inside
    /// `op` resolves to [`StatsError::Offload`]; an exceeded deadline to
    /// [`StatsError::Timeout`], in which case the operation still runs to
    /// completion on its worker.
    pub fn submit<T, F>(&self, op: F) -> OffloadHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let permits = self.permits.clone();
        let deadline = self.deadline;

        let inner = tokio::spawn(async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| StatsError::Offload(e.to_string()))?;

            let work = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                op()
            });

            let joined = match deadline {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Offloaded operation exceeded deadline of {:?}", limit);
                        return Err(StatsError::Timeout(limit));
                    }
                },
                None => work.await,
            };

            joined.map_err(|e| StatsError::Offload(e.to_string()))?
        });

        OffloadHandle { inner }
    }

    /// Number of workers currently free
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for Offloader {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// Completion handle of an offloaded operation
#[must_use = "an offload handle does nothing unless awaited or given a callback"]
pub struct OffloadHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> OffloadHandle<T> {
    pub async fn wait(self) -> Result<T> {
        self.await
    }

    /// Run `callback` with the outcome once the operation finishes
    pub fn on_complete<C>(self, callback: C)
    where
        C: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move {
            callback(self.await);
        });
    }
}

impl<T> Future for OffloadHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => {
                debug!("Offload task did not complete: {}", e);
                Poll::Ready(Err(StatsError::Offload(e.to_string())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
