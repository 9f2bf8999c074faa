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

//! Stats service: the single entry point for posting metric values.
//!
//! The service owns the active set of backends. A reconfiguration builds and
//! validates the complete new set before swapping it in, so a rejected
//! configuration leaves the previous set untouched. Each post snapshots the
//! set it started with; backends dropped by a later reconfiguration finish
//! their in-flight writes but receive nothing new.

use crate::config::{ConfigLoader, FanoutMode, StatsConfig, WorkerConfig};
use crate::error::{Result, StatsError};
use crate::metric::{builder_context, Context, MetricPoint, MetricValue};
use crate::offload::Offloader;
use crate::storage::{BackendFactory, StatsBackend};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type BackendSet = Arc<[Arc<dyn StatsBackend>]>;

/// Lifecycle of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Unconfigured,
    Configured,
    Stopped,
}

/// Per-backend outcome of one post
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostReport {
    /// Backends that accepted the value, in dispatch order
    pub delivered: Vec<String>,
    /// Backends that failed, with the logged error message
    pub failed: Vec<(String, String)>,
}

impl PostReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, backend: &str, result: Result<()>) {
        match result {
            Ok(()) => self.delivered.push(backend.to_string()),
            Err(e) => {
                error!("Stats backend '{}' failed to post value: {}", backend, e);
                self.failed.push((backend.to_string(), e.to_string()));
            }
        }
    }

    fn merge(&mut self, other: PostReport) {
        self.delivered.extend(other.delivered);
        self.failed.extend(other.failed);
    }
}

struct Inner {
    state: ServiceState,
    backends: BackendSet,
    fanout: FanoutMode,
    workers: WorkerConfig,
    offloader: Offloader,
}

/// Service-level settings installed together with a backend set
struct ServiceUpdate {
    fanout: FanoutMode,
    workers: WorkerConfig,
    offloader: Offloader,
}

/// Fans posted values out to every registered stats backend
pub struct StatsService {
    inner: RwLock<Inner>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl StatsService {
    pub fn new(config: &StatsConfig) -> Self {
        info!("Creating StatsService");
        Self {
            inner: RwLock::new(Inner {
                state: ServiceState::Unconfigured,
                backends: Arc::from(Vec::new()),
                fanout: config.service.fanout,
                workers: config.service.workers.clone(),
                offloader: Offloader::from_config(&config.service.workers),
            }),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Offload pool shared by the backends this service builds
    pub async fn offloader(&self) -> Offloader {
        self.inner.read().await.offloader.clone()
    }

    pub async fn state(&self) -> ServiceState {
        self.inner.read().await.state
    }

    /// Snapshot of the active backends
    pub async fn backends(&self) -> Vec<Arc<dyn StatsBackend>> {
        self.inner.read().await.backends.to_vec()
    }

    /// Replace the active backends with the ones listed in `config`
    ///
    /// Every entry is built and validated before anything is swapped; on
    /// error the previously active set stays in place. Changed worker
    /// settings get a fresh offload pool, which the new backends share.
    pub async fn reconfigure(&self, config: &StatsConfig) -> Result<()> {
        info!(
            "Reconfiguring StatsService with {} backend(s)",
            config.backends.len()
        );

        let offloader = {
            let inner = self.inner.read().await;
            if inner.workers == config.service.workers {
                inner.offloader.clone()
            } else {
                info!(
                    "Worker settings changed: max_workers={}, deadline={:?}",
                    config.service.workers.max_workers,
                    config.service.workers.deadline()
                );
                Offloader::from_config(&config.service.workers)
            }
        };

        let backends = config
            .backends
            .iter()
            .map(|entry| BackendFactory::create(entry, &offloader))
            .collect::<Result<Vec<_>>>()?;

        ConfigLoader::validate(config)
            .map_err(|e| StatsError::configuration("service", "stats", format!("{:#}", e)))?;

        let update = ServiceUpdate {
            fanout: config.service.fanout,
            workers: config.service.workers.clone(),
            offloader,
        };
        self.install(backends, Some(update)).await
    }

    /// Replace the active backends with an already built set
    pub async fn reconfigure_backends(&self, backends: Vec<Arc<dyn StatsBackend>>) -> Result<()> {
        self.install(backends, None).await
    }

    async fn install(
        &self,
        backends: Vec<Arc<dyn StatsBackend>>,
        update: Option<ServiceUpdate>,
    ) -> Result<()> {
        let mut names = HashSet::new();
        for backend in &backends {
            if !names.insert(backend.name()) {
                return Err(StatsError::configuration(
                    backend.name(),
                    backend.backend_type(),
                    "duplicate backend name",
                ));
            }
        }

        let backends: BackendSet = Arc::from(backends);
        {
            let mut inner = self.inner.write().await;
            if inner.state == ServiceState::Stopped {
                return Err(StatsError::Stopped);
            }
            inner.backends = backends.clone();
            inner.state = ServiceState::Configured;
            if let Some(update) = update {
                inner.fanout = update.fanout;
                inner.workers = update.workers;
                inner.offloader = update.offloader;
            }
        }

        for backend in backends.iter() {
            if let Err(e) = backend.initialize().await {
                warn!(
                    "Stats backend '{}' ({}) failed to initialize: {}",
                    backend.name(),
                    backend.backend_type(),
                    e
                );
            }
            debug!(
                "Registered stats backend '{}' ({})",
                backend.name(),
                backend.backend_type()
            );
        }

        Ok(())
    }

    /// Post a value to every active backend
    ///
    /// `context` must contain `builder_name`. Failures of individual backends
    /// are logged and reported, never returned.
    pub async fn post(
        &self,
        name: &str,
        value: impl Into<MetricValue>,
        context: Context,
    ) -> Result<PostReport> {
        let point = MetricPoint::new(name, value, context)?;
        self.dispatch(point).await
    }

    /// Like [`post`](Self::post), stored under an explicit series name
    pub async fn post_to_series(
        &self,
        name: &str,
        value: impl Into<MetricValue>,
        series_name: &str,
        context: Context,
    ) -> Result<PostReport> {
        let point = MetricPoint::new(name, value, context)?.with_series(series_name);
        self.dispatch(point).await
    }

    /// Post the captured properties of a finished build
    ///
    /// Each property is delivered to the backends that declare a capture for
    /// `(builder_name, property)`, under series `<builder_name>-<property>`.
    pub async fn post_properties(
        &self,
        properties: &HashMap<String, MetricValue>,
        builder_name: &str,
    ) -> Result<PostReport> {
        let (backends, fanout) = self.begin().await?;
        let _guard = InFlightGuard(self);

        let mut report = PostReport::default();
        for (property, value) in properties {
            let interested: Vec<_> = backends
                .iter()
                .filter(|b| b.captures().find(builder_name, property).is_some())
                .cloned()
                .collect();
            if interested.is_empty() {
                continue;
            }

            let point = MetricPoint::new(property.as_str(), value.clone(), builder_context(builder_name))?;
            report.merge(fan_out(&interested, Arc::new(point), fanout).await);
        }

        Ok(report)
    }

    async fn dispatch(&self, point: MetricPoint) -> Result<PostReport> {
        let (backends, fanout) = self.begin().await?;
        let _guard = InFlightGuard(self);

        debug!(
            "Posting '{}' for builder '{}' to {} backend(s)",
            point.name(),
            point.builder_name(),
            backends.len()
        );

        Ok(fan_out(&backends, Arc::new(point), fanout).await)
    }

    /// Snapshot the backend set and register an in-flight post
    async fn begin(&self) -> Result<(BackendSet, FanoutMode)> {
        // Registering under the read lock orders this post against `stop`
        let inner = self.inner.read().await;
        if inner.state == ServiceState::Stopped {
            return Err(StatsError::Stopped);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok((inner.backends.clone(), inner.fanout))
    }

    /// Stop accepting posts and wait for in-flight ones to finish
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.write().await;
            if inner.state == ServiceState::Stopped {
                return;
            }
            inner.state = ServiceState::Stopped;
        }
        info!("Stopping StatsService");

        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            drained.await;
        }
        info!("StatsService stopped");
    }
}

struct InFlightGuard<'a>(&'a StatsService);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

async fn fan_out(
    backends: &[Arc<dyn StatsBackend>],
    point: Arc<MetricPoint>,
    fanout: FanoutMode,
) -> PostReport {
    let mut report = PostReport::default();

    match fanout {
        FanoutMode::Sequential => {
            for backend in backends {
                let result = backend.post(&point).await;
                report.record(backend.name(), result);
            }
        }
        FanoutMode::Concurrent => {
            let mut tasks = JoinSet::new();
            for (index, backend) in backends.iter().enumerate() {
                let backend = backend.clone();
                let point = point.clone();
                tasks.spawn(async move { (index, backend.post(&point).await) });
            }

            let mut results: Vec<Option<Result<()>>> = backends.iter().map(|_| None).collect();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, result)) => results[index] = Some(result),
                    Err(e) => error!("Stats backend task failed: {}", e),
                }
            }

            for (backend, result) in backends.iter().zip(results) {
                let result = result.unwrap_or_else(|| {
                    Err(StatsError::Offload("backend task did not complete".to_string()))
                });
                report.record(backend.name(), result);
            }
        }
    }

    report
}
