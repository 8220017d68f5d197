//! Composite health of the store backends and external collaborators.
//!
//! Every call to [`HealthAggregator::check`] probes fresh; nothing is cached.
//! Backend probes run concurrently under one shared deadline, so a hung
//! dependency costs at most the configured timeout and only marks itself.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use attackmap_scoring::Scorer;

use crate::producers::Producer;
use crate::store::{SharedEventStore, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    /// Whether this component decides the overall status.
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        self.status != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: OverallStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub services: BTreeMap<String, ComponentHealth>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liveness {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
}

/// Feature switches reported by [`HealthAggregator::version`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub enrichment_enabled: bool,
    pub real_data_enabled: bool,
    pub mock_events: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub commit_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
    pub environment: String,
    pub features: FeatureFlags,
}

enum External {
    Producer(Arc<dyn Producer>),
    Scorer(Arc<dyn Scorer>),
}

struct ExternalEntry {
    key: String,
    enabled: bool,
    target: External,
}

/// Builds health, readiness, liveness and version reports.
pub struct HealthAggregator {
    store: SharedEventStore,
    timeout: Duration,
    started: Instant,
    environment: String,
    features: FeatureFlags,
    externals: Vec<ExternalEntry>,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("timeout", &self.timeout)
            .field("externals", &self.externals.iter().map(|e| &e.key).collect::<Vec<_>>())
            .finish()
    }
}

impl HealthAggregator {
    pub fn new(store: SharedEventStore, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            started: Instant::now(),
            environment: "production".to_string(),
            features: FeatureFlags::default(),
            externals: Vec::new(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Report a producer under `key`. Never affects the overall status.
    pub fn with_producer(mut self, key: impl Into<String>, producer: Arc<dyn Producer>, enabled: bool) -> Self {
        self.externals.push(ExternalEntry {
            key: key.into(),
            enabled,
            target: External::Producer(producer),
        });
        self
    }

    /// Report the scoring collaborator under `key`. Never affects the overall status.
    pub fn with_scorer(mut self, key: impl Into<String>, scorer: Arc<dyn Scorer>, enabled: bool) -> Self {
        self.externals.push(ExternalEntry {
            key: key.into(),
            enabled,
            target: External::Scorer(scorer),
        });
        self
    }

    /// Probe everything and synthesize one snapshot.
    ///
    /// `degraded` iff the durable store or the cache is unhealthy.
    pub async fn check(&self) -> HealthSnapshot {
        let deadline = Instant::now() + self.timeout;

        let (database, cache) = tokio::join!(
            probe(deadline, self.store.ping_durable()),
            probe(deadline, self.store.ping_cache()),
        );

        let mut services = BTreeMap::new();
        services.insert(
            "database".to_string(),
            backend_health(self.store.durable_backend(), database),
        );
        services.insert(
            "cache".to_string(),
            backend_health(self.store.cache_backend(), cache),
        );
        for entry in &self.externals {
            services.insert(entry.key.clone(), external_health(entry));
        }

        let degraded = services
            .values()
            .any(|c| c.required && !c.is_healthy());
        if degraded {
            warn!(
                failing = ?services
                    .iter()
                    .filter(|(_, c)| c.required && !c.is_healthy())
                    .map(|(k, _)| k.as_str())
                    .collect::<Vec<_>>(),
                "health degraded"
            );
        }

        HealthSnapshot {
            status: if degraded {
                OverallStatus::Degraded
            } else {
                OverallStatus::Healthy
            },
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services,
        }
    }

    /// Ready iff both store backends answer within the deadline.
    pub async fn ready(&self) -> Readiness {
        let deadline = Instant::now() + self.timeout;
        let (database, cache) = tokio::join!(
            probe(deadline, self.store.ping_durable()),
            probe(deadline, self.store.ping_cache()),
        );

        let failing: Vec<String> = [("database", database), ("cache", cache)]
            .into_iter()
            .filter(|(_, p)| p.result.is_err())
            .map(|(name, _)| name.to_string())
            .collect();

        Readiness {
            ready: failing.is_empty(),
            failing,
        }
    }

    pub fn live(&self) -> Liveness {
        Liveness {
            status: "alive".to_string(),
            timestamp: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit_hash: option_env!("ATTACKMAP_COMMIT").unwrap_or("dev").to_string(),
            build_date: option_env!("ATTACKMAP_BUILD_DATE").map(str::to_string),
            environment: self.environment.clone(),
            features: self.features,
        }
    }
}

struct Probe {
    result: Result<(), String>,
    elapsed: Duration,
}

async fn probe<F>(deadline: Instant, fut: F) -> Probe
where
    F: Future<Output = Result<(), StoreError>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timed out".to_string()),
    };
    Probe {
        result,
        elapsed: started.elapsed(),
    }
}

fn backend_health(backend: &str, probe: Probe) -> ComponentHealth {
    let (status, error) = match probe.result {
        Ok(()) => (ComponentStatus::Healthy, None),
        Err(e) => (ComponentStatus::Unhealthy, Some(e)),
    };
    ComponentHealth {
        status,
        required: true,
        backend: Some(backend.to_string()),
        mode: None,
        configured: None,
        response_time_ms: Some(probe.elapsed.as_millis() as u64),
        error,
    }
}

fn external_health(entry: &ExternalEntry) -> ComponentHealth {
    let (configured, mode) = match &entry.target {
        External::Producer(p) => (p.is_configured(), Some(p.mode().as_str().to_string())),
        External::Scorer(s) => (s.is_configured(), Some(s.name().to_string())),
    };

    let status = match (entry.enabled, configured) {
        (false, _) => ComponentStatus::Disabled,
        (true, true) => ComponentStatus::Healthy,
        (true, false) => ComponentStatus::Unhealthy,
    };

    ComponentHealth {
        status,
        required: false,
        backend: None,
        mode,
        configured: Some(configured),
        response_time_ms: None,
        error: (status == ComponentStatus::Unhealthy).then(|| "not configured".to_string()),
    }
}
