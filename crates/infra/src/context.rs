//! Application context: every shared component, built once at startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use attackmap_core::EventRecord;
use attackmap_events::{FanoutConfig, FanoutManager};
use attackmap_scoring::{HeuristicScorer, Scorer};

use crate::config::{ProducerMode, Settings};
use crate::health::{FeatureFlags, HealthAggregator};
use crate::jobs::{JobConfig, JobScheduler, SchedulerError, SchedulerHandle};
use crate::pipeline::{EnrichmentJob, IngestionJob, RetentionJob};
use crate::producers::{HttpProducer, Producer, ProducerError, SyntheticProducer};
use crate::store::{
    DurableStore, InMemoryCache, InMemoryDurableStore, PostgresEventStore, SharedEventStore,
    StoreError, VolatileCache,
};

/// Closes external connections when dropped.
///
/// Held for the lifetime of the process so that every exit path, including
/// startup failures after the pool was opened, releases connections.
#[derive(Debug, Default)]
pub struct ResourceGuard {
    postgres: Option<PostgresEventStore>,
}

impl ResourceGuard {
    /// Close everything now and wait for it.
    pub async fn release(mut self) {
        if let Some(pg) = self.postgres.take() {
            pg.close().await;
            info!("postgres pool closed");
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let Some(pg) = self.postgres.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pg.close().await });
            }
            Err(_) => warn!("no runtime to close postgres pool; connections dropped"),
        }
    }
}

/// The two storage backends plus the guard that owns their connections.
pub struct Backends {
    pub durable: Arc<dyn DurableStore>,
    pub cache: Arc<dyn VolatileCache>,
    pub guard: ResourceGuard,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("durable", &self.durable.backend())
            .field("cache", &self.cache.backend())
            .finish()
    }
}

impl Backends {
    pub fn in_memory(settings: &Settings) -> Self {
        Self {
            durable: Arc::new(InMemoryDurableStore::new()),
            cache: Arc::new(InMemoryCache::new(settings.max_events_cache_size)),
            guard: ResourceGuard::default(),
        }
    }

    /// Connect to Postgres and Redis when configured; in-memory otherwise.
    pub async fn acquire(settings: &Settings) -> Result<Self, StoreError> {
        let mut guard = ResourceGuard::default();

        let durable: Arc<dyn DurableStore> = match settings.database_url.as_deref() {
            Some(url) => {
                let pg = PostgresEventStore::connect(url, settings.external_timeout).await?;
                guard.postgres = Some(pg.clone());
                pg.ensure_schema().await?;
                info!("using postgres durable store");
                Arc::new(pg)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory durable store");
                Arc::new(InMemoryDurableStore::new())
            }
        };

        let cache = Self::acquire_cache(settings).await?;

        Ok(Self {
            durable,
            cache,
            guard,
        })
    }

    #[cfg(feature = "redis")]
    async fn acquire_cache(settings: &Settings) -> Result<Arc<dyn VolatileCache>, StoreError> {
        match settings.redis_url.as_deref() {
            Some(url) => {
                let cache =
                    crate::store::RedisEventCache::connect(url, settings.max_events_cache_size).await?;
                info!("using redis cache");
                Ok(Arc::new(cache))
            }
            None => {
                warn!("REDIS_URL not set; using in-memory cache");
                Ok(Arc::new(InMemoryCache::new(settings.max_events_cache_size)))
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn acquire_cache(settings: &Settings) -> Result<Arc<dyn VolatileCache>, StoreError> {
        if settings.redis_url.is_some() {
            warn!("REDIS_URL set but redis support is not compiled in; using in-memory cache");
        }
        Ok(Arc::new(InMemoryCache::new(settings.max_events_cache_size)))
    }
}

/// Everything the jobs and the route layer share.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub store: SharedEventStore,
    pub fanout: FanoutManager<EventRecord>,
    pub health: Arc<HealthAggregator>,
    producer: Option<Arc<dyn Producer>>,
    scorer: Arc<dyn Scorer>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("store", &self.store)
            .field("fanout", &self.fanout)
            .field("producer", &self.producer.as_ref().map(|p| p.name().to_string()))
            .field("scorer", &self.scorer.name())
            .finish()
    }
}

impl AppContext {
    pub fn build(settings: Settings, durable: Arc<dyn DurableStore>, cache: Arc<dyn VolatileCache>) -> Result<Self, ProducerError> {
        let fanout = FanoutManager::new(
            FanoutConfig::default()
                .with_max_connections(settings.max_websocket_connections)
                .with_rate(settings.websocket_rate_limit),
        );
        let store = SharedEventStore::new(durable, cache, Arc::new(fanout.clone()));

        let producer: Option<Arc<dyn Producer>> = match settings.producer_mode() {
            Some(ProducerMode::Mock) => Some(Arc::new(SyntheticProducer::new(settings.events_per_fetch))),
            Some(ProducerMode::Live) => Some(Arc::new(HttpProducer::new(
                "radar",
                settings.radar_api_url.clone(),
                settings.cloudflare_api_token.clone(),
                settings.external_timeout,
            )?)),
            None => None,
        };
        let scorer: Arc<dyn Scorer> = Arc::new(HeuristicScorer::new());

        let mut health = HealthAggregator::new(store.clone(), settings.health_timeout)
            .with_environment(settings.environment())
            .with_features(FeatureFlags {
                enrichment_enabled: settings.enable_abuseipdb,
                real_data_enabled: settings.enable_real_radar_data,
                mock_events: settings.mock_event_generation,
            })
            .with_scorer("scoring", scorer.clone(), settings.enable_abuseipdb);
        if let Some(p) = &producer {
            health = health.with_producer("cloudflare_radar", p.clone(), true);
        }

        Ok(Self {
            settings: Arc::new(settings),
            store,
            fanout,
            health: Arc::new(health),
            producer,
            scorer,
        })
    }

    /// Register ingestion, enrichment and retention, then start them.
    pub fn start_jobs(&self) -> Result<SchedulerHandle, SchedulerError> {
        let s = &self.settings;
        let mut scheduler = JobScheduler::new();

        match &self.producer {
            Some(producer) => scheduler.register(
                Arc::new(IngestionJob::new(producer.clone(), self.store.clone(), s.external_timeout)),
                JobConfig::every(s.radar_fetch_interval),
            )?,
            None => info!("no producer configured; ingestion disabled"),
        }

        scheduler.register(
            Arc::new(EnrichmentJob::new(
                self.store.clone(),
                self.scorer.clone(),
                s.enrich_batch_size,
                s.external_timeout,
            )),
            JobConfig::every(s.enrich_interval).enabled(s.enable_abuseipdb),
        )?;

        scheduler.register(
            Arc::new(RetentionJob::new(self.store.clone(), s.retention)),
            JobConfig::every(s.cleanup_interval),
        )?;

        Ok(scheduler.start())
    }

    /// Stop jobs, then close subscriber streams, all within one `grace`.
    ///
    /// Jobs get at most half; the fan-out gets whatever is left. Safe to call
    /// more than once.
    pub async fn shutdown(&self, scheduler: &SchedulerHandle, grace: Duration) {
        let deadline = Instant::now() + grace;

        let aborted = scheduler.shutdown(grace / 2).await;
        if !aborted.is_empty() {
            warn!(jobs = ?aborted, "jobs aborted after grace period");
        }

        self.fanout
            .close_all(deadline.saturating_duration_since(Instant::now()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|k| map.get(k).cloned()).unwrap()
    }

    #[tokio::test]
    async fn unset_urls_fall_back_to_memory() {
        let s = settings(&[]);
        let backends = Backends::acquire(&s).await.unwrap();
        assert_eq!(backends.durable.backend(), "memory");
        assert_eq!(backends.cache.backend(), "memory");
    }

    #[tokio::test]
    async fn enrichment_is_listed_disabled_when_flag_is_off() {
        let s = settings(&[("CLEANUP_INTERVAL_SECONDS", "3600")]);
        let backends = Backends::in_memory(&s);
        let ctx = AppContext::build(s, backends.durable, backends.cache).unwrap();
        let handle = ctx.start_jobs().unwrap();

        let jobs = handle.describe_jobs();
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec![IngestionJob::NAME, EnrichmentJob::NAME, RetentionJob::NAME]);
        assert!(!jobs[1].enabled);

        handle.shutdown(std::time::Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn no_producer_means_no_ingestion_job() {
        let s = settings(&[("MOCK_EVENT_GENERATION", "false")]);
        let backends = Backends::in_memory(&s);
        let ctx = AppContext::build(s, backends.durable, backends.cache).unwrap();
        let handle = ctx.start_jobs().unwrap();

        assert!(handle.describe_jobs().iter().all(|j| j.name != IngestionJob::NAME));
        handle.shutdown(std::time::Duration::from_secs(1)).await;
    }

    struct Hangs;

    #[async_trait::async_trait]
    impl crate::jobs::Job for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn run(&self) -> Result<(), crate::jobs::JobError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fits_jobs_and_streams_in_one_grace_period() {
        let s = settings(&[]);
        let backends = Backends::in_memory(&s);
        let ctx = AppContext::build(s, backends.durable, backends.cache).unwrap();

        let mut scheduler = JobScheduler::new();
        scheduler
            .register(Arc::new(Hangs), JobConfig::every(Duration::from_secs(1)))
            .unwrap();
        let handle = scheduler.start();

        let (transport, _rx) = attackmap_events::ChannelTransport::<EventRecord>::pair(1);
        ctx.fanout.subscribe(transport).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let grace = Duration::from_secs(10);
        let started = Instant::now();
        ctx.shutdown(&handle, grace).await;

        assert!(started.elapsed() <= grace);
        assert_eq!(ctx.fanout.live_count(), 0);
        let hangs = &handle.describe_jobs()[0];
        assert!(!hangs.running);
        assert_eq!(hangs.failures, 1);

        // Second call is a no-op.
        let again = Instant::now();
        ctx.shutdown(&handle, grace).await;
        assert!(again.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn ingest_enrich_and_expire_a_full_batch() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use attackmap_core::EnrichmentStatus;
        use chrono::Utc;
        use attackmap_scoring::{FnScorer, ScoreError};

        use crate::jobs::Job;
        use crate::store::RecentQuery;

        let s = settings(&[("ENABLE_ABUSEIPDB", "true"), ("EVENTS_PER_FETCH", "10")]);
        let backends = Backends::in_memory(&s);
        let ctx = AppContext::build(s, backends.durable, backends.cache).unwrap();
        let (transport, mut rx) = attackmap_events::ChannelTransport::<EventRecord>::pair(64);
        ctx.fanout.subscribe(transport).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let scorer = FnScorer::new("flaky", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ScoreError::Unavailable("rate limited".into()))
            } else {
                Ok(0.75)
            }
        });

        let ingestion = IngestionJob::new(
            Arc::new(SyntheticProducer::seeded(10, 7)),
            ctx.store.clone(),
            Duration::from_secs(1),
        );
        ingestion.run().await.unwrap();
        assert_eq!(ingestion.stats().written, 10);
        let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(pushed.created_at <= Utc::now());

        let enrichment = EnrichmentJob::new(ctx.store.clone(), Arc::new(scorer), 50, Duration::from_secs(1));
        enrichment.run().await.unwrap();
        let stats = enrichment.stats();
        assert_eq!((stats.enriched, stats.skipped), (8, 2));

        let all = ctx.store.recent(&RecentQuery::latest(100)).await.unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all.iter().filter(|r| r.enrichment == EnrichmentStatus::Enriched).count(), 8);
        assert!(all
            .iter()
            .filter(|r| r.enrichment == EnrichmentStatus::Skipped)
            .all(|r| r.confidence.is_none()));

        RetentionJob::new(ctx.store.clone(), Duration::from_secs(3600)).run().await.unwrap();
        assert_eq!(ctx.store.recent(&RecentQuery::latest(100)).await.unwrap().len(), 10);

        tokio::time::sleep(Duration::from_millis(5)).await;
        RetentionJob::new(ctx.store.clone(), Duration::ZERO).run().await.unwrap();
        assert!(ctx.store.recent(&RecentQuery::latest(100)).await.unwrap().is_empty());
    }
}
