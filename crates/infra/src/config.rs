//! Service configuration.
//!
//! Settings come from environment variables (optionally seeded from a `.env`
//! file). Names are matched case-insensitively. Unset optional values fall back
//! to defaults; values that are set but cannot be parsed are rejected rather
//! than silently replaced.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use attackmap_observability::LogFormat;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: String },
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Where the ingestion job gets its observations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProducerMode {
    /// Locally generated fake batches; no network calls.
    Mock,
    /// Remote HTTP producer; never fabricates data.
    Live,
}

impl ProducerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProducerMode::Mock => "mock",
            ProducerMode::Live => "live",
        }
    }
}

impl core::str::FromStr for ProducerMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "live" => Ok(Self::Live),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Postgres URL; in-memory durable store when unset.
    pub database_url: Option<String>,
    /// Redis URL; in-memory cache when unset.
    pub redis_url: Option<String>,

    pub abuseipdb_key: Option<String>,
    pub cloudflare_api_token: Option<String>,
    pub radar_api_url: Option<String>,

    pub enable_abuseipdb: bool,
    pub enable_real_radar_data: bool,
    pub cloudflare_source: ProducerMode,
    pub mock_event_generation: bool,

    /// Outbound messages per second per subscriber.
    pub websocket_rate_limit: u32,
    pub max_websocket_connections: usize,

    pub radar_fetch_interval: Duration,
    pub enrich_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,

    pub events_per_fetch: usize,
    pub max_events_cache_size: usize,
    pub enrich_batch_size: usize,

    pub external_timeout: Duration,
    pub health_timeout: Duration,
    pub shutdown_grace: Duration,

    pub log_level: String,
    pub log_format: LogFormat,
    pub debug: bool,

    pub bind_addr: SocketAddr,
    /// Browser origins allowed to call the API.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            abuseipdb_key: None,
            cloudflare_api_token: None,
            radar_api_url: None,
            enable_abuseipdb: false,
            enable_real_radar_data: false,
            cloudflare_source: ProducerMode::Mock,
            mock_event_generation: true,
            websocket_rate_limit: 1,
            max_websocket_connections: 100,
            radar_fetch_interval: Duration::from_secs(30),
            enrich_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(24 * 3600),
            events_per_fetch: 10,
            max_events_cache_size: 1000,
            enrich_batch_size: 50,
            external_timeout: Duration::from_millis(5000),
            health_timeout: Duration::from_millis(2000),
            shutdown_grace: Duration::from_secs(10),
            log_level: "INFO".to_string(),
            log_format: LogFormat::Json,
            debug: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

impl Settings {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let vars: HashMap<String, String> = std::env::vars()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();

        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Load from an arbitrary lookup; keys are requested in upper case.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let d = Settings::default();

        let settings = Settings {
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            abuseipdb_key: env.string("ABUSEIPDB_KEY"),
            cloudflare_api_token: env.string("CLOUDFLARE_API_TOKEN"),
            radar_api_url: env.string("RADAR_API_URL"),
            enable_abuseipdb: env.flag("ENABLE_ABUSEIPDB", d.enable_abuseipdb)?,
            enable_real_radar_data: env.flag("ENABLE_REAL_RADAR_DATA", d.enable_real_radar_data)?,
            cloudflare_source: env.parsed("CLOUDFLARE_SOURCE", d.cloudflare_source)?,
            mock_event_generation: env.flag("MOCK_EVENT_GENERATION", d.mock_event_generation)?,
            websocket_rate_limit: env.parsed("WEBSOCKET_RATE_LIMIT", d.websocket_rate_limit)?,
            max_websocket_connections: env
                .parsed("MAX_WEBSOCKET_CONNECTIONS", d.max_websocket_connections)?,
            radar_fetch_interval: env.secs("RADAR_FETCH_INTERVAL_SECONDS", d.radar_fetch_interval)?,
            enrich_interval: env.secs("ABUSEIP_ENRICH_INTERVAL_SECONDS", d.enrich_interval)?,
            cleanup_interval: env.secs("CLEANUP_INTERVAL_SECONDS", d.cleanup_interval)?,
            retention: env
                .parsed::<u64>("EVENT_CLEANUP_HOURS", d.retention.as_secs() / 3600)
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))?,
            events_per_fetch: env.parsed("EVENTS_PER_FETCH", d.events_per_fetch)?,
            max_events_cache_size: env.parsed("MAX_EVENTS_CACHE_SIZE", d.max_events_cache_size)?,
            enrich_batch_size: env.parsed("ENRICH_BATCH_SIZE", d.enrich_batch_size)?,
            external_timeout: env.millis("EXTERNAL_TIMEOUT_MS", d.external_timeout)?,
            health_timeout: env.millis("HEALTH_TIMEOUT_MS", d.health_timeout)?,
            shutdown_grace: env.secs("SHUTDOWN_GRACE_SECONDS", d.shutdown_grace)?,
            log_level: env.string("LOG_LEVEL").unwrap_or(d.log_level),
            log_format: env.parsed("LOG_FORMAT", d.log_format)?,
            debug: env.flag("DEBUG", d.debug)?,
            bind_addr: env.parsed("BIND_ADDR", d.bind_addr)?,
            cors_allowed_origins: env.origins("CORS_ALLOWED_ORIGINS", d.cors_allowed_origins)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall the scheduler or the fan-out.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("RADAR_FETCH_INTERVAL_SECONDS", self.radar_fetch_interval.is_zero()),
            ("ABUSEIP_ENRICH_INTERVAL_SECONDS", self.enrich_interval.is_zero()),
            ("CLEANUP_INTERVAL_SECONDS", self.cleanup_interval.is_zero()),
            ("MAX_WEBSOCKET_CONNECTIONS", self.max_websocket_connections == 0),
            ("WEBSOCKET_RATE_LIMIT", self.websocket_rate_limit == 0),
            ("MAX_EVENTS_CACHE_SIZE", self.max_events_cache_size == 0),
            ("ENRICH_BATCH_SIZE", self.enrich_batch_size == 0),
        ];

        match checks.iter().find(|(_, zero)| *zero) {
            Some((key, _)) => Err(ConfigError::Zero {
                key: (*key).to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Live producer only when real data is enabled and the source says so.
    pub fn producer_mode(&self) -> Option<ProducerMode> {
        if self.enable_real_radar_data && self.cloudflare_source == ProducerMode::Live {
            Some(ProducerMode::Live)
        } else if self.mock_event_generation {
            Some(ProducerMode::Mock)
        } else {
            None
        }
    }

    pub fn environment(&self) -> &'static str {
        if self.debug { "development" } else { "production" }
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: core::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::invalid(key, &raw)),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &raw)),
            },
            None => Ok(default),
        }
    }

    /// Comma-separated `http(s)://host[:port]` origins.
    fn origins(&self, key: &str, default: Vec<String>) -> Result<Vec<String>, ConfigError> {
        let Some(raw) = self.string(key) else {
            return Ok(default);
        };
        raw.split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(|o| {
                let o = o.trim_end_matches('/');
                let host = o
                    .strip_prefix("http://")
                    .or_else(|| o.strip_prefix("https://"))
                    .unwrap_or_default();
                if host.is_empty() || host.contains(['/', ' ']) {
                    Err(ConfigError::invalid(key, o))
                } else {
                    Ok(o.to_string())
                }
            })
            .collect()
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}
