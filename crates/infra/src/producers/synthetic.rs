//! Local fake observations for development. Never touches the network.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Value as JsonValue, json};

use crate::config::ProducerMode;

use super::{Producer, ProducerBatch, ProducerError};

/// Country code, latitude, longitude.
const HOTSPOTS: &[(&str, f64, f64)] = &[
    ("US", 39.8, -98.6),
    ("CN", 35.9, 104.2),
    ("RU", 61.5, 105.3),
    ("BR", -14.2, -51.9),
    ("DE", 51.2, 10.5),
    ("IN", 20.6, 78.9),
    ("GB", 55.4, -3.4),
    ("JP", 36.2, 138.3),
    ("KR", 35.9, 127.8),
    ("NL", 52.1, 5.3),
    ("FR", 46.2, 2.2),
    ("VN", 14.1, 108.3),
];

/// Attack category and the protocol it rides on.
const CATEGORIES: &[(&str, &str)] = &[
    ("syn_flood", "TCP"),
    ("udp_flood", "UDP"),
    ("http_flood", "HTTP"),
    ("dns_amplification", "UDP"),
    ("ntp_amplification", "UDP"),
    ("icmp_flood", "ICMP"),
];

#[derive(Debug)]
pub struct SyntheticProducer {
    per_fetch: usize,
    rng: Mutex<StdRng>,
}

impl SyntheticProducer {
    pub fn new(per_fetch: usize) -> Self {
        Self {
            per_fetch,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic output for tests.
    pub fn seeded(per_fetch: usize, seed: u64) -> Self {
        Self {
            per_fetch,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn generate(&self, now: DateTime<Utc>) -> Result<Vec<JsonValue>, ProducerError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ProducerError::Unreachable("generator lock poisoned".to_string()))?;

        Ok((0..self.per_fetch)
            .map(|_| observation(&mut *rng, now))
            .collect())
    }
}

fn observation(rng: &mut StdRng, now: DateTime<Utc>) -> JsonValue {
    let (origin, target) = loop {
        let a = pick(rng, HOTSPOTS);
        let b = pick(rng, HOTSPOTS);
        if a.0 != b.0 {
            break (a, b);
        }
    };
    let (category, protocol) = pick(rng, CATEGORIES);

    json!({
        "category": category,
        "origin": location(rng, origin, true),
        "target": location(rng, target, false),
        "observed_at": now - Duration::seconds(rng.random_range(0..60)),
        "protocol": protocol,
        "magnitude": (rng.random_range(0.1..100.0_f64) * 100.0).round() / 100.0,
    })
}

fn pick<T: Copy>(rng: &mut StdRng, items: &[T]) -> T {
    // `items` are non-empty constants.
    *items.choose(rng).unwrap_or(&items[0])
}

fn location(rng: &mut StdRng, (cc, lat, lon): (&str, f64, f64), with_network: bool) -> JsonValue {
    let jitter = |rng: &mut StdRng| rng.random_range(-2.0..2.0_f64);
    let network = with_network.then(|| format!("198.51.100.{}", rng.random_range(1..255)));
    json!({
        "country_code": cc,
        "latitude": (lat + jitter(&mut *rng)).clamp(-90.0, 90.0),
        "longitude": (lon + jitter(&mut *rng)).clamp(-180.0, 180.0),
        "network": network,
    })
}

#[async_trait]
impl Producer for SyntheticProducer {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn mode(&self) -> ProducerMode {
        ProducerMode::Mock
    }

    async fn fetch(&self, _since: Option<DateTime<Utc>>) -> Result<ProducerBatch, ProducerError> {
        let now = Utc::now();
        Ok(ProducerBatch {
            observations: self.generate(now)?,
            window_end: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attackmap_core::RawObservation;

    #[tokio::test]
    async fn batches_have_configured_size_and_are_valid() {
        let producer = SyntheticProducer::seeded(25, 7);
        let batch = producer.fetch(None).await.unwrap();
        assert_eq!(batch.observations.len(), 25);

        for value in batch.observations {
            let raw: RawObservation = serde_json::from_value(value).unwrap();
            let record = raw.into_record("synthetic", Utc::now()).unwrap();
            assert_ne!(record.origin.country_code, record.target.country_code);
            assert!(record.magnitude >= 0.1);
        }
    }

    #[tokio::test]
    async fn seeded_generators_repeat() {
        let a = SyntheticProducer::seeded(3, 42);
        let b = SyntheticProducer::seeded(3, 42);
        let now = Utc::now();
        assert_eq!(a.generate(now).unwrap(), b.generate(now).unwrap());
    }
}
