//! Event record model.
//!
//! An [`EventRecord`] is one attack observation after it has been accepted by
//! the store. Producers hand us [`RawObservation`]s, which are loosely typed on
//! purpose: every field is optional so a single malformed entry can be
//! rejected without failing the whole batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::EventId;

/// Enrichment lifecycle of a record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// Not scored yet (also the permanent state when enrichment is disabled).
    Pending,
    /// Scored by the scoring collaborator.
    Enriched,
    /// Scoring failed; never retried.
    Skipped,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Enriched => "enriched",
            EnrichmentStatus::Skipped => "skipped",
        }
    }
}

impl core::fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EnrichmentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "enriched" => Ok(Self::Enriched),
            "skipped" => Ok(Self::Skipped),
            other => Err(CoreError::data_integrity(format!(
                "unknown enrichment status '{other}'"
            ))),
        }
    }
}

/// Coarse geographic / network location of one end of an attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2, upper case.
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// A stored attack observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    /// Producer that supplied the observation (e.g. `radar`, `synthetic`).
    pub source: String,
    /// Attack category tag as reported by the producer.
    pub category: String,
    pub origin: GeoLocation,
    pub target: GeoLocation,
    pub observed_at: DateTime<Utc>,
    pub protocol: String,
    /// Attack magnitude in the producer's unit (Gbps for radar data).
    pub magnitude: f64,
    pub enrichment: EnrichmentStatus,
    /// Confidence in `[0, 1]`; `None` until enriched.
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Apply a successful score.
    pub fn enrich(&mut self, score: f64) {
        self.enrichment = EnrichmentStatus::Enriched;
        self.confidence = Some(score);
    }

    /// Record a scoring failure. The score stays absent rather than zero.
    pub fn skip(&mut self) {
        self.enrichment = EnrichmentStatus::Skipped;
        self.confidence = None;
    }
}

/// Location as it arrives from a producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLocation {
    #[serde(default, alias = "country")]
    pub country_code: Option<String>,
    #[serde(default, alias = "lat")]
    pub latitude: Option<f64>,
    #[serde(default, alias = "lon", alias = "lng")]
    pub longitude: Option<f64>,
    #[serde(default, alias = "ip")]
    pub network: Option<String>,
}

/// An observation as it arrives from a producer (unvalidated).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    /// Producer-side identifier, when the producer has stable ones.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "attack_type")]
    pub category: Option<String>,
    #[serde(default)]
    pub origin: Option<RawLocation>,
    #[serde(default)]
    pub target: Option<RawLocation>,
    #[serde(default, alias = "timestamp")]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default, alias = "gbps")]
    pub magnitude: Option<f64>,
}

impl RawObservation {
    /// Validate and convert into a `pending` record.
    ///
    /// Identifiers are derived from the producer key when present so that
    /// overlapping windows map to the same record; otherwise a fresh id is used.
    pub fn into_record(self, source: &str, created_at: DateTime<Utc>) -> CoreResult<EventRecord> {
        let origin = validate_location("origin", self.origin)?;
        let target = validate_location("target", self.target)?;

        let observed_at = self
            .observed_at
            .ok_or_else(|| CoreError::data_integrity("missing observed_at"))?;

        let protocol = self
            .protocol
            .map(|p| p.trim().to_ascii_uppercase())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CoreError::data_integrity("missing protocol"))?;

        let magnitude = match self.magnitude {
            Some(m) if m.is_finite() && m >= 0.0 => m,
            Some(m) => {
                return Err(CoreError::data_integrity(format!("invalid magnitude {m}")));
            }
            None => return Err(CoreError::data_integrity("missing magnitude")),
        };

        let id = match self.id.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => EventId::stable(source, key),
            _ => EventId::new(),
        };

        let category = self
            .category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(EventRecord {
            id,
            source: source.to_string(),
            category,
            origin,
            target,
            observed_at,
            protocol,
            magnitude,
            enrichment: EnrichmentStatus::Pending,
            confidence: None,
            created_at,
        })
    }
}

fn validate_location(side: &str, raw: Option<RawLocation>) -> CoreResult<GeoLocation> {
    let raw = raw.ok_or_else(|| CoreError::data_integrity(format!("missing {side}")))?;

    let country_code = raw
        .country_code
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
        .ok_or_else(|| CoreError::data_integrity(format!("{side}: invalid country code")))?;

    let latitude = raw
        .latitude
        .filter(|v| (-90.0..=90.0).contains(v))
        .ok_or_else(|| CoreError::data_integrity(format!("{side}: invalid latitude")))?;

    let longitude = raw
        .longitude
        .filter(|v| (-180.0..=180.0).contains(v))
        .ok_or_else(|| CoreError::data_integrity(format!("{side}: invalid longitude")))?;

    Ok(GeoLocation {
        country_code,
        latitude,
        longitude,
        network: raw.network.filter(|n| !n.trim().is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(cc: &str, lat: f64, lon: f64) -> RawLocation {
        RawLocation {
            country_code: Some(cc.to_string()),
            latitude: Some(lat),
            longitude: Some(lon),
            network: None,
        }
    }

    fn valid_raw() -> RawObservation {
        RawObservation {
            id: Some("abc".to_string()),
            category: Some("syn_flood".to_string()),
            origin: Some(loc("us", 37.7, -122.4)),
            target: Some(loc("DE", 52.5, 13.4)),
            observed_at: Some(Utc::now()),
            protocol: Some("tcp".to_string()),
            magnitude: Some(12.5),
        }
    }

    #[test]
    fn valid_observation_becomes_pending_record() {
        let now = Utc::now();
        let record = valid_raw().into_record("radar", now).unwrap();

        assert_eq!(record.id, EventId::stable("radar", "abc"));
        assert_eq!(record.origin.country_code, "US");
        assert_eq!(record.protocol, "TCP");
        assert_eq!(record.enrichment, EnrichmentStatus::Pending);
        assert_eq!(record.confidence, None);
        assert_eq!(record.created_at, now);
    }

    #[test]
    fn missing_producer_id_generates_fresh_ids() {
        let mut a = valid_raw();
        a.id = None;
        let b = a.clone();

        let ra = a.into_record("radar", Utc::now()).unwrap();
        let rb = b.into_record("radar", Utc::now()).unwrap();
        assert_ne!(ra.id, rb.id);
    }

    #[test]
    fn malformed_fields_are_data_integrity_errors() {
        let mut bad_lat = valid_raw();
        bad_lat.origin = Some(loc("US", 123.0, 0.0));

        let mut negative = valid_raw();
        negative.magnitude = Some(-1.0);

        let mut nan = valid_raw();
        nan.magnitude = Some(f64::NAN);

        let mut no_target = valid_raw();
        no_target.target = None;

        let mut bad_country = valid_raw();
        bad_country.target = Some(loc("USA", 0.0, 0.0));

        for raw in [bad_lat, negative, nan, no_target, bad_country] {
            let err = raw.into_record("radar", Utc::now()).unwrap_err();
            assert!(matches!(err, CoreError::DataIntegrity(_)), "{err:?}");
        }
    }

    #[test]
    fn raw_observation_accepts_producer_aliases() {
        let json = serde_json::json!({
            "attack_type": "udp_flood",
            "origin": {"country": "CN", "lat": 39.9, "lon": 116.4, "ip": "203.0.113.7"},
            "target": {"country": "US", "lat": 40.7, "lng": -74.0},
            "timestamp": "2024-05-01T12:00:00Z",
            "protocol": "udp",
            "gbps": 3.5
        });

        let raw: RawObservation = serde_json::from_value(json).unwrap();
        let record = raw.into_record("radar", Utc::now()).unwrap();

        assert_eq!(record.category, "udp_flood");
        assert_eq!(record.origin.network.as_deref(), Some("203.0.113.7"));
        assert_eq!(record.magnitude, 3.5);
    }

    proptest::proptest! {
        #[test]
        fn coordinates_are_accepted_only_in_range(lat in -200.0f64..200.0, lon in -400.0f64..400.0) {
            let mut raw = valid_raw();
            raw.origin = Some(loc("US", lat, lon));
            let in_range = (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon);
            proptest::prop_assert_eq!(raw.into_record("radar", Utc::now()).is_ok(), in_range);
        }
    }

    #[test]
    fn enrichment_status_parses_case_insensitively() {
        assert_eq!("Enriched".parse::<EnrichmentStatus>().unwrap(), EnrichmentStatus::Enriched);
        assert!("done".parse::<EnrichmentStatus>().is_err());
    }
}
