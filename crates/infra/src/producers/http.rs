//! Remote producer reached over HTTP.
//!
//! The endpoint answers `GET {url}?since=<rfc3339>` with either a bare JSON
//! array of observations or an object:
//!
//! ```json
//! { "observations": [ ... ], "window_end": "2024-05-01T12:00:00Z" }
//! ```
//!
//! This producer never fabricates data: any failure is reported as an error
//! and the ingestion cycle is skipped.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::ProducerMode;

use super::{Producer, ProducerBatch, ProducerError};

#[derive(Debug, Clone)]
pub struct HttpProducer {
    name: String,
    client: reqwest::Client,
    url: Option<String>,
    token: Option<String>,
}

impl HttpProducer {
    pub fn new(
        name: impl Into<String>,
        url: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProducerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProducerError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self {
            name: name.into(),
            client,
            url,
            token,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    List(Vec<JsonValue>),
    Envelope {
        observations: Vec<JsonValue>,
        #[serde(default)]
        window_end: Option<DateTime<Utc>>,
    },
}

fn parse_payload(body: JsonValue, fetched_at: DateTime<Utc>) -> Result<ProducerBatch, ProducerError> {
    let payload: Payload =
        serde_json::from_value(body).map_err(|e| ProducerError::Malformed(e.to_string()))?;

    Ok(match payload {
        Payload::List(observations) => ProducerBatch {
            observations,
            window_end: fetched_at,
        },
        Payload::Envelope {
            observations,
            window_end,
        } => ProducerBatch {
            observations,
            window_end: window_end.unwrap_or(fetched_at),
        },
    })
}

fn map_reqwest_error(err: reqwest::Error) -> ProducerError {
    if err.is_timeout() {
        ProducerError::Timeout
    } else if err.is_decode() {
        ProducerError::Malformed(err.to_string())
    } else {
        ProducerError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl Producer for HttpProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> ProducerMode {
        ProducerMode::Live
    }

    fn is_configured(&self) -> bool {
        self.url.is_some() && self.token.is_some()
    }

    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<ProducerBatch, ProducerError> {
        let (Some(url), Some(token)) = (self.url.as_deref(), self.token.as_deref()) else {
            return Err(ProducerError::NotConfigured(format!(
                "{} needs an endpoint URL and an API token",
                self.name
            )));
        };

        let mut request = self.client.get(url).bearer_auth(token);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }

        let fetched_at = Utc::now();
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProducerError::Unreachable(format!("{url} answered {status}")));
        }

        let body: JsonValue = response.json().await.map_err(map_reqwest_error)?;
        let batch = parse_payload(body, fetched_at)?;
        debug!(producer = %self.name, observations = batch.observations.len(), "fetched batch");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_list_uses_fetch_time_as_window_end() {
        let now = Utc::now();
        let batch = parse_payload(json!([{"protocol": "TCP"}, {}]), now).unwrap();
        assert_eq!(batch.observations.len(), 2);
        assert_eq!(batch.window_end, now);
    }

    #[test]
    fn envelope_carries_its_own_window_end() {
        let batch = parse_payload(
            json!({"observations": [], "window_end": "2024-05-01T12:00:00Z"}),
            Utc::now(),
        )
        .unwrap();
        assert!(batch.observations.is_empty());
        assert_eq!(batch.window_end.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn other_shapes_are_malformed() {
        let err = parse_payload(json!({"result": 3}), Utc::now()).unwrap_err();
        assert!(matches!(err, ProducerError::Malformed(_)));
    }

    #[tokio::test]
    async fn missing_credentials_never_reach_the_network() {
        let producer = HttpProducer::new("radar", Some("http://127.0.0.1:9".into()), None, Duration::from_millis(50)).unwrap();
        assert!(!producer.is_configured());
        let err = producer.fetch(None).await.unwrap_err();
        assert!(matches!(err, ProducerError::NotConfigured(_)));
    }
}
