//! MatcherClient (spec.md §4.2): turns an ordered coordinate list into a
//! snapped polyline by calling an external OSRM-compatible map-matching
//! service. Outcomes are a sum type, never an exception — `DeviceProcessor`
//! switches on the variant (spec.md §9).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::MatcherConfig;
use crate::geomath::Vertex;

#[derive(Debug, Clone)]
pub struct Matched {
    pub coordinates: Vec<Vertex>,
    pub confidence: f64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Matched(Matched),
    NoMatch,
    TransportError { retryable: bool },
}

#[async_trait]
pub trait MatcherClient: Send + Sync {
    /// `points` is an ordered list of `(lon, lat)` pairs, length >= 2.
    async fn match_route(&self, points: &[(f64, f64)]) -> MatchOutcome;
}

pub struct OsrmMatcherClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OsrmMatcherClient {
    pub fn new(config: &MatcherConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OsrmMatchResponse {
    code: String,
    #[serde(default)]
    matchings: Vec<OsrmMatching>,
}

#[derive(Debug, Deserialize)]
struct OsrmMatching {
    geometry: OsrmGeometry,
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

#[async_trait]
impl MatcherClient for OsrmMatcherClient {
    async fn match_route(&self, points: &[(f64, f64)]) -> MatchOutcome {
        let coords = points
            .iter()
            .map(|(lon, lat)| format!("{lon},{lat}"))
            .collect::<Vec<_>>()
            .join(";");
        let url = format!(
            "{}/match/v1/driving/{coords}?overview=full&geometries=geojson",
            self.base_url
        );

        let started = std::time::Instant::now();
        let response = match self.http.get(&url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "matcher request failed");
                return MatchOutcome::TransportError { retryable: true };
            }
        };

        if response.status().is_server_error() {
            warn!(status = %response.status(), "matcher returned server error");
            return MatchOutcome::TransportError { retryable: true };
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "matcher returned client error");
            return MatchOutcome::TransportError { retryable: false };
        }

        let body: OsrmMatchResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to decode matcher response");
                return MatchOutcome::TransportError { retryable: false };
            }
        };

        if body.code != "Ok" {
            return MatchOutcome::NoMatch;
        }

        let Some(matching) = body.matchings.into_iter().next() else {
            return MatchOutcome::NoMatch;
        };

        let coordinates: Vec<Vertex> = matching
            .geometry
            .coordinates
            .iter()
            .map(|[lon, lat]| Vertex::new(*lat, *lon))
            .collect();

        if coordinates.len() < 2 {
            return MatchOutcome::NoMatch;
        }

        MatchOutcome::Matched(Matched {
            coordinates,
            confidence: matching.confidence.clamp(0.0, 1.0),
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// In-memory matcher for unit tests — returns the queued outcome for
    /// each call in order, repeating the last one once exhausted.
    pub struct FakeMatcherClient {
        outcomes: Mutex<Vec<MatchOutcome>>,
    }

    impl FakeMatcherClient {
        pub fn new(outcomes: Vec<MatchOutcome>) -> Self {
            Self { outcomes: Mutex::new(outcomes) }
        }
    }

    #[async_trait]
    impl MatcherClient for FakeMatcherClient {
        async fn match_route(&self, _points: &[(f64, f64)]) -> MatchOutcome {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes.first().cloned().unwrap_or(MatchOutcome::NoMatch)
            }
        }
    }
}
