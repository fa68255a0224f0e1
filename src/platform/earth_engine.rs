//! Earth Engine REST client.
//!
//! Sends reduction requests to `projects/{project}/value:compute` and maps
//! every failure into a [`PlatformError`].

use super::error::PlatformError;
use super::expression::{reduce_regions_request, ROW_KEY_PROPERTY};
use super::ComputePlatform;
use crate::models::{AggregationRequest, PolygonCollection, ResultRow, ResultTable};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for the Earth Engine REST API.
#[derive(Debug, Clone)]
pub struct EarthEngineConfig {
    pub api_url: String,
    pub project: String,
    /// OAuth2 access token sent as a bearer token.
    pub token: String,
    pub timeout_seconds: u64,
}

/// `value:compute` response.
#[derive(Debug, Deserialize)]
struct ComputeResponse {
    result: FeatureCollectionPayload,
}

#[derive(Debug, Deserialize)]
struct FeatureCollectionPayload {
    #[serde(default)]
    features: Vec<FeaturePayload>,
}

#[derive(Debug, Deserialize)]
struct FeaturePayload {
    #[serde(default)]
    properties: Map<String, Value>,
}

/// Google API error envelope.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    status: String,
}

/// Client for the Earth Engine REST API.
pub struct EarthEngineClient {
    config: EarthEngineConfig,
    http_client: reqwest::Client,
}

impl EarthEngineClient {
    pub fn new(config: EarthEngineConfig) -> Result<Self> {
        info!(
            "Using Earth Engine at {} (project {})",
            config.api_url, config.project
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn compute_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/value:compute",
            self.config.api_url.trim_end_matches('/'),
            self.config.project
        )
    }
}

impl ComputePlatform for EarthEngineClient {
    async fn reduce_regions(
        &self,
        request: &AggregationRequest<'_>,
    ) -> Result<ResultTable, PlatformError> {
        let url = self.compute_url();
        let body = reduce_regions_request(request);

        debug!(
            "Sending reduceRegions over {} polygons (scale={}, tileScale={:?})",
            request.polygons.len(),
            request.scale,
            request.tile_scale
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PlatformError::classify(
                        "Timeout",
                        format!("Request timed out after {}s", self.config.timeout_seconds),
                    )
                } else if e.is_connect() {
                    PlatformError::classify(
                        "ConnectionError",
                        format!("Cannot connect to Earth Engine at {}", self.config.api_url),
                    )
                } else {
                    PlatformError::classify("RequestError", format!("Failed to send request: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_body(status, &body));
        }

        let compute: ComputeResponse = response.json().await.map_err(|e| {
            PlatformError::opaque(
                "DecodeError",
                format!("Failed to parse Earth Engine response: {}", e),
            )
        })?;

        let properties = compute
            .result
            .features
            .into_iter()
            .map(|f| f.properties)
            .collect();

        table_from_properties(request.polygons, properties)
    }
}

/// Turn a non-success HTTP response into a classified error.
fn error_from_body(status: reqwest::StatusCode, body: &str) -> PlatformError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(envelope) => {
            let kind = if envelope.error.status.is_empty() {
                "HttpError".to_string()
            } else {
                envelope.error.status
            };
            PlatformError::classify(kind, envelope.error.message)
        }
        Err(_) => PlatformError::classify(
            "HttpError",
            format!("Earth Engine API error {}: {}", status, body),
        ),
    }
}

/// Build a result table from the properties of the returned features.
///
/// Returned features are matched to polygons on their row key. Rows follow
/// the input polygon order and carry the source attributes. Columns are
/// every other property the platform returned, sorted by name.
fn table_from_properties(
    polygons: &PolygonCollection,
    features: Vec<Map<String, Value>>,
) -> Result<ResultTable, PlatformError> {
    let id_field = polygons.id_field.as_str();
    let attributes = polygons.attribute_names();

    let columns: Vec<String> = features
        .iter()
        .flat_map(|props| props.keys())
        .filter(|k| {
            k.as_str() != id_field && k.as_str() != ROW_KEY_PROPERTY && !attributes.contains(k)
        })
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let by_row: HashMap<u64, &Map<String, Value>> = features
        .iter()
        .filter_map(|props| {
            // The platform may echo integers back as floats
            let key = props.get(ROW_KEY_PROPERTY)?;
            let row = key.as_u64().or_else(|| key.as_f64().map(|f| f as u64))?;
            Some((row, props))
        })
        .collect();

    let mut rows = Vec::with_capacity(polygons.len());

    for (row, feature) in polygons.features().iter().enumerate() {
        let props = by_row.get(&(row as u64)).ok_or_else(|| {
            PlatformError::opaque(
                "MissingFeature",
                format!("Polygon '{}' is missing from the computation result", feature.id),
            )
        })?;

        let values = columns
            .iter()
            .map(|c| props.get(c).and_then(Value::as_f64).unwrap_or(f64::NAN))
            .collect();

        rows.push(ResultRow {
            id: feature.id.clone(),
            properties: feature.properties.clone(),
            values,
            geometry: feature.geometry.clone(),
        });
    }

    Ok(ResultTable {
        id_field: id_field.to_string(),
        attributes,
        columns,
        rows,
    })
}
