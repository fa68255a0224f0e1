//! Polygon boundary loading.
//!
//! Reads ESRI Shapefiles and GeoJSON FeatureCollections into a
//! [`PolygonCollection`] ready to be sent to the compute platform.

use crate::models::{PolygonCollection, PolygonFeature};
use anyhow::{anyhow, Context, Result};
use geo_types::{Geometry, MultiPolygon};
use geojson::GeoJson;
use serde_json::{Map, Value};
use shapefile::dbase::FieldValue;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

/// Identifier column used when no id attribute is configured.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Load polygons from a vector file.
///
/// The format is chosen from the file extension. When `id_field` is `None`,
/// or a feature lacks that attribute, the zero-based feature index is used
/// as its identifier. Identifiers must be unique across the file. All other
/// attributes are kept on the features.
pub fn load_polygons(path: &Path, id_field: Option<&str>) -> Result<PolygonCollection> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| anyhow!("Input geometry file has no extension: {}", path.display()))?;

    info!("Loading polygons from {}", path.display());

    let features = match extension.as_str() {
        "shp" => load_shapefile(path, id_field)?,
        "json" | "geojson" => load_geojson(path, id_field)?,
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    if features.is_empty() {
        return Err(anyhow!(
            "No polygon features found in {}",
            path.display()
        ));
    }

    check_unique_ids(&features, id_field)?;

    info!("Loaded {} polygons", features.len());

    Ok(PolygonCollection::new(
        id_field.unwrap_or(DEFAULT_ID_FIELD),
        features,
    ))
}

fn check_unique_ids(features: &[PolygonFeature], id_field: Option<&str>) -> Result<()> {
    let mut seen = HashSet::with_capacity(features.len());
    for feature in features {
        if !seen.insert(feature.id.as_str()) {
            return Err(anyhow!(
                "Duplicate polygon id '{}' (id field: {}). Pick an attribute with unique values, \
                 or omit --id-field to number polygons by position",
                feature.id,
                id_field.unwrap_or(DEFAULT_ID_FIELD)
            ));
        }
    }
    Ok(())
}

fn load_shapefile(path: &Path, id_field: Option<&str>) -> Result<Vec<PolygonFeature>> {
    let mut reader = shapefile::Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {}", path.display()))?;

    let mut features = Vec::new();

    for (index, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) =
            result.with_context(|| format!("Failed to read shape #{}", index))?;

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygon #{}: {:?}", index, e))?,
            shapefile::Shape::PolygonM(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM #{}: {:?}", index, e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ #{}: {:?}", index, e))?,
            other => {
                warn!("Skipping non-polygon shape #{} ({:?})", index, other.shapetype());
                continue;
            }
        };

        let mut properties: Map<String, Value> = record
            .into_iter()
            .map(|(name, value)| (name, field_value_to_json(value)))
            .collect();
        let id = take_id(&mut properties, id_field).unwrap_or_else(|| index.to_string());

        features.push(PolygonFeature {
            id,
            properties,
            geometry,
        });
    }

    Ok(features)
}

fn field_value_to_json(value: FieldValue) -> Value {
    match value {
        FieldValue::Character(Some(s)) => Value::String(s.trim().to_string()),
        FieldValue::Memo(s) => Value::String(s),
        FieldValue::Numeric(Some(n)) | FieldValue::Double(n) | FieldValue::Currency(n) => {
            serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
        }
        FieldValue::Float(Some(n)) => {
            serde_json::Number::from_f64(f64::from(n)).map_or(Value::Null, Value::Number)
        }
        FieldValue::Integer(n) => Value::from(n),
        FieldValue::Logical(Some(b)) => Value::Bool(b),
        _ => Value::Null,
    }
}

/// Remove the id attribute from `properties` and return it as text.
fn take_id(properties: &mut Map<String, Value>, id_field: Option<&str>) -> Option<String> {
    let value = properties.remove(id_field?)?;
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(integral_text(&n)),
        _ => None,
    }
}

/// dBase numerics come back as floats; `3.0` is written as `3`.
fn integral_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

fn load_geojson(path: &Path, id_field: Option<&str>) -> Result<Vec<PolygonFeature>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {}", path.display()))?;
    let geojson = GeoJson::from_reader(BufReader::new(file)).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut features = Vec::new();

    for (index, feature) in collection.features.into_iter().enumerate() {
        let mut properties = feature.properties.unwrap_or_default();
        let id = take_id(&mut properties, id_field).unwrap_or_else(|| index.to_string());

        let geometry = match feature.geometry {
            Some(geometry) => {
                let geometry: Geometry<f64> = geometry
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geometry of feature #{}: {:?}", index, e))?;

                match geometry {
                    Geometry::MultiPolygon(mp) => mp,
                    Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => {
                        warn!("Skipping non-polygon feature #{}", index);
                        continue;
                    }
                }
            }
            None => {
                debug!("Skipping feature #{} without geometry", index);
                continue;
            }
        };

        features.push(PolygonFeature {
            id,
            properties,
            geometry,
        });
    }

    Ok(features)
}
