//! Data models for zonal population statistics.
//!
//! This module contains the core data structures passed between the
//! polygon loader, the remote compute platform and the output writers.

use geo_types::MultiPolygon;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// WorldPop collection of unconstrained population estimates.
pub const UNCONSTRAINED_DATASET_ID: &str = "WorldPop/GP/100m/pop_age_sex";

/// WorldPop collection of top-down constrained population estimates.
pub const CONSTRAINED_DATASET_ID: &str = "WorldPop/GP/100m/pop_age_sex_cons_unadj";

/// Variant of the WorldPop population raster.
///
/// See <https://www.worldpop.org/methods/top_down_constrained_vs_unconstrained/>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PopulationDataset {
    /// Estimates distributed over all land cells.
    Unconstrained,
    /// Estimates constrained to known administrative totals and settled cells.
    Constrained,
}

impl PopulationDataset {
    /// Select the dataset variant from the `constrained` flag.
    pub fn from_constrained(constrained: bool) -> Self {
        if constrained {
            PopulationDataset::Constrained
        } else {
            PopulationDataset::Unconstrained
        }
    }

    /// Identifier of the image collection on the remote platform.
    pub fn asset_id(&self) -> &'static str {
        match self {
            PopulationDataset::Unconstrained => UNCONSTRAINED_DATASET_ID,
            PopulationDataset::Constrained => CONSTRAINED_DATASET_ID,
        }
    }
}

impl fmt::Display for PopulationDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopulationDataset::Unconstrained => write!(f, "unconstrained"),
            PopulationDataset::Constrained => write!(f, "constrained"),
        }
    }
}

/// Lazy reference to a raster evaluated on the remote platform.
///
/// Nothing is fetched when a handle is built; the platform only evaluates
/// it as part of an aggregation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterHandle {
    /// All images of a collection composited into a single image.
    Mosaic { collection_id: String },
}

impl RasterHandle {
    /// Global mosaic of a WorldPop dataset.
    pub fn mosaic(dataset: PopulationDataset) -> Self {
        RasterHandle::Mosaic {
            collection_id: dataset.asset_id().to_string(),
        }
    }

    pub fn collection_id(&self) -> &str {
        match self {
            RasterHandle::Mosaic { collection_id } => collection_id,
        }
    }
}

/// Reducer applied to the pixels inside each polygon.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    /// Total of all pixel values (default)
    #[default]
    Sum,
    /// Mean pixel value
    Mean,
    /// Minimum pixel value
    Min,
    /// Maximum pixel value
    Max,
}

impl Statistic {
    /// Name of the reducer constructor on the remote platform.
    pub fn reducer_name(&self) -> &'static str {
        match self {
            Statistic::Sum => "Reducer.sum",
            Statistic::Mean => "Reducer.mean",
            Statistic::Min => "Reducer.min",
            Statistic::Max => "Reducer.max",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Sum => write!(f, "SUM"),
            Statistic::Mean => write!(f, "MEAN"),
            Statistic::Min => write!(f, "MIN"),
            Statistic::Max => write!(f, "MAX"),
        }
    }
}

/// A named polygon boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonFeature {
    /// Stable identifier of the polygon (attribute value or feature index).
    pub id: String,
    /// Attributes read from the source file, excluding the id attribute.
    pub properties: Map<String, Value>,
    /// Boundary geometry in WGS84 longitude/latitude.
    pub geometry: MultiPolygon<f64>,
}

/// Immutable set of polygons loaded from a vector file.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonCollection {
    /// Attribute name used for polygon identifiers in requests and output.
    pub id_field: String,
    features: Vec<PolygonFeature>,
}

impl PolygonCollection {
    pub fn new(id_field: impl Into<String>, features: Vec<PolygonFeature>) -> Self {
        Self {
            id_field: id_field.into(),
            features,
        }
    }

    pub fn features(&self) -> &[PolygonFeature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Names of the source attributes, in order of first appearance.
    ///
    /// An attribute named like the id field is shadowed by the id.
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for feature in &self.features {
            for key in feature.properties.keys() {
                if key != &self.id_field && !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
        names
    }

    #[allow(dead_code)] // Pairs with len()
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// One zonal aggregation attempt.
///
/// Built fresh for every attempt of the fallback ladder; only `tile_scale`
/// differs between attempts.
#[derive(Debug, Clone)]
pub struct AggregationRequest<'a> {
    pub raster: &'a RasterHandle,
    pub polygons: &'a PolygonCollection,
    pub statistic: Statistic,
    /// Nominal ground resolution in meters per pixel.
    pub scale: u32,
    /// Tile-scale budget. `None` leaves the platform default (1).
    pub tile_scale: Option<u32>,
}

/// Aggregated values for a single polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub id: String,
    /// Source attributes of the polygon, carried through unchanged.
    pub properties: Map<String, Value>,
    /// Values in the same order as [`ResultTable::columns`].
    pub values: Vec<f64>,
    pub geometry: MultiPolygon<f64>,
}

/// Per-polygon statistics returned by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    pub id_field: String,
    /// Source attribute names, written between the id and the statistics.
    pub attributes: Vec<String>,
    /// Statistic output names (one per raster band).
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    /// Value of `column` for the polygon `id`.
    #[allow(dead_code)] // Lookup helper for callers inspecting results
    pub fn value(&self, id: &str, column: &str) -> Option<f64> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|r| r.id == id)
            .and_then(|r| r.values.get(idx).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{polygon, MultiPolygon};

    fn square() -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ]])
    }

    #[test]
    fn test_dataset_selection() {
        assert_eq!(
            PopulationDataset::from_constrained(false).asset_id(),
            "WorldPop/GP/100m/pop_age_sex"
        );
        assert_eq!(
            PopulationDataset::from_constrained(true).asset_id(),
            "WorldPop/GP/100m/pop_age_sex_cons_unadj"
        );
        assert_ne!(UNCONSTRAINED_DATASET_ID, CONSTRAINED_DATASET_ID);
    }

    #[test]
    fn test_mosaic_handle() {
        let raster = RasterHandle::mosaic(PopulationDataset::Constrained);
        assert_eq!(raster.collection_id(), CONSTRAINED_DATASET_ID);
    }

    #[test]
    fn test_statistic_reducer() {
        assert_eq!(Statistic::default(), Statistic::Sum);
        assert_eq!(Statistic::Sum.reducer_name(), "Reducer.sum");
        assert_eq!(Statistic::Sum.to_string(), "SUM");
    }

    #[test]
    fn test_result_table_lookup() {
        let table = ResultTable {
            id_field: "ADM2_CODE".to_string(),
            attributes: Vec::new(),
            columns: vec!["M_0".to_string(), "population".to_string()],
            rows: vec![ResultRow {
                id: "GMB001".to_string(),
                properties: Map::new(),
                values: vec![12.0, 340.5],
                geometry: square(),
            }],
        };

        assert_eq!(table.value("GMB001", "population"), Some(340.5));
        assert_eq!(table.value("GMB001", "F_0"), None);
        assert_eq!(table.value("GMB002", "population"), None);
    }

    fn feature(id: &str, properties: Value) -> PolygonFeature {
        PolygonFeature {
            id: id.to_string(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            geometry: square(),
        }
    }

    #[test]
    fn test_polygon_collection() {
        let collection = PolygonCollection::new("id", vec![feature("a", Value::Null)]);
        assert_eq!(collection.len(), 1);
        assert!(!collection.is_empty());
        assert_eq!(collection.features()[0].id, "a");
        assert!(collection.attribute_names().is_empty());
    }

    #[test]
    fn test_attribute_names_first_appearance() {
        let collection = PolygonCollection::new(
            "id",
            vec![
                feature("a", serde_json::json!({"name": "Banjul"})),
                feature("b", serde_json::json!({"area": 12.5, "name": "Kanifing"})),
            ],
        );
        assert_eq!(collection.attribute_names(), vec!["name", "area"]);
    }
}
