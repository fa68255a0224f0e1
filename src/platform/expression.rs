//! Expression-graph encoding for Earth Engine `value:compute` requests.
//!
//! A request is a DAG of function invocations stored in a flat `values`
//! map and referenced by key. Reduction of the population mosaic over the
//! polygon collection looks like:
//!
//! ```text
//! ImageCollection.load -> ImageCollection.mosaic --\
//!                                                   Image.reduceRegions
//! Collection(Feature, Feature, ...) ---------------/
//! ```

use crate::models::{AggregationRequest, PolygonFeature, RasterHandle};
use geo_types::MultiPolygon;
use serde_json::{json, Map, Value};

/// Feature property holding the polygon's position in the request.
///
/// Results are matched back to polygons on this key, so rows stay
/// distinct even when identifiers repeat.
pub const ROW_KEY_PROPERTY: &str = "worldpop_stats:row";

/// Builder for the flat `values` map of an expression.
#[derive(Debug, Default)]
pub struct ExpressionBuilder {
    values: Map<String, Value>,
}

impl ExpressionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a node and return a reference to it.
    pub fn push(&mut self, node: Value) -> Value {
        let key = self.values.len().to_string();
        self.values.insert(key.clone(), node);
        json!({ "valueReference": key })
    }

    /// Finish the expression with `result` as its output node.
    pub fn finish(mut self, result: Value) -> Value {
        let key = match result.get("valueReference").and_then(Value::as_str) {
            Some(key) => key.to_string(),
            None => {
                let reference = self.push(result);
                reference["valueReference"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            }
        };

        json!({
            "result": key,
            "values": self.values,
        })
    }
}

/// A literal value.
pub fn constant(value: impl Into<Value>) -> Value {
    json!({ "constantValue": value.into() })
}

/// A call of a platform function with named arguments.
pub fn invoke(function_name: &str, arguments: Map<String, Value>) -> Value {
    json!({
        "functionInvocationValue": {
            "functionName": function_name,
            "arguments": arguments,
        }
    })
}

/// An inline list of nodes.
pub fn array(values: Vec<Value>) -> Value {
    json!({ "arrayValue": { "values": values } })
}

fn args<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Polygon rings as nested `[x, y]` coordinate arrays.
pub fn multipolygon_coordinates(geometry: &MultiPolygon<f64>) -> Vec<Vec<Vec<[f64; 2]>>> {
    geometry
        .0
        .iter()
        .map(|polygon| {
            std::iter::once(polygon.exterior())
                .chain(polygon.interiors())
                .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
                .collect()
        })
        .collect()
}

fn raster_node(builder: &mut ExpressionBuilder, raster: &RasterHandle) -> Value {
    match raster {
        RasterHandle::Mosaic { collection_id } => {
            let collection = builder.push(invoke(
                "ImageCollection.load",
                args([("id", constant(collection_id.as_str()))]),
            ));
            builder.push(invoke(
                "ImageCollection.mosaic",
                args([("collection", collection)]),
            ))
        }
    }
}

fn feature_node(id_field: &str, row: usize, feature: &PolygonFeature) -> Value {
    let coordinates = serde_json::to_value(multipolygon_coordinates(&feature.geometry))
        .unwrap_or(Value::Null);

    let mut metadata = feature.properties.clone();
    metadata.insert(id_field.to_string(), Value::String(feature.id.clone()));
    metadata.insert(ROW_KEY_PROPERTY.to_string(), Value::from(row));

    invoke(
        "Feature",
        args([
            (
                "geometry",
                invoke(
                    "GeometryConstructors.MultiPolygon",
                    args([("coordinates", constant(coordinates))]),
                ),
            ),
            ("metadata", constant(metadata)),
        ]),
    )
}

/// Encode a zonal reduction as a `value:compute` request body.
///
/// `tileScale` is only sent when the request sets one, leaving the
/// platform default in place for the first attempt.
pub fn reduce_regions_request(request: &AggregationRequest<'_>) -> Value {
    let mut builder = ExpressionBuilder::new();

    let image = raster_node(&mut builder, request.raster);

    let features = request
        .polygons
        .features()
        .iter()
        .enumerate()
        .map(|(row, f)| feature_node(&request.polygons.id_field, row, f))
        .collect();
    let collection = builder.push(invoke("Collection", args([("features", array(features))])));

    let mut arguments = args([
        ("image", image),
        ("collection", collection),
        ("reducer", invoke(request.statistic.reducer_name(), Map::new())),
        ("scale", constant(request.scale)),
    ]);
    if let Some(tile_scale) = request.tile_scale {
        arguments.insert("tileScale".to_string(), constant(tile_scale));
    }

    let result = builder.push(invoke("Image.reduceRegions", arguments));

    json!({ "expression": builder.finish(result) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolygonCollection, PopulationDataset, Statistic};
    use geo_types::polygon;

    fn collection() -> PolygonCollection {
        let poly = polygon![
            (x: -16.6, y: 13.4),
            (x: -16.5, y: 13.4),
            (x: -16.5, y: 13.5),
            (x: -16.6, y: 13.4),
        ];
        PolygonCollection::new(
            "ADM2_CODE",
            vec![PolygonFeature {
                id: "GMB001".to_string(),
                properties: json!({"name": "Banjul", "area_km2": 12.2})
                    .as_object()
                    .cloned()
                    .unwrap(),
                geometry: MultiPolygon::new(vec![poly]),
            }],
        )
    }

    fn node<'a>(body: &'a Value, key: &str) -> &'a Value {
        &body["expression"]["values"][key]["functionInvocationValue"]
    }

    #[test]
    fn test_builder_references() {
        let mut builder = ExpressionBuilder::new();
        let first = builder.push(constant(1));
        let second = builder.push(constant(2));
        assert_eq!(first, json!({"valueReference": "0"}));
        assert_eq!(second, json!({"valueReference": "1"}));

        let expr = builder.finish(second);
        assert_eq!(expr["result"], "1");
        assert_eq!(expr["values"]["0"], json!({"constantValue": 1}));
    }

    #[test]
    fn test_reduce_regions_first_attempt() {
        let polygons = collection();
        let raster = RasterHandle::mosaic(PopulationDataset::Unconstrained);
        let request = AggregationRequest {
            raster: &raster,
            polygons: &polygons,
            statistic: Statistic::Sum,
            scale: 100,
            tile_scale: None,
        };

        let body = reduce_regions_request(&request);
        let result_key = body["expression"]["result"].as_str().unwrap();

        assert_eq!(node(&body, "0")["functionName"], "ImageCollection.load");
        assert_eq!(
            node(&body, "0")["arguments"]["id"]["constantValue"],
            "WorldPop/GP/100m/pop_age_sex"
        );
        assert_eq!(node(&body, "1")["functionName"], "ImageCollection.mosaic");

        let reduce = node(&body, result_key);
        assert_eq!(reduce["functionName"], "Image.reduceRegions");
        assert_eq!(reduce["arguments"]["scale"]["constantValue"], 100);
        assert_eq!(
            reduce["arguments"]["reducer"]["functionInvocationValue"]["functionName"],
            "Reducer.sum"
        );
        assert!(reduce["arguments"].get("tileScale").is_none());
    }

    #[test]
    fn test_reduce_regions_tile_scale_and_features() {
        let polygons = collection();
        let raster = RasterHandle::mosaic(PopulationDataset::Constrained);
        let request = AggregationRequest {
            raster: &raster,
            polygons: &polygons,
            statistic: Statistic::Sum,
            scale: 250,
            tile_scale: Some(4),
        };

        let body = reduce_regions_request(&request);
        let result_key = body["expression"]["result"].as_str().unwrap();
        let reduce = node(&body, result_key);
        assert_eq!(reduce["arguments"]["tileScale"]["constantValue"], 4);

        let features = &node(&body, "2")["arguments"]["features"]["arrayValue"]["values"];
        assert_eq!(features.as_array().unwrap().len(), 1);

        let feature = &features[0]["functionInvocationValue"];
        let metadata = &feature["arguments"]["metadata"]["constantValue"];
        assert_eq!(metadata["ADM2_CODE"], "GMB001");
        assert_eq!(metadata["name"], "Banjul");
        assert_eq!(metadata["area_km2"], 12.2);
        assert_eq!(metadata[ROW_KEY_PROPERTY], 0);
        let coords = &feature["arguments"]["geometry"]["functionInvocationValue"]["arguments"]
            ["coordinates"]["constantValue"];
        assert_eq!(coords[0][0][0], json!([-16.6, 13.4]));
    }

    #[test]
    fn test_multipolygon_coordinates_with_hole() {
        let poly = polygon!(
            exterior: [
                (x: 0.0, y: 0.0),
                (x: 10.0, y: 0.0),
                (x: 10.0, y: 10.0),
                (x: 0.0, y: 0.0),
            ],
            interiors: [[
                (x: 1.0, y: 1.0),
                (x: 2.0, y: 1.0),
                (x: 2.0, y: 2.0),
                (x: 1.0, y: 1.0),
            ]]
        );
        let coords = multipolygon_coordinates(&MultiPolygon::new(vec![poly]));
        assert_eq!(coords.len(), 1);
        assert_eq!(coords[0].len(), 2);
        assert_eq!(coords[0][1][0], [1.0, 1.0]);
    }
}
