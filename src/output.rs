//! Result table writers.
//!
//! The output format is picked from the file extension: CSV, GeoJSON,
//! KML, KMZ or ESRI Shapefile.

use crate::models::{ResultRow, ResultTable};
use anyhow::{anyhow, Context, Result};
use geo_types::MultiPolygon;
use serde_json::Value;
use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Longest attribute name a dBase table accepts.
const DBF_FIELD_NAME_LEN: usize = 10;

/// Widest dBase character field.
const DBF_CHARACTER_LEN: usize = 254;

/// Projection written next to shapefiles; results are in WGS84.
const WGS84_PRJ: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    GeoJson,
    Kml,
    Kmz,
    Shapefile,
}

impl OutputFormat {
    /// Select the format from the path's extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_lowercase())
            .ok_or_else(|| anyhow!("Output path has no extension: {}", path.display()))?;

        match extension.as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" | "geojson" => Ok(OutputFormat::GeoJson),
            "kml" => Ok(OutputFormat::Kml),
            "kmz" => Ok(OutputFormat::Kmz),
            "shp" => Ok(OutputFormat::Shapefile),
            other => Err(anyhow!(
                "Unsupported output format '{}' (expected csv, geojson, json, kml, kmz or shp)",
                other
            )),
        }
    }
}

/// Write `table` to `path` in the format implied by its extension.
pub fn write_table(table: &ResultTable, path: &Path) -> Result<()> {
    let format = OutputFormat::from_path(path)?;
    debug!("Writing {} rows as {:?} to {}", table.rows.len(), format, path.display());

    match format {
        OutputFormat::Csv => write_csv(table, path),
        OutputFormat::GeoJson => write_geojson(table, path),
        OutputFormat::Kml => std::fs::write(path, generate_kml(table))
            .with_context(|| format!("Failed to write KML to {}", path.display())),
        OutputFormat::Kmz => write_kmz(table, path),
        OutputFormat::Shapefile => write_shapefile(table, path),
    }
}

/// Format a value for text outputs; missing values become empty cells.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

/// Text form of a source attribute; missing and null become empty.
fn attribute_text(row: &ResultRow, name: &str) -> String {
    match row.properties.get(name) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn write_csv(table: &ResultTable, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;

    let mut header = vec![table.id_field.as_str()];
    header.extend(table.attributes.iter().map(String::as_str));
    header.extend(table.columns.iter().map(String::as_str));
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = vec![row.id.clone()];
        record.extend(table.attributes.iter().map(|a| attribute_text(row, a)));
        record.extend(row.values.iter().map(|v| format_value(*v)));
        writer.write_record(&record)?;
    }

    writer.flush().context("Failed to flush CSV output")?;
    Ok(())
}

fn write_geojson(table: &ResultTable, path: &Path) -> Result<()> {
    let features = table
        .rows
        .iter()
        .map(|row| {
            let mut properties = serde_json::Map::new();
            for attribute in &table.attributes {
                let value = row.properties.get(attribute).cloned().unwrap_or(Value::Null);
                properties.insert(attribute.clone(), value);
            }
            properties.insert(
                table.id_field.clone(),
                serde_json::Value::String(row.id.clone()),
            );
            for (column, value) in table.columns.iter().zip(&row.values) {
                let value = serde_json::Number::from_f64(*value)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null);
                properties.insert(column.clone(), value);
            }

            geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&row.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let collection = geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };

    let file = File::create(path)
        .with_context(|| format!("Failed to create GeoJSON file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, &collection).context("Failed to serialize GeoJSON")?;
    Ok(())
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn kml_ring(tag: &str, coords: impl Iterator<Item = (f64, f64)>) -> String {
    let coordinates: Vec<String> = coords.map(|(x, y)| format!("{},{}", x, y)).collect();
    format!(
        "<{tag}><LinearRing><coordinates>{}</coordinates></LinearRing></{tag}>",
        coordinates.join(" ")
    )
}

fn kml_geometry(geometry: &MultiPolygon<f64>) -> String {
    let mut output = String::from("<MultiGeometry>");
    for polygon in &geometry.0 {
        output.push_str("<Polygon>");
        output.push_str(&kml_ring(
            "outerBoundaryIs",
            polygon.exterior().coords().map(|c| (c.x, c.y)),
        ));
        for interior in polygon.interiors() {
            output.push_str(&kml_ring(
                "innerBoundaryIs",
                interior.coords().map(|c| (c.x, c.y)),
            ));
        }
        output.push_str("</Polygon>");
    }
    output.push_str("</MultiGeometry>");
    output
}

/// Render the table as a KML document, one placemark per polygon.
pub fn generate_kml(table: &ResultTable) -> String {
    let mut output = String::new();

    output.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    output.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n<Document>\n");

    for row in &table.rows {
        output.push_str("<Placemark>\n");
        output.push_str(&format!("<name>{}</name>\n", escape_xml(&row.id)));
        output.push_str("<ExtendedData>\n");
        output.push_str(&format!(
            "<Data name=\"{}\"><value>{}</value></Data>\n",
            escape_xml(&table.id_field),
            escape_xml(&row.id)
        ));
        for attribute in &table.attributes {
            output.push_str(&format!(
                "<Data name=\"{}\"><value>{}</value></Data>\n",
                escape_xml(attribute),
                escape_xml(&attribute_text(row, attribute))
            ));
        }
        for (column, value) in table.columns.iter().zip(&row.values) {
            output.push_str(&format!(
                "<Data name=\"{}\"><value>{}</value></Data>\n",
                escape_xml(column),
                format_value(*value)
            ));
        }
        output.push_str("</ExtendedData>\n");
        output.push_str(&kml_geometry(&row.geometry));
        output.push_str("\n</Placemark>\n");
    }

    output.push_str("</Document>\n</kml>\n");
    output
}

fn write_kmz(table: &ResultTable, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create KMZ file: {}", path.display()))?;
    let mut archive = zip::ZipWriter::new(file);

    // Fixed timestamp keeps repeated runs byte-identical
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    archive
        .start_file("doc.kml", options)
        .context("Failed to start doc.kml in KMZ archive")?;
    archive.write_all(generate_kml(table).as_bytes())?;
    archive.finish().context("Failed to finish KMZ archive")?;
    Ok(())
}

/// dBase column names for `names`, truncated to the format's limit.
///
/// Names that collide after truncation get a numeric suffix so every
/// value keeps its own column.
fn dbf_columns(names: &[&str]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    let mut columns = Vec::with_capacity(names.len());

    for name in names {
        let mut column: String = name.chars().take(DBF_FIELD_NAME_LEN).collect();
        let mut suffix = 1;
        while taken.contains(&column) {
            let tag = format!("_{}", suffix);
            let stem: String = name
                .chars()
                .take(DBF_FIELD_NAME_LEN.saturating_sub(tag.len()))
                .collect();
            column = format!("{}{}", stem, tag);
            suffix += 1;
        }

        if column != *name {
            warn!("Shapefile column '{}' renamed to '{}'", name, column);
        }
        taken.insert(column.clone());
        columns.push(column);
    }

    columns
}

fn dbf_field_name(column: &str) -> Result<FieldName> {
    FieldName::try_from(column)
        .map_err(|e| anyhow!("Invalid shapefile column name '{}': {:?}", column, e))
}

/// Cut `text` to the widest character field, on a char boundary.
fn dbf_text(mut text: String) -> String {
    if text.len() > DBF_CHARACTER_LEN {
        let mut end = DBF_CHARACTER_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

fn character_width(values: impl Iterator<Item = usize>) -> u8 {
    values.max().unwrap_or(1).clamp(1, DBF_CHARACTER_LEN) as u8
}

fn write_shapefile(table: &ResultTable, path: &Path) -> Result<()> {
    let mut names = vec![table.id_field.as_str()];
    names.extend(table.attributes.iter().map(String::as_str));
    names.extend(table.columns.iter().map(String::as_str));
    let dbf_names = dbf_columns(&names);

    let (id_key, rest) = dbf_names
        .split_first()
        .ok_or_else(|| anyhow!("Shapefile needs at least an id column"))?;
    let (attribute_keys, column_keys) = rest.split_at(table.attributes.len());

    let mut builder = TableWriterBuilder::new().add_character_field(
        dbf_field_name(id_key)?,
        character_width(table.rows.iter().map(|r| r.id.len())),
    );
    for (key, attribute) in attribute_keys.iter().zip(&table.attributes) {
        let width = character_width(
            table
                .rows
                .iter()
                .map(|r| attribute_text(r, attribute).len()),
        );
        builder = builder.add_character_field(dbf_field_name(key)?, width);
    }
    for key in column_keys {
        builder = builder.add_numeric_field(dbf_field_name(key)?, 24, 6);
    }

    let mut writer = shapefile::Writer::from_path(path, builder)
        .with_context(|| format!("Failed to create Shapefile: {}", path.display()))?;

    for row in &table.rows {
        let polygon: shapefile::Polygon = row.geometry.clone().into();

        let mut record = Record::default();
        record.insert(
            id_key.clone(),
            FieldValue::Character(Some(dbf_text(row.id.clone()))),
        );
        for (key, attribute) in attribute_keys.iter().zip(&table.attributes) {
            let text = attribute_text(row, attribute);
            let value = if text.is_empty() { None } else { Some(dbf_text(text)) };
            record.insert(key.clone(), FieldValue::Character(value));
        }
        for (key, value) in column_keys.iter().zip(&row.values) {
            let value = if value.is_nan() { None } else { Some(*value) };
            record.insert(key.clone(), FieldValue::Numeric(value));
        }

        writer
            .write_shape_and_record(&polygon, &record)
            .with_context(|| format!("Failed to write shape for '{}'", row.id))?;
    }

    std::fs::write(path.with_extension("prj"), WGS84_PRJ)
        .context("Failed to write shapefile projection")?;
    Ok(())
}
