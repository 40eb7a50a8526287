//! Transcoding of query results.
//!
//! Location records render as JSON, CSV, XML, GPX, a GeoJSON
//! FeatureCollection or a GeoJSON LineString. The `raw` formats bypass record
//! materialization and emit log lines (or their payload column) verbatim.

use std::io::Write;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use crate::storage::query::{LocationRecord, Scanner, TimeWindow};

/// Fields rendered as integers in CSV and XML output.
pub const INTEGER_FIELDS: [&str; 8] = ["tst", "batt", "vel", "cog", "alt", "acc", "dist", "trip"];

/// Fields CSV always quotes.
const QUOTED_FIELDS: [&str; 2] = ["addr", "locality"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `{"count": N, "data": [...]}`
    #[default]
    Json,
    JsonArray,
    Csv,
    Xml,
    Gpx,
    GeoJson,
    LineString,
    /// Complete log lines.
    Raw,
    /// Payload column of location lines.
    RawPayload,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::JsonArray => "json-array",
            Self::Csv => "csv",
            Self::Xml => "xml",
            Self::Gpx => "gpx",
            Self::GeoJson => "geojson",
            Self::LineString => "linestring",
            Self::Raw => "raw",
            Self::RawPayload => "raw-payload",
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw | Self::RawPayload)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json | Self::JsonArray => "application/json",
            Self::GeoJson | Self::LineString => "application/geo+json",
            Self::Csv => "text/csv",
            Self::Xml => "application/xml",
            Self::Gpx => "application/gpx+xml",
            Self::Raw | Self::RawPayload => "text/plain; charset=utf-8",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json-array" | "jsonarray" => Ok(Self::JsonArray),
            "csv" => Ok(Self::Csv),
            "xml" => Ok(Self::Xml),
            "gpx" => Ok(Self::Gpx),
            "geojson" => Ok(Self::GeoJson),
            "linestring" => Ok(Self::LineString),
            "raw" => Ok(Self::Raw),
            "raw-payload" | "payload" => Ok(Self::RawPayload),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Split a comma-separated field list, dropping blanks.
pub fn parse_fields(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect()
}

fn selected(rec: &LocationRecord, fields: Option<&[String]>) -> Map<String, Value> {
    match fields {
        Some(f) => rec.project(f),
        None => rec.fields().clone(),
    }
}

/// JSON object `{"count": N, "data": [...]}`.
pub fn to_json_object(records: &[LocationRecord], fields: Option<&[String]>) -> Value {
    json!({
        "count": records.len(),
        "data": to_json_array(records, fields),
    })
}

pub fn to_json_array(records: &[LocationRecord], fields: Option<&[String]>) -> Value {
    Value::Array(
        records
            .iter()
            .map(|r| Value::Object(selected(r, fields)))
            .collect(),
    )
}

fn scalar(key: &str, v: &Value) -> String {
    match v {
        Value::Number(n) if INTEGER_FIELDS.contains(&key) => match n.as_f64() {
            Some(f) => format!("{}", f.round() as i64),
            None => n.to_string(),
        },
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn csv_cell(key: &str, v: Option<&Value>) -> String {
    let Some(v) = v else {
        return String::new();
    };
    let text = scalar(key, v);
    let needs_quotes = matches!(v, Value::String(_))
        && (QUOTED_FIELDS.contains(&key) || text.contains([',', '"', '\n']));
    if needs_quotes {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

/// CSV with a header row. Without `fields`, the columns are those of the
/// first record; with `fields`, missing values are left empty.
pub fn write_csv<W: Write>(records: &[LocationRecord], fields: Option<&[String]>, out: &mut W) -> Result<()> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    let columns: Vec<String> = match fields {
        Some(f) => f.to_vec(),
        None => first.fields().keys().cloned().collect(),
    };

    writeln!(out, "{}", columns.join(","))?;
    for rec in records {
        let row: Vec<String> = columns.iter().map(|c| csv_cell(c, rec.get(c))).collect();
        writeln!(out, "{}", row.join(","))?;
    }
    Ok(())
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// `<locations>` with one `<point>` per record and one element per field.
pub fn write_xml<W: Write>(records: &[LocationRecord], fields: Option<&[String]>, out: &mut W) -> Result<()> {
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(out, "<locations>")?;
    for rec in records {
        writeln!(out, "  <point>")?;
        for (key, value) in selected(rec, fields) {
            if !is_xml_name(&key) {
                continue;
            }
            writeln!(out, "    <{key}>{}</{key}>", xml_escape(&scalar(&key, &value)))?;
        }
        writeln!(out, "  </point>")?;
    }
    writeln!(out, "</locations>")?;
    Ok(())
}

fn is_xml_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// GPX 1.1 track. Records without `lat`, `lon` and `isotst` are skipped.
pub fn write_gpx<W: Write>(records: &[LocationRecord], name: &str, out: &mut W) -> Result<()> {
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        out,
        r#"<gpx version="1.1" creator="trackstore" xmlns="http://www.topografix.com/GPX/1/1">"#
    )?;
    writeln!(out, "  <trk>")?;
    writeln!(out, "    <name>{}</name>", xml_escape(name))?;
    writeln!(out, "    <trkseg>")?;
    for rec in records {
        let (Some(lat), Some(lon), Some(Value::String(time))) = (rec.lat(), rec.lon(), rec.get("isotst"))
        else {
            continue;
        };
        writeln!(out, r#"      <trkpt lat="{lat}" lon="{lon}">"#)?;
        if let Some(alt) = rec.number("alt") {
            writeln!(out, "        <ele>{alt}</ele>")?;
        }
        writeln!(out, "        <time>{}</time>", xml_escape(time))?;
        writeln!(out, "      </trkpt>")?;
    }
    writeln!(out, "    </trkseg>")?;
    writeln!(out, "  </trk>")?;
    writeln!(out, "</gpx>")?;
    Ok(())
}

/// GeoJSON FeatureCollection of points; `name` is the tracker id and
/// `address` the reverse-geocoded address.
pub fn to_geojson(records: &[LocationRecord]) -> Value {
    let features: Vec<Value> = records
        .iter()
        .map(|rec| {
            let text = |k: &str| rec.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
            json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [rec.lon().unwrap_or_default(), rec.lat().unwrap_or_default()],
                },
                "properties": {
                    "name": text("tid"),
                    "address": text("addr"),
                },
            })
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

/// GeoJSON LineString through the records ordered by `tst`. The sort is
/// stable, so records sharing a timestamp keep their scan order.
pub fn to_linestring(records: &[LocationRecord]) -> Value {
    let mut points: Vec<&LocationRecord> = records.iter().collect();
    points.sort_by_key(|r| r.tst().unwrap_or_default());

    let coordinates: Vec<Value> = points
        .iter()
        .filter_map(|r| Some(json!([r.lon()?, r.lat()?])))
        .collect();

    json!({
        "type": "LineString",
        "coordinates": coordinates,
    })
}

/// Render records in a non-raw `format`.
pub fn render<W: Write>(
    format: OutputFormat,
    records: &[LocationRecord],
    fields: Option<&[String]>,
    name: &str,
    out: &mut W,
) -> Result<()> {
    match format {
        OutputFormat::Json => write_json(out, &to_json_object(records, fields))?,
        OutputFormat::JsonArray => write_json(out, &to_json_array(records, fields))?,
        OutputFormat::Csv => write_csv(records, fields, out)?,
        OutputFormat::Xml => write_xml(records, fields, out)?,
        OutputFormat::Gpx => write_gpx(records, name, out)?,
        OutputFormat::GeoJson => write_json(out, &to_geojson(records))?,
        OutputFormat::LineString => write_json(out, &to_linestring(records))?,
        OutputFormat::Raw | OutputFormat::RawPayload => {
            bail!("{format} output is produced from log lines, not records")
        }
    }
    Ok(())
}

fn write_json<W: Write>(out: &mut W, value: &Value) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// A location query as issued by the CLI and the HTTP API.
#[derive(Debug, Clone)]
pub struct LocationQuery {
    pub user: String,
    pub device: String,
    pub window: TimeWindow,
    /// Keep only the newest `limit` entries.
    pub limit: Option<usize>,
    pub format: OutputFormat,
    pub fields: Option<Vec<String>>,
}

/// Run `query` and write its result to `out`. Returns the number of entries
/// written. Limited record queries are emitted oldest first.
pub fn write_locations<W: Write>(scanner: &Scanner<'_>, query: &LocationQuery, out: &mut W) -> Result<usize> {
    let (user, device, window) = (query.user.as_str(), query.device.as_str(), query.window);

    if query.format.is_raw() {
        let lines = match query.format {
            OutputFormat::Raw => scanner.raw_lines(user, device, window, query.limit)?,
            _ => scanner.raw_payloads(user, device, window, query.limit)?,
        };
        for line in &lines {
            writeln!(out, "{line}")?;
        }
        return Ok(lines.len());
    }

    let records = match query.limit {
        Some(limit) => {
            let mut recs = scanner.scan_backward(user, device, window, limit)?;
            recs.reverse();
            recs
        }
        None => scanner.scan_forward(user, device, window)?,
    };

    let name = format!("{user}/{device}");
    render(query.format, &records, query.fields.as_deref(), &name, out)?;
    Ok(records.len())
}
