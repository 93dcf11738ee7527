//! Format-specific file parsers, selected by extension.

use std::path::Path;
use std::sync::LazyLock;

use apex_data_core::{DataSourceError, FileFormatConfig, Record, Result, Value};
use regex::Regex;

/// Parser family for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileFormat {
    Delimited { delimiter: u8 },
    Json,
    JsonLines,
    Xml,
    FixedWidth,
}

impl FileFormat {
    /// Picks a parser by extension. Plain-text files are fixed-width when the
    /// configuration carries field definitions and delimited otherwise.
    pub(crate) fn for_path(path: &Path, config: &FileFormatConfig) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let delimited = Self::Delimited {
            delimiter: config.delimiter_byte(),
        };
        match extension.as_str() {
            "csv" => Ok(delimited),
            "tsv" if config.delimiter_byte() == b',' => Ok(Self::Delimited { delimiter: b'\t' }),
            "tsv" => Ok(delimited),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            "xml" => Ok(Self::Xml),
            "dat" | "fw" | "fixed" => Ok(Self::FixedWidth),
            "txt" if !config.field_definitions.is_empty() => Ok(Self::FixedWidth),
            "txt" => Ok(delimited),
            other => Err(DataSourceError::data_format(format!(
                "No data loader available for file type: {other}"
            ))),
        }
    }
}

/// Parses `text` into records and applies the configured column mappings.
pub(crate) fn parse(text: &str, format: FileFormat, config: &FileFormatConfig) -> Result<Vec<Record>> {
    let records = match format {
        FileFormat::Delimited { delimiter } => parse_delimited(text, delimiter, config)?,
        FileFormat::Json => parse_json(text, config)?,
        FileFormat::JsonLines => parse_json_lines(text)?,
        FileFormat::Xml => parse_xml(text, config),
        FileFormat::FixedWidth => parse_fixed_width(text, config)?,
    };
    if config.column_mappings.is_empty() {
        return Ok(records);
    }
    Ok(records
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .map(|(k, v)| (config.column_mappings.get(&k).cloned().unwrap_or(k), v))
                .collect()
        })
        .collect())
}

/// Typed value for one text cell: integer, decimal, boolean, else string.
fn infer(cell: &str, null_value: &str) -> Value {
    let cell = cell.trim();
    if cell.is_empty() || (!null_value.is_empty() && cell == null_value) {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if f.is_finite() {
            return Value::Float(f);
        }
    }
    match cell.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

fn into_record(value: Value) -> Record {
    match value {
        Value::Map(map) => map,
        other => Record::from([("value".to_string(), other)]),
    }
}

// ---------------------------------------------------------------------------
// Delimited
// ---------------------------------------------------------------------------

fn parse_delimited(text: &str, delimiter: u8, config: &FileFormatConfig) -> Result<Vec<Record>> {
    let body = text
        .lines()
        .skip(config.skip_lines)
        .collect::<Vec<_>>()
        .join("\n");
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(config.quote_byte())
        .has_headers(config.header_row)
        .flexible(true)
        .from_reader(body.as_bytes());

    let headers: Vec<String> = if config.header_row {
        reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect()
    } else {
        Vec::new()
    };

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error)?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        records.push(
            row.iter()
                .enumerate()
                .map(|(i, cell)| {
                    let name = headers
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", i + 1));
                    (name, infer(cell, &config.null_value))
                })
                .collect(),
        );
    }
    Ok(records)
}

fn csv_error(err: csv::Error) -> DataSourceError {
    DataSourceError::data_format(format!("Malformed delimited file: {err}")).with_cause(err)
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn parse_json(text: &str, config: &FileFormatConfig) -> Result<Vec<Record>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let document: serde_json::Value = serde_json::from_str(text).map_err(json_error)?;
    let Some(root) = select_root(&document, &config.root_path) else {
        return Ok(Vec::new());
    };
    Ok(match Value::from(root.clone()) {
        Value::Array(items) => items.into_iter().map(into_record).collect(),
        other => vec![into_record(other)],
    })
}

/// Follows a `$.a.b` path; `$` or an empty path is the document itself.
fn select_root<'a>(document: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let path = path.trim();
    let rest = path.strip_prefix('$').unwrap_or(path);
    rest.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(document, |node, segment| node.get(segment))
}

fn parse_json_lines(text: &str) -> Result<Vec<Record>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line)
                .map(|v| into_record(Value::from(v)))
                .map_err(json_error)
        })
        .collect()
}

fn json_error(err: serde_json::Error) -> DataSourceError {
    DataSourceError::data_format(format!("Malformed JSON file: {err}")).with_cause(err)
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

static LEAF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Za-z_][\w.\-]*)(?:\s[^>]*)?>([^<]*)</([A-Za-z_][\w.\-]*)\s*>")
        .expect("static regex compiles")
});

/// Reads flat `<record><field>text</field>...</record>` documents. Nested
/// structure below a record is ignored; leaf text is typed like CSV cells.
fn parse_xml(text: &str, config: &FileFormatConfig) -> Vec<Record> {
    let element = config.record_element.as_deref().unwrap_or("record");
    let Ok(block) = Regex::new(&format!(
        r"(?s)<{0}(?:\s[^>]*)?>(.*?)</{0}\s*>",
        regex::escape(element)
    )) else {
        return Vec::new();
    };
    block
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|body| {
            LEAF.captures_iter(body.as_str())
                .filter(|c| c[1] == c[3])
                .map(|c| (c[1].to_string(), infer(&unescape_xml(&c[2]), &config.null_value)))
                .collect()
        })
        .collect()
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// ---------------------------------------------------------------------------
// Fixed width
// ---------------------------------------------------------------------------

fn parse_fixed_width(text: &str, config: &FileFormatConfig) -> Result<Vec<Record>> {
    if config.field_definitions.is_empty() {
        return Err(DataSourceError::configuration(
            "Field definitions are required for fixed-width files",
        ));
    }
    let mut records = Vec::new();
    for line in text.lines().skip(config.skip_lines) {
        if line.trim().is_empty() {
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let record = config
            .field_definitions
            .iter()
            .map(|field| {
                let end = (field.start + field.length).min(chars.len());
                let cell: String = chars
                    .get(field.start.min(end)..end)
                    .unwrap_or_default()
                    .iter()
                    .collect();
                (field.name.clone(), typed_cell(cell.trim(), &field.field_type))
            })
            .collect();
        records.push(record);
    }
    Ok(records)
}

fn typed_cell(cell: &str, field_type: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    let parsed = match field_type.to_ascii_lowercase().as_str() {
        "integer" | "int" | "long" => cell.parse().ok().map(Value::Int),
        "decimal" | "double" | "float" | "number" => cell.parse().ok().map(Value::Float),
        "boolean" | "bool" => match cell.to_ascii_lowercase().as_str() {
            "true" | "y" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "n" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(cell.to_string()))
}
