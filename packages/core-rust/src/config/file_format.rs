use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How to parse the files a file-system source reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileFormatConfig {
    /// `csv`, `json`, `xml` or `fixed-width`.
    #[serde(rename = "type")]
    pub format_type: String,
    pub delimiter: String,
    pub quote_character: String,
    pub header_row: bool,
    pub skip_lines: usize,
    pub encoding: String,
    /// Cell text that reads as null.
    pub null_value: String,
    pub root_path: String,
    pub flatten_arrays: bool,
    pub root_element: Option<String>,
    pub record_element: Option<String>,
    pub field_definitions: Vec<FieldDefinition>,
    /// Source column name to record field name.
    pub column_mappings: BTreeMap<String, String>,
    /// Field used by key lookups.
    pub key_column: Option<String>,
}

impl FileFormatConfig {
    /// The delimiter as a single byte, falling back to `,`.
    #[must_use]
    pub fn delimiter_byte(&self) -> u8 {
        single_byte(&self.delimiter).unwrap_or(b',')
    }

    #[must_use]
    pub fn quote_byte(&self) -> u8 {
        single_byte(&self.quote_character).unwrap_or(b'"')
    }
}

fn single_byte(s: &str) -> Option<u8> {
    match s.as_bytes() {
        [b] => Some(*b),
        _ if s == "\\t" => Some(b'\t'),
        _ => None,
    }
}

impl Default for FileFormatConfig {
    fn default() -> Self {
        Self {
            format_type: "csv".to_string(),
            delimiter: ",".to_string(),
            quote_character: "\"".to_string(),
            header_row: true,
            skip_lines: 0,
            encoding: "UTF-8".to_string(),
            null_value: String::new(),
            root_path: "$".to_string(),
            flatten_arrays: false,
            root_element: None,
            record_element: None,
            field_definitions: Vec::new(),
            column_mappings: BTreeMap::new(),
            key_column: None,
        }
    }
}

/// One column of a fixed-width layout. `start` is zero-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FieldDefinition {
    pub name: String,
    pub start: usize,
    pub length: usize,
    /// `string`, `integer`, `decimal` or `boolean`.
    #[serde(rename = "type")]
    pub field_type: String,
}

impl Default for FieldDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            start: 0,
            length: 0,
            field_type: "string".to_string(),
        }
    }
}
