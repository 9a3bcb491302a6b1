//! Import options understood by the engine's CSV and JSON readers.
//!
//! Serialized as camelCase JSON; unset fields are left out so the engine
//! applies its own defaults and auto-detection.

use std::collections::BTreeMap;

use serde::Serialize;

/// Column name to SQL type, e.g. `"id" -> "INTEGER"`.
pub type ColumnTypes = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvTableOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escape: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<ColumnTypes>,
}

impl CsvTableOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn header(mut self, header: bool) -> Self {
        self.header = Some(header);
        self
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn column(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.columns
            .get_or_insert_with(ColumnTypes::new)
            .insert(name.into(), ty.into());
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JsonShape {
    /// `[{"a": 1}, {"a": 2}]`
    RowArray,
    /// `{"a": [1, 2]}`
    ColumnObject,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonTableOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<JsonShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<ColumnTypes>,
}

impl JsonTableOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn shape(mut self, shape: JsonShape) -> Self {
        self.shape = Some(shape);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_omits_unset_fields() {
        let options = CsvTableOptions::new("people")
            .header(true)
            .delimiter("|")
            .column("id", "INTEGER");
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(
            json,
            r#"{"name":"people","header":true,"delimiter":"|","columns":{"id":"INTEGER"}}"#
        );
    }

    #[test]
    fn json_shape_names() {
        let options = JsonTableOptions::new("events").shape(JsonShape::ColumnObject);
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(json, r#"{"name":"events","shape":"column-object"}"#);
    }
}
