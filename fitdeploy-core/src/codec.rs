//! Content negotiation and request/response codecs.
//!
//! Two content types are supported for invocation bodies: `application/json`
//! and `text/csv`. Anything else is rejected with
//! [`CodecError::UnsupportedContentType`] before a request leaves the process.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use std::str::FromStr;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_CSV: &str = "text/csv";

/// A supported body content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Csv,
}

impl ContentType {
    /// Parse a MIME type, ignoring parameters such as `; charset=utf-8`.
    pub fn parse(raw: &str) -> Result<Self, CodecError> {
        let essence = raw.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case(APPLICATION_JSON) {
            Ok(Self::Json)
        } else if essence.eq_ignore_ascii_case(TEXT_CSV) {
            Ok(Self::Csv)
        } else {
            Err(CodecError::UnsupportedContentType {
                content_type: raw.to_string(),
            })
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Json => APPLICATION_JSON,
            Self::Csv => TEXT_CSV,
        }
    }

    /// Serialize a structured value into a body of this content type.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| CodecError::Encode {
                content_type: APPLICATION_JSON,
                message: e.to_string(),
            }),
            Self::Csv => encode_csv(value),
        }
    }

    /// Deserialize a body of this content type into a structured value.
    pub fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
        match self {
            Self::Json => decode_json(body),
            Self::Csv => decode_csv(body),
        }
    }
}

impl FromStr for ContentType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// The serialization contract configured for an endpoint.
///
/// Kept as raw MIME strings so that a misconfigured contract can be carried
/// around (in a saved handle, say) and rejected at the point of use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    /// MIME type of request bodies.
    pub content_type: String,
    /// MIME type requested for response bodies.
    pub accept: String,
}

impl CodecSpec {
    pub fn new(content_type: impl Into<String>, accept: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            accept: accept.into(),
        }
    }

    /// Resolve both sides of the contract, failing on the first unsupported type.
    pub fn resolve(&self) -> Result<ResolvedCodec, CodecError> {
        Ok(ResolvedCodec {
            request: ContentType::parse(&self.content_type)?,
            response: ContentType::parse(&self.accept)?,
        })
    }
}

impl Default for CodecSpec {
    fn default() -> Self {
        Self::new(APPLICATION_JSON, APPLICATION_JSON)
    }
}

/// A codec contract whose content types are known to be supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCodec {
    pub request: ContentType,
    pub response: ContentType,
}

fn decode_json(body: &[u8]) -> Result<Value, CodecError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| CodecError::Decode {
        content_type: APPLICATION_JSON,
        message: e.to_string(),
    })?;

    // A dataframe serialized to JSON and then sent as a JSON string arrives
    // double-encoded. Unwrap one level when the inner text is a document.
    if let Value::String(inner) = &value {
        if let Ok(doc @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(inner) {
            return Ok(doc);
        }
    }
    Ok(value)
}

fn encode_csv(value: &Value) -> Result<Vec<u8>, CodecError> {
    let rows: Vec<Vec<&Value>> = match value {
        Value::Array(items) if items.iter().all(is_scalar) => vec![items.iter().collect()],
        Value::Array(items) => items.iter().map(row_cells).collect(),
        other => vec![row_cells(other)],
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());
    for row in rows {
        let cells = row
            .into_iter()
            .map(csv_cell)
            .collect::<Result<Vec<_>, _>>()?;
        writer.write_record(&cells).map_err(csv_encode_error)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv_encode_error(e.into_error()))
}

fn row_cells(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(cells) => cells.iter().collect(),
        Value::Object(map) => map.values().collect(),
        scalar => vec![scalar],
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn csv_cell(value: &Value) -> Result<String, CodecError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(CodecError::Encode {
            content_type: TEXT_CSV,
            message: "nested arrays or objects cannot be written to a CSV cell".to_string(),
        }),
    }
}

fn csv_encode_error(err: impl fmt::Display) -> CodecError {
    CodecError::Encode {
        content_type: TEXT_CSV,
        message: err.to_string(),
    }
}

fn decode_csv(body: &[u8]) -> Result<Value, CodecError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| CodecError::Decode {
            content_type: TEXT_CSV,
            message: e.to_string(),
        })?;
        rows.push(Value::Array(record.iter().map(parse_cell).collect()));
    }
    Ok(Value::Array(rows))
}

fn parse_cell(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(cell.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_supported_types() {
        assert_eq!(ContentType::parse("application/json").unwrap(), ContentType::Json);
        assert_eq!(
            ContentType::parse("Application/JSON; charset=utf-8").unwrap(),
            ContentType::Json
        );
        assert_eq!(ContentType::parse("text/csv").unwrap(), ContentType::Csv);
    }

    #[test]
    fn test_parse_rejects_xml() {
        let err = ContentType::parse("application/xml").unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnsupportedContentType { ref content_type } if content_type == "application/xml"
        ));
        assert!(err.to_string().contains("application/xml"));
    }

    #[test]
    fn test_codec_spec_resolve_checks_accept_side() {
        let spec = CodecSpec::new(APPLICATION_JSON, "text/html");
        assert!(spec.resolve().is_err());
        let resolved = CodecSpec::new(APPLICATION_JSON, TEXT_CSV).resolve().unwrap();
        assert_eq!(resolved.response, ContentType::Csv);
    }

    #[test]
    fn test_json_decode_unwraps_double_encoded_document() {
        let inner = json!({"date": ["2021-05-01"], "incomes": [12.5]}).to_string();
        let body = serde_json::to_vec(&Value::String(inner)).unwrap();
        let decoded = ContentType::Json.decode(&body).unwrap();
        assert_eq!(decoded, json!({"date": ["2021-05-01"], "incomes": [12.5]}));
    }

    #[test]
    fn test_json_decode_keeps_plain_strings() {
        let decoded = ContentType::Json.decode(br#""42""#).unwrap();
        assert_eq!(decoded, json!("42"));
    }

    #[test]
    fn test_json_decode_invalid_body() {
        let err = ContentType::Json.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn test_csv_encode_object_as_single_row() {
        let body = ContentType::Csv
            .encode(&json!({"a": 1, "b": "x", "c": null}))
            .unwrap();
        assert_eq!(String::from_utf8(body).unwrap(), "1,x,\n");
    }

    #[test]
    fn test_csv_encode_rows() {
        let body = ContentType::Csv
            .encode(&json!([[1, 2.5], [3, true]]))
            .unwrap();
        assert_eq!(String::from_utf8(body).unwrap(), "1,2.5\n3,true\n");
    }

    #[test]
    fn test_csv_encode_flat_array_is_one_row() {
        let body = ContentType::Csv.encode(&json!([0.1, 0.9])).unwrap();
        assert_eq!(String::from_utf8(body).unwrap(), "0.1,0.9\n");
    }

    #[test]
    fn test_csv_encode_rejects_nested_cells() {
        let err = ContentType::Csv
            .encode(&json!([{"a": {"nested": 1}}]))
            .unwrap_err();
        assert!(matches!(err, CodecError::Encode { .. }));
    }

    #[test]
    fn test_csv_decode_types_cells() {
        let decoded = ContentType::Csv.decode(b"1,0.25,,label\n2,3.5,x,\n").unwrap();
        assert_eq!(
            decoded,
            json!([[1, 0.25, null, "label"], [2, 3.5, "x", null]])
        );
    }
}
