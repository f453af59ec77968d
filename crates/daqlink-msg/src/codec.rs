//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire codec, transport backends and command dispatch."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Textual command format and response extractors.
//!
//! Commands are flat, object-shaped strings with a fixed field order per
//! operation. Every string value goes through [`escape`] before it is
//! embedded.
//!
//! Responses are *not* guaranteed to be strict JSON. Plot reads in particular
//! end with a `data` field whose value is an unescaped JSON document, so
//! [`extract_multi_field`] is a dedicated two-phase scanner rather than a JSON
//! parser. Protocol changes must not assume the trailing field is escaped.
use std::fmt::Write as _;

use indexmap::IndexMap;

use crate::types::Version;
use crate::{DaqError, Result};

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Escaped and quoted on the wire.
    Text(String),
    /// Emitted bare.
    Int(i64),
    /// Emitted as `true`/`false`.
    Bool(bool),
}

/// Ordered set of named payload fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    fields: Vec<(&'static str, FieldValue)>,
}

impl Payload {
    /// Start an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string field.
    pub fn with_text(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((name, FieldValue::Text(value.into())));
        self
    }

    /// Append an integer field.
    pub fn with_int(mut self, name: &'static str, value: i64) -> Self {
        self.fields.push((name, FieldValue::Int(value)));
        self
    }

    /// Append a boolean field.
    pub fn with_bool(mut self, name: &'static str, value: bool) -> Self {
        self.fields.push((name, FieldValue::Bool(value)));
        self
    }

    /// Look up a field value by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    /// Look up a string field by name.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Look up an integer field by name.
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(FieldValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Field names in wire order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(name, _)| *name)
    }

    /// Serialize into the wire representation.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(self.estimated_len());
        out.push('{');
        for (index, (name, value)) in self.fields.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push('"');
            out.push_str(&escape(name));
            out.push_str("\":");
            match value {
                FieldValue::Text(text) => {
                    out.push('"');
                    out.push_str(&escape(text));
                    out.push('"');
                }
                FieldValue::Int(number) => {
                    let _ = write!(out, "{number}");
                }
                FieldValue::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
            }
        }
        out.push('}');
        out
    }

    fn estimated_len(&self) -> usize {
        self.fields
            .iter()
            .map(|(name, value)| {
                name.len()
                    + 6
                    + match value {
                        FieldValue::Text(text) => text.len() + 2,
                        FieldValue::Int(_) => 20,
                        FieldValue::Bool(_) => 5,
                    }
            })
            .sum::<usize>()
            + 2
    }
}

/// Escape a value for embedding inside a quoted wire string.
///
/// Quotes, backslashes and control characters are escaped; everything else is
/// passed through unchanged.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`] (and the JSON escape set in general).
pub fn unescape(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000c}'),
            Some('u') => {
                let high = read_hex4(&mut chars)?;
                let code = if (0xD800..0xDC00).contains(&high) {
                    if chars.next() != Some('\\') || chars.next() != Some('u') {
                        return Err(DaqError::protocol("unpaired surrogate in escape"));
                    }
                    let low = read_hex4(&mut chars)?;
                    if !(0xDC00..0xE000).contains(&low) {
                        return Err(DaqError::protocol("invalid low surrogate in escape"));
                    }
                    0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00)
                } else {
                    high
                };
                let decoded = char::from_u32(code)
                    .ok_or_else(|| DaqError::protocol(format!("invalid code point {code:#x}")))?;
                out.push(decoded);
            }
            Some(other) => {
                return Err(DaqError::protocol(format!("invalid escape '\\{other}'")));
            }
            None => return Err(DaqError::protocol("trailing backslash")),
        }
    }
    Ok(out)
}

fn read_hex4(chars: &mut std::str::Chars<'_>) -> Result<u32> {
    let mut code = 0u32;
    for _ in 0..4 {
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .ok_or_else(|| DaqError::protocol("truncated unicode escape"))?;
        code = code * 16 + digit;
    }
    Ok(code)
}

/// Strip `{"<key>":"` … `"}` from a response and unescape the inner blob.
///
/// Whitespace around the wrapper tokens is tolerated.
pub fn extract_wrapped_field(response: &str, key: &str) -> Result<String> {
    // `{"":""}` around the key
    let minimum = key.len() + 7;
    let trimmed = response.trim();
    if trimmed.len() < minimum {
        return Err(DaqError::protocol(format!(
            "response of {} bytes is shorter than the {minimum} byte '{key}' wrapper",
            trimmed.len()
        )));
    }
    let quoted_key = format!("\"{key}\"");
    let inner = trimmed
        .strip_prefix('{')
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix(quoted_key.as_str()))
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('"'))
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim_end)
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| {
            DaqError::protocol(format!("response is not wrapped in a '{key}' field"))
        })?;
    unescape(inner)
}

/// Parse the backend-assigned version out of `{"version": <int>}`.
///
/// The integer may be bare or quoted. Negative or non-numeric values are
/// rejected.
pub fn extract_version(response: &str) -> Result<Version> {
    let body = response
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
        .and_then(|rest| rest.strip_prefix("\"version\""))
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
        .ok_or_else(|| DaqError::protocol(format!("no version envelope in '{response}'")))?;
    let digits = body
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(body);
    let version = digits
        .parse::<Version>()
        .map_err(|err| DaqError::protocol(format!("version '{digits}' is not an integer: {err}")))?;
    if version < 0 {
        return Err(DaqError::protocol(format!(
            "backend returned negative version {version}"
        )));
    }
    Ok(version)
}

/// Extract the fields of a multi-field response whose last field is a raw blob.
///
/// Phase one reads `"key":value` pairs left to right, where the value is a
/// quoted token or a bare token such as an integer. Once the key `data` is
/// read, phase two takes everything from its opening quote up to the last
/// `"` in the response verbatim, so the blob may contain its own quotes.
/// Fields after `data` are therefore never seen.
pub fn extract_multi_field(response: &str) -> Result<IndexMap<String, String>> {
    let bytes = response.as_bytes();
    let mut fields = IndexMap::new();
    let mut pos = skip_whitespace(bytes, 0);
    if bytes.get(pos) == Some(&b'{') {
        pos += 1;
    }

    loop {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] == b'}' {
            break;
        }

        let (key, after_key) = read_quoted(response, pos)?;
        pos = skip_whitespace(bytes, after_key);
        if bytes.get(pos) != Some(&b':') {
            return Err(DaqError::protocol(format!(
                "expected ':' after key '{key}' at byte {pos}"
            )));
        }
        pos = skip_whitespace(bytes, pos + 1);

        if key == "data" {
            if bytes.get(pos) != Some(&b'"') {
                return Err(DaqError::protocol("data field is not a quoted blob"));
            }
            let start = pos + 1;
            let end = response
                .rfind('"')
                .filter(|end| *end >= start)
                .ok_or_else(|| DaqError::protocol("data field is not terminated"))?;
            fields.insert(key, response[start..end].to_owned());
            return Ok(fields);
        }

        let value = if bytes.get(pos) == Some(&b'"') {
            let (value, after_value) = read_quoted(response, pos)?;
            pos = after_value;
            value
        } else {
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b',' && bytes[pos] != b'}' {
                pos += 1;
            }
            let token = response[start..pos].trim();
            if token.is_empty() {
                return Err(DaqError::protocol(format!("missing value for key '{key}'")));
            }
            token.to_owned()
        };
        fields.insert(key, value);
    }

    Ok(fields)
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Read the quoted token starting at `pos`, returning it unescaped together
/// with the position after the closing quote.
fn read_quoted(source: &str, pos: usize) -> Result<(String, usize)> {
    let bytes = source.as_bytes();
    if bytes.get(pos) != Some(&b'"') {
        return Err(DaqError::protocol(format!(
            "expected a quoted token at byte {pos}"
        )));
    }
    let mut index = pos + 1;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b'"' => return Ok((unescape(&source[pos + 1..index])?, index + 1)),
            _ => index += 1,
        }
    }
    Err(DaqError::protocol(format!(
        "unterminated quoted token starting at byte {pos}"
    )))
}

/// Plot entry returned by a plot read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotRecord {
    /// Drawing options stored alongside the plot.
    pub draw_options: String,
    /// Insertion time, when the backend reports it.
    pub timestamp: Option<i64>,
    /// Version the backend actually returned.
    pub version: Version,
    /// Raw plot document.
    pub data: String,
}

impl PlotRecord {
    /// Parse a plot read response.
    pub fn from_response(response: &str) -> Result<Self> {
        let mut fields = extract_multi_field(response)?;
        // older middleman builds spell it without the trailing 's'
        let draw_options = fields
            .shift_remove("draw_options")
            .or_else(|| fields.shift_remove("draw_option"))
            .ok_or_else(|| DaqError::protocol("plot response has no draw_options"))?;
        let version_token = fields
            .shift_remove("version")
            .ok_or_else(|| DaqError::protocol("plot response has no version"))?;
        let version = version_token.trim().parse::<Version>().map_err(|_| {
            DaqError::protocol(format!("plot version '{version_token}' is not an integer"))
        })?;
        let timestamp = fields
            .shift_remove("timestamp")
            .map(|token| {
                token.trim().parse::<i64>().map_err(|_| {
                    DaqError::protocol(format!("plot timestamp '{token}' is not an integer"))
                })
            })
            .transpose()?;
        let data = fields
            .shift_remove("data")
            .ok_or_else(|| DaqError::protocol("plot response has no data"))?;
        Ok(Self {
            draw_options,
            timestamp,
            version,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_preserves_field_order_and_escapes_strings() {
        let payload = Payload::new()
            .with_text("topic", "logging")
            .with_int("time", 0)
            .with_text("device", "tank\"3")
            .with_int("severity", 2)
            .with_text("message", "path C:\\data\nnext");
        assert_eq!(
            payload.to_wire(),
            r#"{"topic":"logging","time":0,"device":"tank\"3","severity":2,"message":"path C:\\data\nnext"}"#
        );
        let names: Vec<_> = payload.names().collect();
        assert_eq!(names, ["topic", "time", "device", "severity", "message"]);
    }

    #[test]
    fn escaped_payload_is_valid_json() {
        let payload = Payload::new()
            .with_text("data", r#"{"a":"b\c"}"#)
            .with_bool("persistent", true)
            .with_text("bell", "\u{7}");
        let parsed: serde_json::Value = serde_json::from_str(&payload.to_wire()).unwrap();
        assert_eq!(parsed["data"], r#"{"a":"b\c"}"#);
        assert_eq!(parsed["persistent"], true);
        assert_eq!(parsed["bell"], "\u{7}");
    }

    #[test]
    fn unescape_reverses_escape() {
        let original = "quote \" slash \\ tab \t é \u{1F600}";
        assert_eq!(unescape(&escape(original)).unwrap(), original);
        assert_eq!(unescape(r"\ud83d\ude00").unwrap(), "\u{1F600}");
        assert!(unescape(r"bad \q").is_err());
        assert!(unescape("dangling \\").is_err());
    }

    #[test]
    fn wrapped_field_recovers_inner_blob() {
        let response = "{\"data\":\"{\\\"a\\\":1}\"}";
        assert_eq!(extract_wrapped_field(response, "data").unwrap(), "{\"a\":1}");
        assert_eq!(
            extract_wrapped_field(r#"{"data": "plain" }"#, "data").unwrap(),
            "plain"
        );
        assert_eq!(extract_wrapped_field(r#"{"data":""}"#, "data").unwrap(), "");
    }

    #[test]
    fn wrapped_field_rejects_short_or_foreign_responses() {
        let err = extract_wrapped_field("{}", "data").unwrap_err();
        assert!(err.to_string().contains("shorter"));
        assert!(extract_wrapped_field(r#"{"rows":"x"}"#, "data").is_err());
        assert!(extract_wrapped_field(r#"{"data":12345}"#, "data").is_err());
    }

    #[test]
    fn version_accepts_quoted_and_bare_integers() {
        assert_eq!(extract_version("{\"version\":\"3\"}").unwrap(), 3);
        assert_eq!(extract_version(r#"{"version": 12}"#).unwrap(), 12);
        assert_eq!(extract_version(" {\"version\":0}\n").unwrap(), 0);
    }

    #[test]
    fn version_rejects_non_numeric_payloads() {
        let err = extract_version("{\"version\":\"abc\"}").unwrap_err();
        assert!(matches!(err, DaqError::Protocol(_)));
        assert!(extract_version(r#"{"version":-4}"#).is_err());
        assert!(extract_version(r#"{"data":"3"}"#).is_err());
        assert!(extract_version("").is_err());
    }

    #[test]
    fn multi_field_keeps_trailing_blob_intact() {
        let response = r#"{"draw_options":"ALP","timestamp":"1000","version":2,"data":"{\"x\":[1,2]}"}"#;
        let fields = extract_multi_field(response).unwrap();
        assert_eq!(fields["draw_options"], "ALP");
        assert_eq!(fields["timestamp"], "1000");
        assert_eq!(fields["version"], "2");
        assert_eq!(fields["data"], r#"{\"x\":[1,2]}"#);
    }

    #[test]
    fn multi_field_tolerates_unescaped_quotes_in_blob() {
        let response = r#"{"draw_options":"colz","version":7,"data":"{"_typename":"TH2D","fTitle":"a, b"}"}"#;
        let fields = extract_multi_field(response).unwrap();
        assert_eq!(fields["version"], "7");
        assert_eq!(fields["data"], r#"{"_typename":"TH2D","fTitle":"a, b"}"#);
        assert_eq!(
            fields.keys().collect::<Vec<_>>(),
            ["draw_options", "version", "data"]
        );
    }

    #[test]
    fn multi_field_reports_malformed_input() {
        assert!(extract_multi_field(r#"{"version" 2}"#).is_err());
        assert!(extract_multi_field(r#"{"version":,"data":"x"}"#).is_err());
        assert!(extract_multi_field(r#"{"data":12}"#).is_err());
        assert!(extract_multi_field(r#"{"data":"unterminated}"#).is_err());
        assert!(extract_multi_field(r#"{"draw_options":"ALP"#).is_err());
    }

    #[test]
    fn plot_record_parses_complete_response() {
        let record = PlotRecord::from_response(
            r#"{"draw_options":"ALP","timestamp":"1000","version":2,"data":"{"x":[1,2]}"}"#,
        )
        .unwrap();
        assert_eq!(record.draw_options, "ALP");
        assert_eq!(record.timestamp, Some(1000));
        assert_eq!(record.version, 2);
        assert_eq!(record.data, r#"{"x":[1,2]}"#);
    }

    #[test]
    fn plot_record_requires_fields() {
        let missing_version =
            PlotRecord::from_response(r#"{"draw_options":"ALP","data":"{}"}"#).unwrap_err();
        assert!(missing_version.to_string().contains("no version"));

        let bad_version =
            PlotRecord::from_response(r#"{"draw_options":"ALP","version":"two","data":"{}"}"#)
                .unwrap_err();
        assert!(bad_version.to_string().contains("not an integer"));

        let no_data = PlotRecord::from_response(r#"{"draw_options":"ALP","version":1}"#);
        assert!(no_data.is_err());

        let legacy =
            PlotRecord::from_response(r#"{"draw_option":"P","version":4,"data":"[]"}"#).unwrap();
        assert_eq!(legacy.draw_options, "P");
        assert_eq!(legacy.timestamp, None);
    }
}
