use std::collections::BTreeMap;

use crate::profiles::{AuthField, FieldType, SubscriptionField};

pub type Headers = BTreeMap<String, String>;

pub const SUBSCRIPTION_ID_HEADER: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("field `{field}` must be a valid number, got `{value}`")]
    InvalidNumber { field: String, value: String },
    #[error("field `{field}` must be \"true\" or \"false\", got `{value}`")]
    InvalidBoolean { field: String, value: String },
    #[error("field `{field}` is not valid JSON: {message}")]
    InvalidJson { field: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("add at least one authentication header")]
    NoAuthFields,
    #[error("fill in at least one authentication header with a valid name")]
    NoValidAuthHeaders,
    #[error(transparent)]
    Field(#[from] ValidationError),
}

/// CONNECT headers plus the names whose value was left blank. Blank values
/// are sent as-is; callers surface them as warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub headers: Headers,
    pub blank_values: Vec<String>,
}

pub fn build_auth_headers(fields: &[AuthField]) -> Result<AuthHeaders, HeaderError> {
    if fields.is_empty() {
        return Err(HeaderError::NoAuthFields);
    }
    let mut headers = Headers::new();
    let mut blank_values = Vec::new();
    for field in fields {
        let name = field.name.trim();
        if name.is_empty() {
            continue;
        }
        let value = field.value.trim();
        if value.is_empty() {
            blank_values.push(name.to_string());
        }
        headers.insert(name.to_string(), value.to_string());
    }
    if headers.is_empty() {
        return Err(HeaderError::NoValidAuthHeaders);
    }
    Ok(AuthHeaders {
        headers,
        blank_values,
    })
}

/// Last path segment of the destination, used as the subscription id.
pub fn subscription_id(destination: &str) -> Option<String> {
    destination
        .trim()
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Converts the raw text of a field into the header value sent on the wire.
pub fn convert_field_value(
    name: &str,
    field_type: FieldType,
    raw: &str,
) -> Result<String, ValidationError> {
    let value = raw.trim();
    match field_type {
        FieldType::String => Ok(value.to_string()),
        FieldType::Number => {
            let invalid = || ValidationError::InvalidNumber {
                field: name.to_string(),
                value: value.to_string(),
            };
            let number: f64 = value.parse().map_err(|_| invalid())?;
            if !number.is_finite() {
                return Err(invalid());
            }
            // -0 prints as "-0"
            let number = if number == 0.0 { 0.0 } else { number };
            Ok(format_number(number))
        }
        FieldType::Boolean => match value.to_ascii_lowercase().as_str() {
            lower @ ("true" | "false") => Ok(lower.to_string()),
            _ => Err(ValidationError::InvalidBoolean {
                field: name.to_string(),
                value: value.to_string(),
            }),
        },
        FieldType::Json => serde_json::from_str::<serde_json::Value>(value)
            .map(|parsed| parsed.to_string())
            .map_err(|err| ValidationError::InvalidJson {
                field: name.to_string(),
                message: err.to_string(),
            }),
        FieldType::Array => {
            let items: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .collect();
            Ok(serde_json::Value::from(items).to_string())
        }
    }
}

/// Shortest round-trip text for a finite number. Magnitudes from 1e21 up and
/// below 1e-6 switch to exponent form with a signed exponent (`1e+21`,
/// `1e-7`).
fn format_number(number: f64) -> String {
    let magnitude = number.abs();
    if magnitude < 1e21 && (magnitude == 0.0 || magnitude >= 1e-6) {
        return number.to_string();
    }
    let formatted = format!("{number:e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{mantissa}e+{exponent}")
        }
        _ => formatted,
    }
}

/// Inline check used while editing. Blank values are always accepted.
pub fn validate_field(field: &SubscriptionField) -> Result<(), ValidationError> {
    if field.value.trim().is_empty() {
        return Ok(());
    }
    convert_field_value(&field.name, field.field_type, &field.value).map(|_| ())
}

/// Builds SUBSCRIBE headers. Fields with a blank name or blank value are
/// skipped; the first conversion failure aborts the whole set.
pub fn build_subscription_headers(
    destination: &str,
    fields: &[SubscriptionField],
) -> Result<Headers, ValidationError> {
    let mut headers = Headers::new();
    if let Some(id) = subscription_id(destination) {
        headers.insert(SUBSCRIPTION_ID_HEADER.to_string(), id);
    }
    for field in fields {
        let name = field.name.trim();
        if name.is_empty() || field.value.trim().is_empty() {
            continue;
        }
        let converted = convert_field_value(name, field.field_type, &field.value)?;
        headers.insert(name.to_string(), converted);
    }
    Ok(headers)
}
