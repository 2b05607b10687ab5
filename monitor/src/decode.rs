use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Rules applied when turning decoded values into series updates.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Treat a value of exactly zero as "no data" for that key.
    ///
    /// Dashboards in the field have always skipped zero readings, so this
    /// stays on unless explicitly disabled.
    pub treat_zero_as_absent: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            treat_zero_as_absent: true,
        }
    }
}

/// A flat `key -> value` telemetry payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    fields: Map<String, Value>,
}

impl DecodedPayload {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Keys carrying a usable numeric reading.
    pub fn measurements<'a>(
        &'a self,
        options: &'a DecodeOptions,
    ) -> impl Iterator<Item = (&'a str, f64)> + 'a {
        self.fields
            .iter()
            .filter_map(move |(key, value)| numeric(value, options).map(|v| (key.as_str(), v)))
    }
}

/// Numeric reading of a single value, if it counts as an update.
pub fn numeric(value: &Value, options: &DecodeOptions) -> Option<f64> {
    let v = value.as_f64().filter(|v| v.is_finite())?;
    if options.treat_zero_as_absent && v == 0.0 {
        return None;
    }
    Some(v)
}

/// Parses a raw bus payload.
pub fn decode(payload: &[u8]) -> Result<DecodedPayload, DecodeError> {
    match serde_json::from_slice::<Value>(payload).map_err(DecodeError::MalformedJson)? {
        Value::Object(fields) => Ok(DecodedPayload { fields }),
        _ => Err(DecodeError::NotAnObject),
    }
}
