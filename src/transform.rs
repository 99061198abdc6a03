//! Payload transform pipeline.
//!
//! Three functions sit between publishers, the wire and subscribers:
//! - `encode` (alias `stringify`): applied by `publish` before the payload
//!   is serialized onto the wire.
//! - `decode` (alias `format`): applied by the dispatcher to each inbound
//!   wire value before fan-out.
//! - `enrich` (alias `on_message`): computes the `contextValue` mapping
//!   delivered alongside the decoded payload.
//!
//! Unconfigured functions are identity (`encode`/`decode`) or produce an
//! empty mapping (`enrich`).

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{Map, Value};

/// Result type for transform functions.
pub type Result<T> = std::result::Result<T, TransformError>;

/// Errors raised by a transform step.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Enrich failed: {0}")]
    Enrich(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TransformError {
    fn from(e: serde_json::Error) -> Self {
        TransformError::Serialization(e.to_string())
    }
}

type ValueFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;
type EnrichFn = Arc<dyn Fn(&Value) -> Result<Map<String, Value>> + Send + Sync>;

/// Configured encode/decode/enrich functions.
///
/// Cheap to clone; the functions are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct Transforms {
    encode: Option<ValueFn>,
    decode: Option<ValueFn>,
    enrich: Option<EnrichFn>,
}

impl fmt::Debug for Transforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transforms")
            .field("encode", &self.encode.is_some())
            .field("decode", &self.decode.is_some())
            .field("enrich", &self.enrich.is_some())
            .finish()
    }
}

impl Transforms {
    /// Identity transforms with an empty enrichment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function applied to payloads before they are published.
    pub fn with_encode<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.encode = Some(Arc::new(f));
        self
    }

    /// Alias for [`Transforms::with_encode`].
    pub fn with_stringify<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.with_encode(f)
    }

    /// Set the function applied to inbound wire values before delivery.
    pub fn with_decode<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.decode = Some(Arc::new(f));
        self
    }

    /// Alias for [`Transforms::with_decode`].
    pub fn with_format<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.with_decode(f)
    }

    /// Set the function that derives `contextValue` from the raw wire value.
    pub fn with_enrich<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Map<String, Value>> + Send + Sync + 'static,
    {
        self.enrich = Some(Arc::new(f));
        self
    }

    /// Alias for [`Transforms::with_enrich`].
    pub fn with_on_message<F>(self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Map<String, Value>> + Send + Sync + 'static,
    {
        self.with_enrich(f)
    }

    /// Apply `encode` and serialize the result into its wire form.
    pub fn encode(&self, value: Value) -> Result<String> {
        let encoded = match &self.encode {
            Some(f) => guarded(|| f(value), TransformError::Encode)?,
            None => value,
        };
        Ok(serde_json::to_string(&encoded)?)
    }

    /// Parse a wire payload and apply `decode`.
    pub fn decode(&self, wire: &Value) -> Result<Value> {
        match &self.decode {
            Some(f) => guarded(|| f(wire.clone()), TransformError::Decode),
            None => Ok(wire.clone()),
        }
    }

    /// Compute the enrichment mapping for a wire value.
    pub fn enrich(&self, wire: &Value) -> Result<Map<String, Value>> {
        match &self.enrich {
            Some(f) => guarded(|| f(wire), TransformError::Enrich),
            None => Ok(Map::new()),
        }
    }
}

/// Parse a raw wire string.
///
/// Payloads that are not JSON (keyspace notifications carry bare event names
/// such as `set` or `expired`) are kept as a JSON string.
pub fn parse_wire(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Run a user-supplied transform, turning a panic into a `TransformError`.
fn guarded<T>(f: impl FnOnce() -> Result<T>, wrap: fn(String) -> TransformError) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(wrap(panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Read a value as an integer the way a loosely typed caller would:
/// numbers pass through, numeric strings are parsed with a leading-digit scan.
///
/// Useful for building numeric transforms over wire values.
pub fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim_start();
            let (sign, digits) = match s.strip_prefix('-') {
                Some(rest) => (-1, rest),
                None => (1, s.strip_prefix('+').unwrap_or(s)),
            };
            let end = digits
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(digits.len());
            digits[..end].parse::<i64>().ok().map(|n| sign * n)
        }
        _ => None,
    }
}
