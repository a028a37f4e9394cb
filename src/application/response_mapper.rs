//! Decoding of raw transport results into domain records.
//!
//! Only the status check is strict. Once a 2xx body parses as JSON, every
//! field is read leniently: missing or mistyped fields degrade to `None` or
//! empty values and unknown fields are ignored.

use serde_json::Value;

use crate::domain::{
    CompressStrategy, CompressResponse, CompressionInfo, Context, CreateContextResponse,
    GetContextResponse, HttpError, ListContextsResponse, Message, Metadata, MutationResponse,
    UltraContextResult, Version,
};
use crate::ports::out_ports::{HttpResponse, Method};

/// Header carrying the server's current version on some responses
pub const VERSION_HEADER: &str = "x-context-version";

/// Records that can be read from a decoded JSON payload
pub trait FromWire: Sized {
    fn from_wire(value: &Value) -> Self;
}

/// Decode a response into `T`, failing on non-2xx or a non-JSON body
pub fn decode<T: FromWire>(
    method: Method,
    url: &str,
    response: &HttpResponse,
) -> UltraContextResult<T> {
    if !response.is_success() {
        return Err(http_error(method, url, response).into());
    }
    let payload = parse_body(method, url, response)?;
    Ok(T::from_wire(&payload))
}

/// Build the diagnostic error for a failed exchange
pub fn http_error(method: Method, url: &str, response: &HttpResponse) -> HttpError {
    let body = body_text(response);
    let server_message = body
        .as_deref()
        .and_then(|text| serde_json::from_str::<Value>(text).ok())
        .and_then(|payload| server_message(&payload));

    let message = match server_message {
        Some(detail) => format!(
            "{method} {url} failed with status {}: {detail}",
            response.status
        ),
        None => format!("{method} {url} failed with status {}", response.status),
    };

    HttpError {
        message,
        status: response.status,
        url: url.to_string(),
        body,
    }
}

/// Whether a status signals a failed version precondition
pub fn is_conflict_status(status: u16) -> bool {
    status == 409 || status == 412
}

/// Authoritative version reported alongside a conflict
pub fn conflict_version(response: &HttpResponse) -> Option<u64> {
    let from_body = serde_json::from_slice::<Value>(&response.body)
        .ok()
        .and_then(|payload| {
            u64_field(&payload, "current_version")
                .or_else(|| u64_field(&payload, "version"))
                .or_else(|| {
                    payload
                        .get("error")
                        .and_then(|error| u64_field(error, "current_version"))
                })
        });

    from_body.or_else(|| {
        response
            .header(VERSION_HEADER)
            .and_then(|value| value.trim().parse().ok())
    })
}

fn parse_body(method: Method, url: &str, response: &HttpResponse) -> Result<Value, HttpError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&response.body).map_err(|err| HttpError {
        message: format!("{method} {url} returned an invalid JSON body: {err}"),
        status: response.status,
        url: url.to_string(),
        body: body_text(response),
    })
}

fn body_text(response: &HttpResponse) -> Option<String> {
    if response.body.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&response.body).into_owned())
}

fn server_message(payload: &Value) -> Option<String> {
    for key in ["error", "message", "detail"] {
        match payload.get(key) {
            Some(Value::String(text)) => return Some(text.clone()),
            Some(nested @ Value::Object(_)) => {
                if let Some(text) = server_message(nested) {
                    return Some(text);
                }
            }
            _ => {}
        }
    }
    None
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn u64_field(payload: &Value, key: &str) -> Option<u64> {
    match payload.get(key)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn object_field(payload: &Value, key: &str) -> Option<Metadata> {
    payload.get(key).and_then(Value::as_object).cloned()
}

fn list_field<T: FromWire>(payload: &Value, key: &str) -> Vec<T> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().map(T::from_wire).collect())
        .unwrap_or_default()
}

impl FromWire for Context {
    fn from_wire(value: &Value) -> Self {
        Self {
            id: string_field(value, "id").unwrap_or_default(),
            metadata: object_field(value, "metadata").unwrap_or_default(),
            created_at: string_field(value, "created_at"),
        }
    }
}

impl FromWire for Message {
    fn from_wire(value: &Value) -> Self {
        let content = match value.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Self {
            id: string_field(value, "id").unwrap_or_default(),
            index: u64_field(value, "index"),
            role: string_field(value, "role").unwrap_or_default(),
            content,
            metadata: object_field(value, "metadata").unwrap_or_default(),
        }
    }
}

impl FromWire for Version {
    fn from_wire(value: &Value) -> Self {
        let affected = value
            .get("affected")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| match id {
                        Value::String(text) => Some(text.clone()),
                        Value::Number(number) => Some(number.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            version: u64_field(value, "version").unwrap_or_default(),
            created_at: string_field(value, "created_at"),
            operation: string_field(value, "operation").unwrap_or_default(),
            affected,
            metadata: object_field(value, "metadata"),
        }
    }
}

impl FromWire for CompressionInfo {
    fn from_wire(value: &Value) -> Self {
        Self {
            strategy: value
                .get("strategy")
                .and_then(Value::as_str)
                .and_then(CompressStrategy::parse),
            compressed_messages: u64_field(value, "compressed_messages").unwrap_or_default(),
            original_size: u64_field(value, "original_size"),
            compressed_size: u64_field(value, "compressed_size"),
        }
    }
}

impl FromWire for CreateContextResponse {
    fn from_wire(value: &Value) -> Self {
        Self {
            id: string_field(value, "id").unwrap_or_default(),
            metadata: object_field(value, "metadata"),
            created_at: string_field(value, "created_at"),
            version: u64_field(value, "version"),
        }
    }
}

impl FromWire for ListContextsResponse {
    fn from_wire(value: &Value) -> Self {
        let data = match value {
            Value::Array(items) => items.iter().map(Context::from_wire).collect(),
            _ => list_field(value, "data"),
        };
        Self { data }
    }
}

impl FromWire for GetContextResponse {
    fn from_wire(value: &Value) -> Self {
        Self {
            data: list_field(value, "data"),
            version: u64_field(value, "version"),
            versions: list_field(value, "versions"),
        }
    }
}

impl FromWire for MutationResponse {
    fn from_wire(value: &Value) -> Self {
        Self {
            data: list_field(value, "data"),
            version: u64_field(value, "version"),
        }
    }
}

impl FromWire for CompressResponse {
    fn from_wire(value: &Value) -> Self {
        Self {
            data: list_field(value, "data"),
            version: u64_field(value, "version"),
            compression: value
                .get("compression")
                .map(CompressionInfo::from_wire)
                .unwrap_or_default(),
        }
    }
}
