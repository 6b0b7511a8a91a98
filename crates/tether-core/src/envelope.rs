//! Envelope wire format.
//!
//! One JSON object per socket frame:
//!
//! ```text
//! { "path": string, "id": integer, "method"?: string, "args"?: array,
//!   "return"?: any, "error"?: any }
//! ```
//!
//! A frame with `method` is a request; without it, a response. A response
//! with neither `return` nor `error` is a void success. Frames missing `path`
//! or `id` are rejected by [`Envelope::parse`] and never reach a handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id of a call within one connection.
pub type CallId = u64;

/// Why a raw frame could not be turned into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Not a JSON object, or a field has the wrong type.
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// `path` is absent or empty.
    #[error("envelope is missing 'path'")]
    MissingPath,
    /// `id` is absent.
    #[error("envelope is missing 'id'")]
    MissingId,
}

/// The structured record exchanged over the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dot-hierarchical target, e.g. `math` or `admin.users`.
    pub path: String,
    /// Correlation id; a response echoes its request's id.
    pub id: CallId,
    /// Method name; present only on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Positional arguments; present only on requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    /// Success payload of a response.
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload of a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Lenient mirror of [`Envelope`] so missing fields can be reported by name.
#[derive(Deserialize)]
struct RawEnvelope {
    path: Option<String>,
    id: Option<CallId>,
    method: Option<String>,
    args: Option<Vec<Value>>,
    #[serde(rename = "return")]
    result: Option<Value>,
    error: Option<Value>,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(
        path: impl Into<String>,
        id: CallId,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            path: path.into(),
            id,
            method: Some(method.into()),
            args: Some(args),
            result: None,
            error: None,
        }
    }

    /// Build a success response. `Value::Null` produces a void response.
    pub fn success(path: impl Into<String>, id: CallId, value: Value) -> Self {
        Self {
            path: path.into(),
            id,
            method: None,
            args: None,
            result: (!value.is_null()).then_some(value),
            error: None,
        }
    }

    /// Build a failure response carrying `error` unmodified.
    pub fn failure(path: impl Into<String>, id: CallId, error: Value) -> Self {
        Self {
            path: path.into(),
            id,
            method: None,
            args: None,
            result: None,
            error: Some(error),
        }
    }

    /// Parse and validate a raw text frame.
    pub fn parse(frame: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(frame)?;
        let path = raw
            .path
            .filter(|p| !p.is_empty())
            .ok_or(EnvelopeError::MissingPath)?;
        let id = raw.id.ok_or(EnvelopeError::MissingId)?;
        Ok(Self {
            path,
            id,
            method: raw.method,
            args: raw.args,
            result: raw.result,
            error: raw.error,
        })
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this envelope is a request (carries a method).
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Outcome carried by a response.
    ///
    /// `error` takes precedence if a peer populated both fields; a response
    /// with neither is a void success (`Value::Null`).
    pub fn outcome(&self) -> Result<Value, Value> {
        match (&self.error, &self.result) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(value)) => Ok(value.clone()),
            (None, None) => Ok(Value::Null),
        }
    }
}
