//! Outcomes of an issued call that did not produce a return value.

use serde_json::Value;

/// Why a call issued on a connection failed.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CallError {
    /// No response arrived within the configured window.
    #[error("TIMEOUT")]
    Timeout,

    /// The peer answered with an `error` field; the value is carried unmodified.
    #[error("remote error: {0}")]
    Remote(Value),

    /// The connection was torn down before the call settled.
    #[error("connection closed")]
    Closed,

    /// The call belonged to a server generation that was replaced by a reload.
    #[error("call abandoned by server reload")]
    Abandoned,

    /// The request could not be encoded for the wire.
    #[error("failed to encode call: {0}")]
    Encode(String),
}

impl CallError {
    /// Whether this is the timeout sentinel.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// The remote error payload, if the peer rejected the call.
    pub fn remote_value(&self) -> Option<&Value> {
        match self {
            Self::Remote(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_displays_sentinel() {
        assert_eq!(CallError::Timeout.to_string(), "TIMEOUT");
        assert!(CallError::Timeout.is_timeout());
        assert!(!CallError::Closed.is_timeout());
    }

    #[test]
    fn remote_keeps_raw_value() {
        let err = CallError::Remote(json!({"code": 7, "reason": "nope"}));
        assert_eq!(err.remote_value().unwrap()["code"], 7);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn non_remote_has_no_value() {
        assert!(CallError::Abandoned.remote_value().is_none());
        assert_eq!(CallError::Closed.to_string(), "connection closed");
    }
}
