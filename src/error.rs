//! Transport error types and their wire marshaling.
//!
//! Errors that travel between processes are flattened into a small JSON
//! envelope (`{"type", "message", "code", "stack"}`) so that peers in any
//! language can rebuild a structured error from it. Locally raised errors
//! keep their native variants; errors revived from the wire become
//! [`RemoteError`] values that preserve the sender's type tag.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Everything that can go wrong inside the transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad caller input: malformed options, unsupported content type,
    /// a reply without `replyTo`/`correlationId`.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation is not legal in the current connection state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A handler or listener was registered with an unusable shape.
    #[error("argument error: {0}")]
    Argument(String),

    /// A lower-level connect/declare/bind/publish failure. Recoverable
    /// paths retry these with backoff.
    #[error("connection failure: {0}")]
    Connection(#[from] anyhow::Error),

    /// A reply arrived for a correlation id we cannot route back.
    #[error("no recipient for correlation id {0}")]
    NotPermitted(String),

    /// The RPC deadline elapsed before a reply arrived.
    #[error("request to `{route}` timed out after {timeout:?}")]
    Timeout {
        /// Routing key of the expired request.
        route: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The broker returned the message through the dead-letter exchange.
    #[error("message dead-lettered from `{queue}`: {reason}")]
    DeadLettered {
        /// Queue the message died in.
        queue: String,
        /// Broker-reported reason of the first death.
        reason: String,
        /// The full `x-death` trail, newest first.
        deaths: Vec<Death>,
    },

    /// Inbound payload could not be decoded. Surfaces as data, never as a
    /// crash of the consume loop.
    #[error("failed to parse message payload: {0}")]
    Parse(String),

    /// An error received from a remote peer, revived from the wire.
    #[error(transparent)]
    Remote(RemoteError),
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Error::Connection(err.into())
    }
}

impl Error {
    /// The cross-process type tag this error is marshaled under.
    #[must_use]
    pub fn wire_type(&self) -> &str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::InvalidOperation(_) => "InvalidOperationError",
            Error::Argument(_) => "ArgumentError",
            Error::Connection(_) => "ConnectionError",
            Error::NotPermitted(_) => "NotPermittedError",
            Error::Timeout { .. } => "TimeoutError",
            Error::DeadLettered { .. } => "AmqpDLXError",
            Error::Parse(_) => "ParseError",
            Error::Remote(remote) => &remote.kind,
        }
    }

    /// The bare message used in the wire envelope, without the local
    /// display prefix.
    fn wire_message(&self) -> String {
        match self {
            Error::Validation(message)
            | Error::InvalidOperation(message)
            | Error::Argument(message)
            | Error::NotPermitted(message)
            | Error::Parse(message) => message.clone(),
            Error::Remote(remote) => remote.message.clone(),
            other => other.to_string(),
        }
    }

    /// Marshals this error into the wire envelope.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut wire = json!({
            "type": self.wire_type(),
            "message": self.wire_message(),
        });
        if let Error::Remote(remote) = self {
            if let Some(code) = &remote.code {
                wire["code"] = code.clone();
            }
            if let Some(stack) = &remote.stack {
                wire["stack"] = Value::from(stack.clone());
            }
        }
        if let Error::DeadLettered { deaths, .. } = self {
            if let Ok(trail) = serde_json::to_value(deaths) {
                wire["x-death"] = trail;
            }
        }
        wire
    }

    /// Revives an error envelope received from a peer.
    ///
    /// Unknown shapes still produce a usable [`RemoteError`]; nothing about
    /// the payload can make this fail.
    #[must_use]
    pub fn from_wire(wire: &Value) -> Self {
        let kind = wire
            .get("type")
            .or_else(|| wire.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("Error")
            .to_string();
        let message = wire
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("remote call failed")
            .to_string();
        Error::Remote(RemoteError {
            kind,
            message,
            code: wire.get("code").cloned(),
            stack: wire
                .get("stack")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            reply_headers: None,
        })
    }
}

/// An error raised by a remote peer and delivered as a reply.
///
/// Carries the peer's original type tag, optional machine-readable code
/// and stack, and the reply's AMQP headers verbatim.
#[derive(Debug, Clone)]
pub struct RemoteError {
    /// The peer's error type tag, e.g. `ValidationError`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional machine-readable code.
    pub code: Option<Value>,
    /// Original stack trace, when the peer attached one.
    pub stack: Option<String>,
    /// AMQP headers of the reply that carried this error.
    pub reply_headers: Option<BTreeMap<String, Value>>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// One entry of the broker's `x-death` header trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Death {
    /// Queue the message died in.
    pub queue: String,
    /// Why the broker dead-lettered it (`expired`, `rejected`, `maxlen`).
    pub reason: String,
    /// Exchange the message was originally published to.
    #[serde(default)]
    pub exchange: String,
    /// Routing keys of the original publish.
    #[serde(default, rename = "routing-keys")]
    pub routing_keys: Vec<String>,
    /// How many times this queue/reason pair occurred.
    #[serde(default)]
    pub count: Option<u64>,
}

impl Death {
    /// Parses the `x-death` trail out of decoded message headers.
    #[must_use]
    pub fn trail(headers: &BTreeMap<String, Value>) -> Option<Vec<Death>> {
        let raw = headers.get("x-death")?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// Builds the dead-letter error for a trail, newest death first.
    #[must_use]
    pub fn into_error(deaths: Vec<Death>) -> Error {
        let (queue, reason) = deaths
            .first()
            .map(|death| (death.queue.clone(), death.reason.clone()))
            .unwrap_or_else(|| (String::new(), "unknown".to_string()));
        Error::DeadLettered {
            queue,
            reason,
            deaths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_type_and_message() {
        let original = Error::Validation("routing key is required".to_string());
        let wire = original.to_wire();
        assert_eq!(wire["type"], "ValidationError");

        let revived = Error::from_wire(&wire);
        let Error::Remote(remote) = revived else {
            panic!("expected a remote error");
        };
        assert_eq!(remote.kind, "ValidationError");
        assert!(remote.message.contains("routing key is required"));
    }

    #[test]
    fn from_wire_keeps_unknown_kinds_code_and_stack() {
        let wire = json!({
            "type": "HttpStatusError",
            "message": "upstream 503",
            "code": 503,
            "stack": "HttpStatusError: upstream 503\n  at gateway",
        });
        let Error::Remote(remote) = Error::from_wire(&wire) else {
            panic!("expected a remote error");
        };
        assert_eq!(remote.kind, "HttpStatusError");
        assert_eq!(remote.code, Some(Value::from(503)));
        assert!(remote.stack.unwrap().contains("at gateway"));
    }

    #[test]
    fn from_wire_tolerates_garbage() {
        let Error::Remote(remote) = Error::from_wire(&json!("not an object")) else {
            panic!("expected a remote error");
        };
        assert_eq!(remote.kind, "Error");
    }

    #[test]
    fn death_trail_parses_broker_headers() {
        let headers = BTreeMap::from([(
            "x-death".to_string(),
            json!([{
                "queue": "echo",
                "reason": "expired",
                "exchange": "",
                "routing-keys": ["echo"],
                "count": 1,
            }]),
        )]);
        let deaths = Death::trail(&headers).unwrap();
        assert_eq!(deaths.len(), 1);
        assert_eq!(deaths[0].queue, "echo");
        assert_eq!(deaths[0].reason, "expired");

        let Error::DeadLettered { queue, reason, .. } = Death::into_error(deaths) else {
            panic!("expected a dead-letter error");
        };
        assert_eq!(queue, "echo");
        assert_eq!(reason, "expired");
    }

    #[test]
    fn dead_letter_wire_envelope_carries_the_trail() {
        let error = Death::into_error(vec![Death {
            queue: "echo".to_string(),
            reason: "expired".to_string(),
            exchange: String::new(),
            routing_keys: vec!["echo".to_string()],
            count: Some(1),
        }]);
        let wire = error.to_wire();
        assert_eq!(wire["type"], "AmqpDLXError");
        assert_eq!(wire["x-death"][0]["queue"], "echo");
    }
}
