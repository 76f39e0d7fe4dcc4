//! JSON wire protocol for the relay.
//!
//! Every frame is a single UTF-8 JSON object carried in a WebSocket text frame.
//!
//! Inbound:
//! ```text
//! {"action": "authenticate", "payload": <token>}
//! {"action": "deliver", "secret_token": "...", "payload": <any>, "identifiers": "id" | ["id", ...]}
//! ```
//!
//! Outbound, always `{"payload": <any>, "status": <int>}`:
//! ```text
//! 400 "invalid message"          frame is not a JSON object
//! 401 "authentication failure"   token rejected / secret mismatch
//! 405 "invalid action"           unknown or missing action
//! 200 "authenticated"            token accepted
//! 201 "payload pushed"           delivery dispatched
//! 200 <payload>                  push to a subscriber
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Logical subscriber name handed out by the authenticator.
pub type Identifier = String;

/// Status codes carried in the `status` field of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 200,
    Created = 201,
    BadRequest = 400,
    Unauthorized = 401,
    MethodNotAllowed = 405,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Outbound envelope: `{"payload": ..., "status": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub payload: Value,
    pub status: u16,
}

impl Reply {
    pub fn new(payload: impl Into<Value>, status: Status) -> Self {
        Self {
            payload: payload.into(),
            status: status.code(),
        }
    }

    pub fn invalid_message() -> Self {
        Self::new("invalid message", Status::BadRequest)
    }

    pub fn authentication_failure() -> Self {
        Self::new("authentication failure", Status::Unauthorized)
    }

    pub fn invalid_action() -> Self {
        Self::new("invalid action", Status::MethodNotAllowed)
    }

    pub fn authenticated() -> Self {
        Self::new("authenticated", Status::Ok)
    }

    pub fn payload_pushed() -> Self {
        Self::new("payload pushed", Status::Created)
    }

    /// Asynchronous delivery of a publisher's payload to a subscriber.
    pub fn push(payload: Value) -> Self {
        Self {
            payload,
            status: Status::Ok.code(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

/// Target list of a `deliver` frame.
///
/// Accepts a bare string or an array; anything else normalizes to no targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifiers(Vec<Identifier>);

impl Identifiers {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(id)) => Self(vec![id.clone()]),
            Some(Value::Array(items)) => {
                let ids: Vec<Identifier> = items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect();
                if ids.len() != items.len() {
                    log::warn!(
                        "Dropped {} non-string identifiers from deliver frame",
                        items.len() - ids.len()
                    );
                }
                Self(ids)
            }
            Some(Value::Null) | None => Self::default(),
            Some(other) => {
                log::warn!("Ignoring identifiers of unexpected type: {other}");
                Self::default()
            }
        }
    }

    pub fn as_slice(&self) -> &[Identifier] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Identifier> {
        self.0
    }
}

impl<S: Into<Identifier>> FromIterator<S> for Identifiers {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Body of a `deliver` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverRequest {
    /// `None` when the field is absent or not a string; never matches a secret.
    pub secret_token: Option<String>,
    pub payload: Value,
    pub identifiers: Identifiers,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Authenticate { token: Value },
    Deliver(DeliverRequest),
    /// Missing, non-string or unrecognized `action`.
    Unknown(Option<String>),
}

impl Frame {
    /// Decode a text frame. Anything that is not a JSON object is an error.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        match value {
            Value::Object(obj) => Ok(Self::from_object(obj)),
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    /// Decode a binary frame; its bytes must be UTF-8 JSON like a text frame.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Self::decode(text)
    }

    fn from_object(mut obj: Map<String, Value>) -> Self {
        let action = obj.get("action").and_then(Value::as_str).map(str::to_owned);
        match action.as_deref() {
            Some("authenticate") => {
                let token = obj
                    .remove("payload")
                    .or_else(|| obj.remove("token"))
                    .unwrap_or(Value::Null);
                Self::Authenticate { token }
            }
            Some("deliver") => Self::Deliver(DeliverRequest {
                secret_token: obj
                    .get("secret_token")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                identifiers: Identifiers::from_value(obj.get("identifiers")),
                payload: obj.remove("payload").unwrap_or(Value::Null),
            }),
            _ => Self::Unknown(action),
        }
    }

    /// Build an `authenticate` frame as sent by a subscriber.
    pub fn authenticate(token: impl Into<Value>) -> Value {
        json!({ "action": "authenticate", "payload": token.into() })
    }

    /// Build a `deliver` frame as sent by a publisher.
    pub fn deliver(secret_token: &str, payload: Value, identifiers: &[Identifier]) -> Value {
        json!({
            "action": "deliver",
            "secret_token": secret_token,
            "payload": payload,
            "identifiers": identifiers,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_authenticate() {
        let frame = Frame::decode(r#"{"action":"authenticate","payload":"tok1"}"#).unwrap();
        assert_eq!(frame, Frame::Authenticate { token: json!("tok1") });
    }

    #[test]
    fn test_decode_authenticate_token_fallback() {
        let frame = Frame::decode(r#"{"action":"authenticate","token":{"jwt":"x"}}"#).unwrap();
        assert_eq!(frame, Frame::Authenticate { token: json!({"jwt": "x"}) });
    }

    #[test]
    fn test_decode_authenticate_without_token() {
        let frame = Frame::decode(r#"{"action":"authenticate"}"#).unwrap();
        assert_eq!(frame, Frame::Authenticate { token: Value::Null });
    }

    #[test]
    fn test_decode_deliver_single_identifier() {
        let frame = Frame::decode(
            r#"{"action":"deliver","secret_token":"S","payload":{"msg":"hi"},"identifiers":"user-42"}"#,
        )
        .unwrap();
        match frame {
            Frame::Deliver(req) => {
                assert_eq!(req.secret_token.as_deref(), Some("S"));
                assert_eq!(req.payload, json!({"msg": "hi"}));
                assert_eq!(req.identifiers.as_slice(), ["user-42".to_string()]);
            }
            other => panic!("Expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_deliver_identifier_list() {
        let frame = Frame::decode(
            r#"{"action":"deliver","secret_token":"S","payload":1,"identifiers":["a","b",7,"c"]}"#,
        )
        .unwrap();
        let Frame::Deliver(req) = frame else {
            panic!("Expected Deliver");
        };
        assert_eq!(req.identifiers.into_vec(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_decode_deliver_missing_fields() {
        let frame = Frame::decode(r#"{"action":"deliver"}"#).unwrap();
        let Frame::Deliver(req) = frame else {
            panic!("Expected Deliver");
        };
        assert!(req.secret_token.is_none());
        assert!(req.identifiers.is_empty());
        assert_eq!(req.payload, Value::Null);
    }

    #[test]
    fn test_non_string_secret_is_absent() {
        let frame = Frame::decode(r#"{"action":"deliver","secret_token":12}"#).unwrap();
        let Frame::Deliver(req) = frame else {
            panic!("Expected Deliver");
        };
        assert!(req.secret_token.is_none());
    }

    #[test]
    fn test_decode_unknown_and_missing_action() {
        assert_eq!(
            Frame::decode(r#"{"action":"unknown"}"#).unwrap(),
            Frame::Unknown(Some("unknown".into()))
        );
        assert_eq!(Frame::decode(r#"{"payload":1}"#).unwrap(), Frame::Unknown(None));
        assert_eq!(Frame::decode(r#"{"action":5}"#).unwrap(), Frame::Unknown(None));
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_decode_non_object() {
        assert_eq!(Frame::decode("[1,2,3]"), Err(ProtocolError::NotAnObject));
        assert_eq!(Frame::decode("\"deliver\""), Err(ProtocolError::NotAnObject));
    }

    #[test]
    fn test_decode_bytes_rejects_non_utf8() {
        assert!(Frame::decode_bytes(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Frame::decode_bytes(br#"{"action":"authenticate","payload":"t"}"#).is_ok());
    }

    #[test]
    fn test_reply_wire_shape() {
        let encoded = Reply::payload_pushed().encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({"payload": "payload pushed", "status": 201}));
    }

    #[test]
    fn test_reply_status_codes() {
        assert_eq!(Reply::invalid_message().status, 400);
        assert_eq!(Reply::authentication_failure().status, 401);
        assert_eq!(Reply::invalid_action().status, 405);
        assert_eq!(Reply::authenticated().status, 200);
        assert_eq!(Reply::push(json!({"msg": "hi"})).status, 200);
    }

    #[test]
    fn test_deliver_builder_decodes() {
        let ids = vec!["user-1".to_string(), "user-2".to_string()];
        let built = Frame::deliver("S", json!("hello"), &ids);
        let frame = Frame::decode(&built.to_string()).unwrap();
        let Frame::Deliver(req) = frame else {
            panic!("Expected Deliver");
        };
        assert_eq!(req.identifiers.into_vec(), ids);
    }
}
