//! JSON-RPC message model and its wire representation
//!
//! A frame is one JSON object. Outbound frames always carry `"jsonrpc":"2.0"`;
//! inbound frames may omit it. Field presence is tracked separately from field
//! value, so `"params": null` survives a decode/encode cycle.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::errors::{ErrorCode, HandlerError};

pub const JSONRPC_VERSION: &str = "2.0";

/// Variants are ordered so that derived `Ord` sorts numeric ids by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    /// Only ids above `i64::MAX` land here.
    Unsigned(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Unsigned(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "\"{value}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Unsigned(value), Self::Integer)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i64,
    pub message: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub data: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The taxonomy entry for `code`, if it is one this crate knows.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl From<HandlerError> for ErrorInfo {
    fn from(err: HandlerError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(ErrorInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(id: RequestId, error: ErrorInfo) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(error) => Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(request) => Some(&request.id),
            Self::Response(response) => Some(&response.id),
            Self::Notification(_) => None,
        }
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        if !value.is_object() {
            return Err(MessageError::NotAnObject);
        }
        let frame: InboundFrame = serde_json::from_value(value)
            .map_err(|err| MessageError::InvalidField(err.to_string()))?;
        Self::try_from(frame)
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("unsupported jsonrpc version `{0}`")]
    UnsupportedVersion(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("id must be a string or an integer")]
    InvalidId,
    #[error("method must not be empty")]
    EmptyMethod,
    #[error("`method` cannot be combined with `result` or `error`")]
    MixedShape,
    #[error("response must carry exactly one of `result` or `error`")]
    AmbiguousResponse,
    #[error("no recognizable field set")]
    Unrecognized,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorInfo>,
}

fn parse_id(value: Value) -> Result<RequestId, MessageError> {
    serde_json::from_value(value).map_err(|_| MessageError::InvalidId)
}

impl TryFrom<InboundFrame> for Message {
    type Error = MessageError;

    fn try_from(frame: InboundFrame) -> Result<Self, Self::Error> {
        if let Some(version) = frame.jsonrpc {
            if version != JSONRPC_VERSION {
                return Err(MessageError::UnsupportedVersion(version));
            }
        }

        if let Some(method) = frame.method {
            if frame.result.is_some() || frame.error.is_some() {
                return Err(MessageError::MixedShape);
            }
            if method.trim().is_empty() {
                return Err(MessageError::EmptyMethod);
            }
            return Ok(match frame.id {
                Some(id) => Self::Request(Request {
                    id: parse_id(id)?,
                    method,
                    params: frame.params,
                }),
                None => Self::Notification(Notification {
                    method,
                    params: frame.params,
                }),
            });
        }

        let Some(id) = frame.id else {
            return Err(MessageError::Unrecognized);
        };
        let outcome = match (frame.result, frame.error) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => Outcome::Error(
                serde_json::from_value(error)
                    .map_err(|err| MessageError::InvalidField(format!("error: {err}")))?,
            ),
            (Some(_), Some(_)) => return Err(MessageError::AmbiguousResponse),
            (None, None) => return Err(MessageError::Unrecognized),
        };

        Ok(Self::Response(Response {
            id: parse_id(id)?,
            outcome,
        }))
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut frame = OutboundFrame {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match self {
            Self::Request(request) => {
                frame.id = Some(&request.id);
                frame.method = Some(&request.method);
                frame.params = request.params.as_ref();
            }
            Self::Notification(notification) => {
                frame.method = Some(&notification.method);
                frame.params = notification.params.as_ref();
            }
            Self::Response(response) => {
                frame.id = Some(&response.id);
                match &response.outcome {
                    Outcome::Result(result) => frame.result = Some(result),
                    Outcome::Error(error) => frame.error = Some(error),
                }
            }
        }
        frame.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode(value: Value) -> Result<Message, MessageError> {
        Message::from_value(value)
    }

    fn round_trip(message: &Message) -> Message {
        let bytes = serde_json::to_vec(message).expect("message serialization");
        serde_json::from_slice(&bytes).expect("message deserialization")
    }

    #[test]
    fn classifies_request_notification_and_response() {
        let request = decode(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}}))
            .expect("request");
        assert_eq!(
            request,
            Message::Request(Request::new(RequestId::Integer(1), "tools/call", Some(json!({}))))
        );

        let notification = decode(json!({"method": "tools/call"})).expect("notification");
        assert_eq!(
            notification,
            Message::Notification(Notification::new("tools/call", None))
        );

        let response = decode(json!({"id": "abc", "result": {"ok": true}})).expect("response");
        assert_eq!(
            response,
            Message::Response(Response::success("abc".into(), json!({"ok": true})))
        );
    }

    #[test]
    fn missing_jsonrpc_field_is_tolerated() {
        let message = decode(json!({"id": 2, "method": "unknown/thing"})).expect("request");
        assert_eq!(message.method(), Some("unknown/thing"));
        assert_eq!(message.id(), Some(&RequestId::Integer(2)));
    }

    #[test]
    fn null_params_and_null_result_survive_round_trip() {
        let request = Message::Request(Request::new("a", "echo", Some(Value::Null)));
        assert_eq!(round_trip(&request), request);

        let response = Message::Response(Response::success(RequestId::Integer(7), Value::Null));
        assert_eq!(round_trip(&response), response);
    }

    #[test]
    fn integer_ids_above_i64_range_are_accepted() {
        let message = decode(json!({"id": u64::MAX, "method": "ping"})).expect("request");
        assert_eq!(message.id(), Some(&RequestId::Unsigned(u64::MAX)));
        assert_eq!(round_trip(&message), message);

        let encoded = serde_json::to_string(&message).expect("serialization");
        assert!(encoded.contains("\"id\":18446744073709551615"));
    }

    #[test]
    fn unsigned_conversion_prefers_the_signed_variant() {
        assert_eq!(RequestId::from(5_u64), RequestId::Integer(5));
        assert_eq!(RequestId::from(u64::MAX), RequestId::Unsigned(u64::MAX));
    }

    #[test]
    fn numeric_ids_order_by_value() {
        let mut ids = vec![
            RequestId::Unsigned(u64::MAX),
            RequestId::Integer(10),
            RequestId::from("a"),
            RequestId::Integer(2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                RequestId::Integer(2),
                RequestId::Integer(10),
                RequestId::Unsigned(u64::MAX),
                RequestId::from("a"),
            ]
        );
    }

    #[test]
    fn error_response_round_trips_with_data() {
        let message = Message::Response(Response::failure(
            RequestId::from("req-9"),
            ErrorInfo::from_code(ErrorCode::MethodNotFound).with_data(json!({"method": "x"})),
        ));
        let decoded = round_trip(&message);
        assert_eq!(decoded, message);
        let Message::Response(response) = decoded else {
            panic!("expected response");
        };
        assert_eq!(
            response.error().and_then(ErrorInfo::kind),
            Some(ErrorCode::MethodNotFound)
        );
    }

    #[test]
    fn encode_always_writes_jsonrpc_and_omits_absent_fields() {
        let message = Message::Notification(Notification::new("ping", None));
        let value = serde_json::to_value(&message).expect("serialization");
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "ping"}));
    }

    #[test]
    fn rejects_frames_without_a_recognizable_shape() {
        assert_eq!(decode(json!([1, 2])), Err(MessageError::NotAnObject));
        assert_eq!(decode(json!({"foo": "bar"})), Err(MessageError::Unrecognized));
        assert_eq!(decode(json!({"id": 3})), Err(MessageError::Unrecognized));
        assert_eq!(
            decode(json!({"id": 3, "result": 1, "error": {"code": 1, "message": "x"}})),
            Err(MessageError::AmbiguousResponse)
        );
        assert_eq!(
            decode(json!({"id": 3, "method": "a", "result": 1})),
            Err(MessageError::MixedShape)
        );
    }

    #[test]
    fn rejects_invalid_ids_versions_and_methods() {
        assert_eq!(
            decode(json!({"id": 1.5, "method": "a"})),
            Err(MessageError::InvalidId)
        );
        assert_eq!(
            decode(json!({"id": null, "method": "a"})),
            Err(MessageError::InvalidId)
        );
        assert_eq!(
            decode(json!({"jsonrpc": "1.0", "id": 1, "method": "a"})),
            Err(MessageError::UnsupportedVersion("1.0".to_string()))
        );
        assert_eq!(
            decode(json!({"id": 1, "method": "  "})),
            Err(MessageError::EmptyMethod)
        );
        assert!(matches!(
            decode(json!({"id": 1, "method": 5})),
            Err(MessageError::InvalidField(_))
        ));
    }

    #[test]
    fn peer_parse_errors_are_classified() {
        let message = decode(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .expect("error response");
        let Message::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(
            response.error().and_then(ErrorInfo::kind),
            Some(ErrorCode::ParseError)
        );

        let invalid = ErrorInfo {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: None,
        };
        assert_eq!(invalid.kind(), Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn handler_errors_become_error_info() {
        let info = ErrorInfo::from(HandlerError::invalid_params("name is required"));
        assert_eq!(info.kind(), Some(ErrorCode::InvalidParams));
        assert!(info.message.contains("name is required"));
    }
}
