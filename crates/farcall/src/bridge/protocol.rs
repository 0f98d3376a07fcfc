//! Wire protocol types for host-worker communication.
//!
//! One channel, two directions:
//! - **Host → worker**: [`Request`] (read, write, has, call, construct, destroy)
//! - **Worker → host**: [`Response`] (result, exposed, error) and the unsolicited
//!   bootstrap announcement, which is a [`Response`] without an invocation id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;
use crate::error::RemoteError;

/// Index of an exposed entity in the worker's slot table.
///
/// Assigned in increasing order and never reused, so a stale id can always be
/// told apart from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(u64);

impl SlotId {
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Position in the slot table, or `None` if it does not fit this platform's `usize`.
    pub(crate) fn index(&self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a request with its response. Strictly increasing per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(u64);

impl InvocationId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const SYMBOL_PREFIX: &str = "@sym:";

/// A member name, either a plain string or a symbol-like key.
///
/// Path segments travel as strings. Symbols are encoded as `@sym:<description>`;
/// a plain name that starts with `@` gets one extra `@` so the encoding stays
/// reversible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PropertyKey {
    Name(String),
    Symbol(String),
}

impl PropertyKey {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn symbol(description: impl Into<String>) -> Self {
        Self::Symbol(description.into())
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, Self::Symbol(_))
    }

    /// The plain name, or `None` for symbols.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Symbol(_) => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Name(name) if name.starts_with('@') => format!("@{name}"),
            Self::Name(name) => name.clone(),
            Self::Symbol(description) => format!("{SYMBOL_PREFIX}{description}"),
        }
    }

    pub fn decode(text: &str) -> Self {
        if let Some(escaped) = text.strip_prefix("@@") {
            Self::Name(format!("@{escaped}"))
        } else if let Some(description) = text.strip_prefix(SYMBOL_PREFIX) {
            Self::Symbol(description.to_string())
        } else {
            Self::Name(text.to_string())
        }
    }
}

/// Decodes the wire form. `From<&str>` always builds a plain name.
impl From<String> for PropertyKey {
    fn from(text: String) -> Self {
        Self::decode(&text)
    }
}

impl From<PropertyKey> for String {
    fn from(key: PropertyKey) -> Self {
        key.encode()
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Symbol(description) => write!(f, "Symbol({description})"),
        }
    }
}

/// Operation requested against a slot and member path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Has,
    Call,
    Construct,
    Destroy,
    /// Any action name this build does not know. Answered with a protocol error.
    #[serde(other)]
    Unrecognized,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Has => "has",
            Self::Call => "call",
            Self::Construct => "construct",
            Self::Destroy => "destroy",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub invocation_id: InvocationId,
    #[serde(default)]
    pub path: Vec<PropertyKey>,
    pub action: Action,
    pub slot: SlotId,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Message from worker to host.
///
/// The bootstrap announcement is the only response without an invocation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<InvocationId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Exactly one of `result`, `exposed` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseBody {
    /// Plain data.
    Result(serde_json::Value),
    /// Entities that were registered in fresh slots.
    Exposed(Vec<Descriptor>),
    /// A failure marshaled across the boundary.
    Error(RemoteError),
}

impl Response {
    pub fn announcement(roots: Vec<Descriptor>) -> Self {
        Self {
            invocation_id: None,
            body: ResponseBody::Exposed(roots),
        }
    }

    pub fn result(id: InvocationId, value: serde_json::Value) -> Self {
        Self {
            invocation_id: Some(id),
            body: ResponseBody::Result(value),
        }
    }

    pub fn exposed(id: InvocationId, descriptors: Vec<Descriptor>) -> Self {
        Self {
            invocation_id: Some(id),
            body: ResponseBody::Exposed(descriptors),
        }
    }

    pub fn error(id: InvocationId, error: RemoteError) -> Self {
        Self {
            invocation_id: Some(id),
            body: ResponseBody::Error(error),
        }
    }

    pub fn is_announcement(&self) -> bool {
        self.invocation_id.is_none()
    }

    /// Decode an inbound envelope.
    ///
    /// Stricter than plain deserialization: exactly one of `result`, `exposed`
    /// or `error` must be present. On failure the invocation id is recovered
    /// when the frame carries one.
    pub fn from_json(raw: serde_json::Value) -> Result<Self, MalformedResponse> {
        let invocation_id = raw
            .get("invocationId")
            .and_then(serde_json::Value::as_u64)
            .map(InvocationId::new);
        let malformed = |reason: String| MalformedResponse {
            invocation_id,
            reason,
        };

        let bodies = BODY_FIELDS
            .iter()
            .filter(|field| raw.get(**field).is_some())
            .count();
        if bodies != 1 {
            return Err(malformed(format!(
                "expected exactly one of result, exposed or error, found {bodies}"
            )));
        }

        serde_json::from_value(raw).map_err(|e| malformed(e.to_string()))
    }
}

const BODY_FIELDS: [&str; 3] = ["result", "exposed", "error"];

/// A response frame that is valid JSON but not a valid envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed response: {reason}")]
pub struct MalformedResponse {
    pub invocation_id: Option<InvocationId>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EntityKind, MemberDescriptor, MemberKind};
    use crate::error::ErrorKind;
    use serde_json::json;

    fn sample_descriptor() -> Descriptor {
        Descriptor {
            slot: SlotId::new(0),
            name: "calculator".to_string(),
            kind: EntityKind::Object,
            members: vec![
                MemberDescriptor {
                    name: PropertyKey::name("a"),
                    kind: MemberKind::Number,
                },
                MemberDescriptor {
                    name: PropertyKey::name("b"),
                    kind: MemberKind::PlainFunction,
                },
            ],
        }
    }

    #[test]
    fn request_serializes() {
        let req = Request {
            invocation_id: InvocationId::new(7),
            path: vec![PropertyKey::name("b")],
            action: Action::Call,
            slot: SlotId::new(0),
            args: vec![json!(21)],
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "invocationId": 7,
          "path": [
            "b"
          ],
          "action": "call",
          "slot": 0,
          "args": [
            21
          ]
        }
        "#);
    }

    #[test]
    fn announcement_serializes_without_invocation_id() {
        let resp = Response::announcement(vec![sample_descriptor()]);
        insta::assert_json_snapshot!(resp, @r#"
        {
          "exposed": [
            {
              "slot": 0,
              "name": "calculator",
              "kind": "object",
              "members": [
                {
                  "name": "a",
                  "kind": "number"
                },
                {
                  "name": "b",
                  "kind": "plainFunction"
                }
              ]
            }
          ]
        }
        "#);
    }

    #[test]
    fn result_response_serializes() {
        let resp = Response::result(InvocationId::new(3), json!(42));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "invocationId": 3,
          "result": 42
        }
        "#);
    }

    #[test]
    fn error_response_serializes() {
        let resp = Response::error(
            InvocationId::new(4),
            RemoteError::new(ErrorKind::RangeError, "bad index"),
        );
        insta::assert_json_snapshot!(resp, @r#"
        {
          "invocationId": 4,
          "error": {
            "kind": "RangeError",
            "message": "bad index"
          }
        }
        "#);
    }

    #[test]
    fn null_result_survives_decoding() {
        let resp: Response = serde_json::from_value(json!({
            "invocationId": 9,
            "result": null
        }))
        .unwrap();
        assert_eq!(resp.invocation_id, Some(InvocationId::new(9)));
        assert!(matches!(resp.body, ResponseBody::Result(serde_json::Value::Null)));
    }

    #[test]
    fn response_without_body_is_rejected() {
        let parsed = serde_json::from_value::<Response>(json!({ "invocationId": 1 }));
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_action_decodes_as_unrecognized() {
        let req: Request = serde_json::from_value(json!({
            "invocationId": 1,
            "path": [],
            "action": "teleport",
            "slot": 0,
            "args": []
        }))
        .unwrap();
        assert_eq!(req.action, Action::Unrecognized);
    }

    #[test]
    fn request_defaults_missing_path_and_args() {
        let req: Request = serde_json::from_value(json!({
            "invocationId": 2,
            "action": "destroy",
            "slot": 5
        }))
        .unwrap();
        assert!(req.path.is_empty());
        assert!(req.args.is_empty());
        assert_eq!(req.slot, SlotId::new(5));
    }

    #[test]
    fn envelope_with_two_bodies_is_malformed() {
        let err = Response::from_json(json!({
            "invocationId": 4,
            "result": 1,
            "error": {"kind": "Error", "message": "both"}
        }))
        .unwrap_err();
        assert_eq!(err.invocation_id, Some(InvocationId::new(4)));
        assert!(err.reason.contains("found 2"), "{}", err.reason);
    }

    #[test]
    fn envelope_without_body_keeps_its_id() {
        let err = Response::from_json(json!({"invocationId": 1, "bogus": true})).unwrap_err();
        assert_eq!(err.invocation_id, Some(InvocationId::new(1)));

        let anonymous = Response::from_json(json!({"exposed": "nope"})).unwrap_err();
        assert_eq!(anonymous.invocation_id, None);
    }

    #[test]
    fn strict_decoding_accepts_well_formed_envelopes() {
        let null = Response::from_json(json!({"invocationId": 2, "result": null})).unwrap();
        assert!(matches!(null.body, ResponseBody::Result(serde_json::Value::Null)));

        let announcement = Response::from_json(json!({"exposed": []})).unwrap();
        assert!(announcement.is_announcement());
    }

    #[test]
    fn slot_index_is_checked() {
        assert_eq!(SlotId::new(7).index(), Some(7));
        if usize::BITS < 64 {
            assert_eq!(SlotId::new(u64::MAX).index(), None);
        }
    }

    #[test]
    fn symbol_keys_encode_reversibly() {
        let keys = [
            PropertyKey::symbol("iterator"),
            PropertyKey::name("plain"),
            PropertyKey::name("@handle"),
            PropertyKey::name("@sym:lookalike"),
            PropertyKey::name("@@double"),
        ];
        for key in keys {
            let text = key.encode();
            assert_eq!(PropertyKey::decode(&text), key, "encoded as {text}");
        }
        assert_eq!(PropertyKey::symbol("iterator").encode(), "@sym:iterator");
        assert_eq!(PropertyKey::name("@handle").encode(), "@@handle");
    }

    #[test]
    fn property_key_display() {
        assert_eq!(PropertyKey::symbol("dispose").to_string(), "Symbol(dispose)");
        assert_eq!(PropertyKey::name("x").to_string(), "x");
    }
}
