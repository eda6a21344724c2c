//! Wire protocol for the relay bus
//!
//! Every frame is one JSON object terminated by `\n`. Clients send
//! [`ClientMessage`]s; the relay answers with [`Reply`] frames and delivers
//! [`RelayedMessage`] envelopes carrying another connection's [`Signal`].
//!
//! Incoming client frames are never deserialized straight into typed
//! structs. They are parsed to a [`serde_json::Value`] by the
//! [`FrameDecoder`] and then checked field by field with
//! [`ClientMessage::from_value`], so every rejection can name the exact
//! violation back to the sender.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Position of a connection in the swarm hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Root supervisor, one per run
    Queen,
    /// Worker that also manages sub-workers
    Coordinator,
    /// Leaf worker
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Queen => "queen",
            Role::Coordinator => "coordinator",
            Role::Agent => "agent",
        }
    }

    /// Whether a `register` frame for this role must carry a swarm label
    pub fn requires_swarm(&self) -> bool {
        !matches!(self, Role::Queen)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queen" => Ok(Role::Queen),
            "coordinator" => Ok(Role::Coordinator),
            "agent" => Ok(Role::Agent),
            other => Err(ValidationError::new(format!(
                "role must be one of queen, coordinator, agent (got '{other}')"
            ))),
        }
    }
}

/// A structural violation found while validating a client frame
///
/// The message is sent back verbatim in the `error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Identity a connection claims with its first frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "register")]
pub struct Registration {
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swarm: Option<String>,
}

impl Registration {
    pub fn new(name: impl Into<String>, role: Role, swarm: Option<String>) -> Self {
        Self {
            name: name.into(),
            role,
            swarm,
        }
    }

    pub fn queen(name: impl Into<String>) -> Self {
        Self::new(name, Role::Queen, None)
    }

    pub fn coordinator(name: impl Into<String>, swarm: impl Into<String>) -> Self {
        Self::new(name, Role::Coordinator, Some(swarm.into()))
    }

    pub fn agent(name: impl Into<String>, swarm: impl Into<String>) -> Self {
        Self::new(name, Role::Agent, Some(swarm.into()))
    }

    /// Check the conditional swarm requirement
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::new("register: field 'name' must not be empty"));
        }
        if self.role.requires_swarm() && self.swarm.is_none() {
            return Err(ValidationError::new(format!(
                "register: field 'swarm' is required for role '{}'",
                self.role
            )));
        }
        Ok(())
    }
}

/// The four message kinds that travel between connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    /// Low-urgency heads-up
    Nudge { reason: String },
    /// Sender is stuck
    Blocker { description: String },
    /// Sender finished its work
    Done { summary: String },
    /// Directive for one connection, one swarm, or everyone local
    Instruct {
        instruction: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        swarm: Option<String>,
    },
}

impl Signal {
    pub fn nudge(reason: impl Into<String>) -> Self {
        Signal::Nudge {
            reason: reason.into(),
        }
    }

    pub fn blocker(description: impl Into<String>) -> Self {
        Signal::Blocker {
            description: description.into(),
        }
    }

    pub fn done(summary: impl Into<String>) -> Self {
        Signal::Done {
            summary: summary.into(),
        }
    }

    pub fn instruct(instruction: impl Into<String>) -> Self {
        Signal::Instruct {
            instruction: instruction.into(),
            to: None,
            swarm: None,
        }
    }

    pub fn instruct_to(instruction: impl Into<String>, to: impl Into<String>) -> Self {
        Signal::Instruct {
            instruction: instruction.into(),
            to: Some(to.into()),
            swarm: None,
        }
    }

    pub fn instruct_swarm(instruction: impl Into<String>, swarm: impl Into<String>) -> Self {
        Signal::Instruct {
            instruction: instruction.into(),
            to: None,
            swarm: Some(swarm.into()),
        }
    }

    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Nudge { .. } => "nudge",
            Signal::Blocker { .. } => "blocker",
            Signal::Done { .. } => "done",
            Signal::Instruct { .. } => "instruct",
        }
    }

    /// Human-readable body of the message
    pub fn text(&self) -> &str {
        match self {
            Signal::Nudge { reason } => reason,
            Signal::Blocker { description } => description,
            Signal::Done { summary } => summary,
            Signal::Instruct { instruction, .. } => instruction,
        }
    }
}

/// Any frame a client may send to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Register(Registration),
    Signal(Signal),
}

impl ClientMessage {
    /// Validate a parsed frame and convert it into a typed message
    ///
    /// Every field must be present with the declared primitive type.
    /// Optional fields may be absent but never of another type.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::new("frame must be a JSON object"))?;

        match frame_type(obj)? {
            "register" => validate_register(obj).map(ClientMessage::Register),
            "nudge" => Ok(ClientMessage::Signal(Signal::Nudge {
                reason: required_str(obj, "nudge", "reason")?,
            })),
            "blocker" => Ok(ClientMessage::Signal(Signal::Blocker {
                description: required_str(obj, "blocker", "description")?,
            })),
            "done" => Ok(ClientMessage::Signal(Signal::Done {
                summary: required_str(obj, "done", "summary")?,
            })),
            "instruct" => Ok(ClientMessage::Signal(Signal::Instruct {
                instruction: required_str(obj, "instruct", "instruction")?,
                to: optional_str(obj, "instruct", "to")?,
                swarm: optional_str(obj, "instruct", "swarm")?,
            })),
            other => Err(ValidationError::new(format!(
                "unknown message type '{other}'"
            ))),
        }
    }
}

/// The `type` field of a frame, if it has a string one
pub fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

fn frame_type(obj: &Map<String, Value>) -> Result<&str, ValidationError> {
    match obj.get("type") {
        Some(Value::String(kind)) => Ok(kind),
        Some(_) => Err(ValidationError::new("field 'type' must be a string")),
        None => Err(ValidationError::new("missing field 'type'")),
    }
}

fn validate_register(obj: &Map<String, Value>) -> Result<Registration, ValidationError> {
    let name = required_str(obj, "register", "name")?;
    let role: Role = required_str(obj, "register", "role")?.parse()?;
    let swarm = optional_str(obj, "register", "swarm")?;

    let registration = Registration { name, role, swarm };
    registration.check()?;
    Ok(registration)
}

fn required_str(
    obj: &Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<String, ValidationError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::new(format!(
            "{kind}: field '{field}' must be a string"
        ))),
        None => Err(ValidationError::new(format!(
            "{kind}: missing field '{field}'"
        ))),
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::new(format!(
            "{kind}: field '{field}' must be a string"
        ))),
        None => Ok(None),
    }
}

/// Envelope the relay delivers to recipients
///
/// Only the relay builds these; clients just read them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedMessage {
    pub from: String,
    pub from_role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_swarm: Option<String>,
    pub message: Signal,
}

impl RelayedMessage {
    pub(crate) fn new(sender: &Registration, message: Signal) -> Self {
        Self {
            from: sender.name.clone(),
            from_role: sender.role,
            from_swarm: sender.swarm.clone(),
            message,
        }
    }
}

/// Control replies from the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    /// Registration accepted
    Registered,
    /// Something the client sent was rejected
    Error { message: String },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }
}

/// Any frame the relay may send to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Relayed(RelayedMessage),
    Reply(Reply),
}

/// Serialize a message as a single `\n`-terminated line
///
/// `serde_json` escapes control characters inside strings, so the output
/// never contains a newline before the terminator.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// One complete line that parsed as JSON
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The line exactly as received, without its terminator
    pub line: String,
    pub value: Value,
}

/// Splits an arbitrary byte stream into JSON frames
///
/// Handles several frames per chunk and frames split across chunks. The
/// trailing partial segment is kept until its newline arrives. Segments
/// that are not valid JSON are dropped so one corrupt frame never blocks
/// the ones behind it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and take every complete frame out of the buffer
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(frame) = parse_segment(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        frames
    }

    /// Bytes received after the last newline
    pub fn remainder(&self) -> &[u8] {
        &self.buffer
    }
}

fn parse_segment(segment: &[u8]) -> Option<Frame> {
    let line = match std::str::from_utf8(segment) {
        Ok(line) => line.strip_suffix('\r').unwrap_or(line),
        Err(e) => {
            debug!(error = %e, "Skipping frame with invalid UTF-8");
            return None;
        }
    };

    match serde_json::from_str::<Value>(line) {
        Ok(value) => Some(Frame {
            line: line.to_string(),
            value,
        }),
        Err(e) => {
            if !line.trim().is_empty() {
                debug!(error = %e, "Skipping unparseable frame");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(value: Value) -> Result<ClientMessage, ValidationError> {
        ClientMessage::from_value(&value)
    }

    // === Framing Tests ===

    #[test]
    fn test_frame_split_across_reads() {
        let mut decoder = FrameDecoder::new();

        let first = decoder.push(b"{");
        assert!(first.is_empty());
        assert_eq!(decoder.remainder(), b"{");

        let second = decoder.push(b"\"type\":\"nudge\",\"reason\":\"x\"}\n");
        assert_eq!(second.len(), 1);
        assert!(decoder.remainder().is_empty());

        let message = validate(second[0].value.clone()).unwrap();
        assert_eq!(message, ClientMessage::Signal(Signal::nudge("x")));
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(
            b"{\"type\":\"nudge\",\"reason\":\"a\"}\n{\"type\":\"done\",\"summary\":\"b\"}\n{\"type\":",
        );

        assert_eq!(frames.len(), 2);
        assert_eq!(message_type(&frames[0].value), Some("nudge"));
        assert_eq!(message_type(&frames[1].value), Some("done"));
        assert_eq!(decoder.remainder(), b"{\"type\":");
    }

    #[test]
    fn test_bad_frame_does_not_block_good_ones() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"not json\n\n{\"type\":\"blocker\",\"description\":\"stuck\"}\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(message_type(&frames[0].value), Some("blocker"));
    }

    #[test]
    fn test_frame_keeps_original_line() {
        let mut decoder = FrameDecoder::new();
        let raw = "{ \"type\": \"instruct\", \"instruction\": \"go\", \"to\": \"X\" }";
        let frames = decoder.push(format!("{raw}\r\n").as_bytes());

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].line, raw);
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let mut decoder = FrameDecoder::new();
        let line = "{\"type\":\"nudge\",\"reason\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(decoder.push(&line[..split]).is_empty());
        let frames = decoder.push(&line[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].value["reason"], "héllo");
    }

    #[test]
    fn test_encoded_frame_has_single_newline() {
        let line = encode_frame(&Signal::nudge("line one\nline two")).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    // === Round Trip Tests ===

    #[test]
    fn test_client_messages_round_trip() {
        let messages = vec![
            ClientMessage::Register(Registration::queen("queen")),
            ClientMessage::Register(Registration::agent("worker-1", "alpha")),
            ClientMessage::Signal(Signal::blocker("tests fail on main")),
            ClientMessage::Signal(Signal::instruct_to("rebase", "worker-2")),
            ClientMessage::Signal(Signal::instruct_swarm("pause", "beta")),
        ];

        for message in messages {
            let line = encode_frame(&message).unwrap();
            let mut decoder = FrameDecoder::new();
            let frames = decoder.push(line.as_bytes());
            assert_eq!(frames.len(), 1);
            assert_eq!(validate(frames[0].value.clone()).unwrap(), message);
        }
    }

    #[test]
    fn test_relayed_message_wire_shape() {
        let sender = Registration::agent("worker-1", "alpha");
        let relayed = RelayedMessage::new(&sender, Signal::done("all green"));

        let value = serde_json::to_value(&relayed).unwrap();
        assert_eq!(
            value,
            json!({
                "from": "worker-1",
                "fromRole": "agent",
                "fromSwarm": "alpha",
                "message": { "type": "done", "summary": "all green" }
            })
        );

        let parsed: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, ServerMessage::Relayed(relayed));
    }

    #[test]
    fn test_queen_relayed_message_omits_swarm() {
        let relayed = RelayedMessage::new(&Registration::queen("queen"), Signal::instruct("stop"));
        let value = serde_json::to_value(&relayed).unwrap();
        assert!(value.get("fromSwarm").is_none());
    }

    #[test]
    fn test_reply_wire_shape() {
        assert_eq!(
            serde_json::to_value(Reply::Registered).unwrap(),
            json!({ "type": "registered" })
        );

        let parsed: ServerMessage =
            serde_json::from_value(json!({ "type": "error", "message": "nope" })).unwrap();
        assert_eq!(parsed, ServerMessage::Reply(Reply::error("nope")));

        let parsed: ServerMessage = serde_json::from_value(json!({ "type": "registered" })).unwrap();
        assert_eq!(parsed, ServerMessage::Reply(Reply::Registered));
    }

    // === Validation Tests ===

    #[test]
    fn test_register_missing_role_fails() {
        let err = validate(json!({ "type": "register", "name": "w1", "swarm": "alpha" })).unwrap_err();
        assert_eq!(err.message(), "register: missing field 'role'");
    }

    #[test]
    fn test_agent_without_swarm_fails() {
        let err = validate(json!({ "type": "register", "name": "w1", "role": "agent" })).unwrap_err();
        assert!(err.message().contains("'swarm' is required"));

        let err =
            validate(json!({ "type": "register", "name": "c1", "role": "coordinator" })).unwrap_err();
        assert!(err.message().contains("'swarm' is required"));
    }

    #[test]
    fn test_queen_without_swarm_passes() {
        let message = validate(json!({ "type": "register", "name": "queen", "role": "queen" })).unwrap();
        assert_eq!(message, ClientMessage::Register(Registration::queen("queen")));
    }

    #[test]
    fn test_register_unknown_role_fails() {
        let err = validate(json!({ "type": "register", "name": "w1", "role": "king", "swarm": "a" }))
            .unwrap_err();
        assert!(err.message().contains("role must be one of"));
    }

    #[test]
    fn test_register_empty_name_fails() {
        let err = validate(json!({ "type": "register", "name": "", "role": "queen" })).unwrap_err();
        assert!(err.message().contains("must not be empty"));
    }

    #[test]
    fn test_wrong_field_types_fail() {
        let err = validate(json!({ "type": "nudge", "reason": 42 })).unwrap_err();
        assert_eq!(err.message(), "nudge: field 'reason' must be a string");

        let err = validate(json!({ "type": "instruct", "instruction": "x", "to": ["a"] })).unwrap_err();
        assert_eq!(err.message(), "instruct: field 'to' must be a string");

        let err = validate(json!({ "type": 7 })).unwrap_err();
        assert_eq!(err.message(), "field 'type' must be a string");
    }

    #[test]
    fn test_missing_fields_fail() {
        assert!(validate(json!({ "type": "blocker" })).is_err());
        assert!(validate(json!({ "type": "done" })).is_err());
        assert!(validate(json!({ "type": "instruct", "to": "x" })).is_err());
        assert!(validate(json!({ "reason": "x" })).is_err());
    }

    #[test]
    fn test_non_object_and_unknown_type_fail() {
        assert_eq!(
            validate(json!([1, 2])).unwrap_err().message(),
            "frame must be a JSON object"
        );
        assert_eq!(
            validate(json!({ "type": "shout" })).unwrap_err().message(),
            "unknown message type 'shout'"
        );
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("queen".parse::<Role>().unwrap(), Role::Queen);
        assert_eq!("coordinator".parse::<Role>().unwrap(), Role::Coordinator);
        assert_eq!(Role::Agent.to_string(), "agent");
        assert!("Agent".parse::<Role>().is_err());
    }

    #[test]
    fn test_signal_accessors() {
        let signal = Signal::instruct_to("ship it", "w2");
        assert_eq!(signal.kind(), "instruct");
        assert_eq!(signal.text(), "ship it");
        assert_eq!(Signal::blocker("b").kind(), "blocker");
    }
}
