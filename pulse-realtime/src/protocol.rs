//! Wire codec for the multiplexed channel protocol.
//!
//! Every frame on the socket is one logical message:
//!
//! ```text
//! ┌──────────┬──────┬───────┬───────┬─────────┐
//! │ join_ref │ ref  │ topic │ event │ payload │
//! └──────────┴──────┴───────┴───────┴─────────┘
//! ```
//!
//! Two framings exist. The JSON framing is a 5-element array with `null`
//! standing in for absent refs. The binary framing is a 1-byte kind
//! discriminator followed by single-byte length prefixes for each string
//! field and the raw payload bytes at the tail; it is used whenever a payload
//! is an opaque byte buffer rather than JSON.
//!
//! Encode targets the current revision (push kind 3 with an explicit
//! payload-encoding byte). The legacy kinds 0 and 2 are decode-only.

use serde_json::{json, Map, Value};
use std::fmt;

/// Protocol version reported in the connection query string.
pub const VSN: &str = "1.0.0";

/// Reserved channel lifecycle events. Frames carrying one of these with a
/// stale join reference are fenced out by the channel layer.
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_JOIN: &str = "phx_join";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_LEAVE: &str = "phx_leave";

/// Events that are join-scoped and subject to join-ref fencing.
pub const RESERVED_EVENTS: [&str; 4] = [PHX_CLOSE, PHX_ERROR, PHX_LEAVE, PHX_JOIN];

// Binary frame kinds.
const KIND_PUSH_LEGACY: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_BROADCAST_LEGACY: u8 = 2;
const KIND_PUSH: u8 = 3;
const KIND_USER_BROADCAST: u8 = 4;

// Payload-encoding byte for kinds 3 and 4.
const ENC_BINARY: u8 = 0;
const ENC_JSON: u8 = 1;

/// A message payload: JSON for the common case, raw bytes for binary
/// broadcasts and binary pushes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Empty JSON object payload.
    pub fn empty() -> Self {
        Payload::Json(json!({}))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Binary(_) => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }
}

/// One logical protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Ref of the push that joined the topic's channel, if any.
    pub join_ref: Option<String>,
    /// Per-push correlation ref, if any.
    pub reference: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Payload,
}

impl Message {
    pub fn new(
        join_ref: Option<String>,
        reference: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            join_ref,
            reference,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }
}

/// Codec failures. Decoding never panics: any out-of-range slice or unknown
/// discriminator surfaces here instead.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Frame is not the expected 5-element array shape.
    MalformedFrame(String),
    /// A string field exceeds the 255-byte limit of the single-byte prefix.
    FieldTooLong { field: &'static str, len: usize },
    /// Binary frame ended before a declared length was satisfied.
    UnexpectedEof,
    /// Unknown binary kind discriminator.
    UnknownKind(u8),
    /// A length-prefixed field was not valid UTF-8.
    InvalidUtf8,
    InvalidJson(String),
    /// Payload kind does not fit the requested framing.
    UnsupportedPayload(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFrame(detail) => write!(f, "malformed frame: {detail}"),
            Self::FieldTooLong { field, len } => {
                write!(f, "field `{field}` is {len} bytes, limit is 255")
            }
            Self::UnexpectedEof => write!(f, "frame truncated"),
            Self::UnknownKind(kind) => write!(f, "unknown binary frame kind {kind}"),
            Self::InvalidUtf8 => write!(f, "field is not valid UTF-8"),
            Self::InvalidJson(detail) => write!(f, "invalid JSON payload: {detail}"),
            Self::UnsupportedPayload(detail) => write!(f, "unsupported payload: {detail}"),
        }
    }
}

impl std::error::Error for CodecError {}

// ───────────────────────────────────────────────────────────────────
// JSON framing
// ───────────────────────────────────────────────────────────────────

/// Encode a message as the 5-element JSON array framing.
///
/// Binary payloads cannot travel in a text frame; callers route those to
/// [`encode_binary`].
pub fn encode_json(msg: &Message) -> Result<String, CodecError> {
    let payload = msg
        .payload
        .as_json()
        .ok_or(CodecError::UnsupportedPayload("binary payload in JSON framing"))?;
    let frame = json!([
        msg.join_ref,
        msg.reference,
        msg.topic,
        msg.event,
        payload,
    ]);
    serde_json::to_string(&frame).map_err(|e| CodecError::InvalidJson(e.to_string()))
}

/// Decode the 5-element JSON array framing.
///
/// A frame that is not exactly `[join_ref, ref, topic, event, payload]` is an
/// error; the legacy bare-object form is not accepted.
pub fn decode_json(text: &str) -> Result<Message, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
    let items = value
        .as_array()
        .ok_or_else(|| CodecError::MalformedFrame("expected array".into()))?;
    if items.len() != 5 {
        return Err(CodecError::MalformedFrame(format!(
            "expected 5 elements, got {}",
            items.len()
        )));
    }
    let opt_string = |v: &Value, name: &'static str| -> Result<Option<String>, CodecError> {
        match v {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            other => Err(CodecError::MalformedFrame(format!(
                "{name} must be string or null, got {other}"
            ))),
        }
    };
    let string = |v: &Value, name: &'static str| -> Result<String, CodecError> {
        v.as_str()
            .map(str::to_owned)
            .ok_or_else(|| CodecError::MalformedFrame(format!("{name} must be a string")))
    };
    Ok(Message {
        join_ref: opt_string(&items[0], "join_ref")?,
        reference: opt_string(&items[1], "ref")?,
        topic: string(&items[2], "topic")?,
        event: string(&items[3], "event")?,
        payload: Payload::Json(items[4].clone()),
    })
}

// ───────────────────────────────────────────────────────────────────
// Binary framing
// ───────────────────────────────────────────────────────────────────

/// Bounds-checked byte cursor: every read is validated before slicing.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_str(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

fn field_len(field: &'static str, s: &str) -> Result<u8, CodecError> {
    u8::try_from(s.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: s.len(),
    })
}

fn parse_json(bytes: &[u8]) -> Result<Value, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::InvalidJson(e.to_string()))
}

/// Encode a push as the current binary layout (kind 3):
///
/// ```text
/// kind | len(join_ref) | len(ref) | len(topic) | len(event) | encoding
///      | join_ref | ref | topic | event | payload bytes
/// ```
///
/// The encoding byte is `1` for JSON payloads and `0` for raw binary.
pub fn encode_binary(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let join_ref = msg.join_ref.as_deref().unwrap_or("");
    let reference = msg.reference.as_deref().unwrap_or("");
    let (encoding, payload_bytes) = match &msg.payload {
        Payload::Json(v) => (
            ENC_JSON,
            serde_json::to_vec(v).map_err(|e| CodecError::InvalidJson(e.to_string()))?,
        ),
        Payload::Binary(b) => (ENC_BINARY, b.clone()),
    };

    let mut out = Vec::with_capacity(
        6 + join_ref.len() + reference.len() + msg.topic.len() + msg.event.len()
            + payload_bytes.len(),
    );
    out.push(KIND_PUSH);
    out.push(field_len("join_ref", join_ref)?);
    out.push(field_len("ref", reference)?);
    out.push(field_len("topic", &msg.topic)?);
    out.push(field_len("event", &msg.event)?);
    out.push(encoding);
    out.extend_from_slice(join_ref.as_bytes());
    out.extend_from_slice(reference.as_bytes());
    out.extend_from_slice(msg.topic.as_bytes());
    out.extend_from_slice(msg.event.as_bytes());
    out.extend_from_slice(&payload_bytes);
    Ok(out)
}

/// Decode any of the binary frame kinds 0 through 4.
pub fn decode_binary(buf: &[u8]) -> Result<Message, CodecError> {
    let mut cur = Cursor::new(buf);
    match cur.byte()? {
        KIND_PUSH_LEGACY => {
            let jlen = cur.byte()? as usize;
            let tlen = cur.byte()? as usize;
            let elen = cur.byte()? as usize;
            let join_ref = cur.take_str(jlen)?;
            let topic = cur.take_str(tlen)?;
            let event = cur.take_str(elen)?;
            Ok(Message {
                join_ref: none_if_empty(join_ref),
                reference: None,
                topic,
                event,
                payload: Payload::Binary(cur.rest().to_vec()),
            })
        }
        KIND_PUSH => {
            let jlen = cur.byte()? as usize;
            let rlen = cur.byte()? as usize;
            let tlen = cur.byte()? as usize;
            let elen = cur.byte()? as usize;
            let encoding = cur.byte()?;
            let join_ref = cur.take_str(jlen)?;
            let reference = cur.take_str(rlen)?;
            let topic = cur.take_str(tlen)?;
            let event = cur.take_str(elen)?;
            let payload = decode_payload(encoding, cur.rest())?;
            Ok(Message {
                join_ref: none_if_empty(join_ref),
                reference: none_if_empty(reference),
                topic,
                event,
                payload,
            })
        }
        KIND_REPLY => {
            let jlen = cur.byte()? as usize;
            let rlen = cur.byte()? as usize;
            let tlen = cur.byte()? as usize;
            let elen = cur.byte()? as usize;
            let join_ref = cur.take_str(jlen)?;
            let reference = cur.take_str(rlen)?;
            let topic = cur.take_str(tlen)?;
            let status = cur.take_str(elen)?;
            let response = parse_json(cur.rest())?;
            Ok(Message {
                join_ref: none_if_empty(join_ref),
                reference: none_if_empty(reference),
                topic,
                event: PHX_REPLY.to_string(),
                payload: Payload::Json(json!({ "status": status, "response": response })),
            })
        }
        KIND_BROADCAST_LEGACY => {
            let tlen = cur.byte()? as usize;
            let elen = cur.byte()? as usize;
            let topic = cur.take_str(tlen)?;
            let event = cur.take_str(elen)?;
            let payload = parse_json(cur.rest())?;
            Ok(Message {
                join_ref: None,
                reference: None,
                topic,
                event,
                payload: Payload::Json(payload),
            })
        }
        KIND_USER_BROADCAST => {
            let tlen = cur.byte()? as usize;
            let elen = cur.byte()? as usize;
            let mlen = cur.byte()? as usize;
            let encoding = cur.byte()?;
            let topic = cur.take_str(tlen)?;
            let event = cur.take_str(elen)?;
            let meta = if mlen > 0 {
                Some(parse_json(cur.take(mlen)?)?)
            } else {
                None
            };
            match decode_payload(encoding, cur.rest())? {
                Payload::Json(inner) => {
                    let mut body = Map::new();
                    body.insert("type".into(), json!("broadcast"));
                    body.insert("event".into(), json!(event));
                    if let Some(meta) = meta {
                        body.insert("meta".into(), meta);
                    }
                    body.insert("payload".into(), inner);
                    Ok(Message {
                        join_ref: None,
                        reference: None,
                        topic,
                        event: "broadcast".to_string(),
                        payload: Payload::Json(Value::Object(body)),
                    })
                }
                // Raw payloads keep their bytes; meta travels only with JSON
                // payloads.
                Payload::Binary(bytes) => Ok(Message {
                    join_ref: None,
                    reference: None,
                    topic,
                    event,
                    payload: Payload::Binary(bytes),
                }),
            }
        }
        kind => Err(CodecError::UnknownKind(kind)),
    }
}

fn decode_payload(encoding: u8, bytes: &[u8]) -> Result<Payload, CodecError> {
    match encoding {
        ENC_JSON => Ok(Payload::Json(parse_json(bytes)?)),
        ENC_BINARY => Ok(Payload::Binary(bytes.to_vec())),
        other => Err(CodecError::MalformedFrame(format!(
            "unknown payload encoding {other}"
        ))),
    }
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
