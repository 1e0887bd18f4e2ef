//! Protocol frames and the JSON wire codec.
//!
//! Every message on the socket is one `(kind, seq, body)` triple, encoded as
//!
//! ```json
//! {"type": "connect", "seq": 7, "payload": {"uid": "room-1"}}
//! ```
//!
//! Decoding happens in two stages: the envelope first, then the body for its
//! kind. That way a frame with an unknown kind or a broken body still yields
//! its `seq`, and the receiver can correlate a `reject` to it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::ThreadUid;

/// Reject codes carried in [`RejectBody::code`].
pub mod reject_code {
    /// Unknown frame kind or malformed body.
    pub const BAD_REQUEST: u16 = 400;
    /// The request was understood but refused (auth denied, event while not connected).
    pub const FORBIDDEN: u16 = 403;
    /// The frame referenced a thread the receiver has no state for.
    pub const NOT_FOUND: u16 = 404;
    /// The frame kind is not accepted by this side of the connection.
    pub const NOT_ALLOWED: u16 = 405;
}

/// Frame discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Application event for a thread.
    Event,
    /// Reply correlated to an earlier frame.
    Answer,
    /// Refusal correlated to an earlier frame.
    Reject,
    /// Client request for a new subscription.
    Register,
    /// Subscription handshake.
    Connect,
    /// Unsubscription handshake.
    Disconnect,
}

impl FrameKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Answer => "answer",
            Self::Reject => "reject",
            Self::Register => "register",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        }
    }

    /// Parse a wire name. Returns `None` for unknown kinds.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "event" => Some(Self::Event),
            "answer" => Some(Self::Answer),
            "reject" => Some(Self::Reject),
            "register" => Some(Self::Register),
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an `event` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    /// Thread the event belongs to.
    pub uid: ThreadUid,
    /// Application event type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional application sub-type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Opaque application payload.
    #[serde(default)]
    pub payload: Value,
    /// Whether the sender expects an `answer` frame.
    #[serde(default)]
    pub require_answer: bool,
}

impl EventBody {
    /// Event of `kind` on `uid` with a payload.
    pub fn new(uid: impl Into<ThreadUid>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            uid: uid.into(),
            kind: kind.into(),
            subtype: None,
            payload,
            require_answer: false,
        }
    }

    /// Set the sub-type.
    #[must_use]
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Ask the receiver for an `answer`.
    #[must_use]
    pub fn requiring_answer(mut self) -> Self {
        self.require_answer = true;
        self
    }
}

/// Body of an `answer` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnswerBody {
    /// Sequence number of the frame being answered.
    pub req: u64,
    /// Opaque answer payload.
    #[serde(default)]
    pub payload: Value,
}

/// Body of a `reject` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectBody {
    /// Sequence number of the frame being rejected.
    pub req: u64,
    /// One of [`reject_code`].
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
    /// Optional extra detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl RejectBody {
    /// Reject frame `req` with a code and reason.
    pub fn new(req: u64, code: u16, reason: impl Into<String>) -> Self {
        Self {
            req,
            code,
            reason: reason.into(),
            payload: None,
        }
    }
}

/// Body of a `register` frame. Everything beyond `type` is defined by the
/// authenticator in use.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterBody {
    /// Registration type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Authenticator-defined fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RegisterBody {
    /// Registration of the given type with no extra fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Add an authenticator-defined field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        let _ = self.fields.insert(name.into(), value);
        self
    }

    /// Look up an authenticator-defined field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Body of a `connect` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectBody {
    /// Sequence number of the frame this one confirms, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<u64>,
    /// Thread being subscribed.
    pub uid: ThreadUid,
    /// Optional credential echoed to the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ConnectBody {
    /// Initiating connect for `uid`.
    pub fn new(uid: impl Into<ThreadUid>) -> Self {
        Self {
            req: None,
            uid: uid.into(),
            token: None,
        }
    }

    /// Mark this connect as the reply to frame `seq`.
    #[must_use]
    pub fn replying_to(mut self, seq: u64) -> Self {
        self.req = Some(seq);
        self
    }
}

/// Body of a `disconnect` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisconnectBody {
    /// Sequence number of the frame this one confirms, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<u64>,
    /// Thread being unsubscribed.
    pub uid: ThreadUid,
}

impl DisconnectBody {
    /// Initiating disconnect for `uid`.
    pub fn new(uid: impl Into<ThreadUid>) -> Self {
        Self {
            req: None,
            uid: uid.into(),
        }
    }

    /// Mark this disconnect as the reply to frame `seq`.
    #[must_use]
    pub fn replying_to(mut self, seq: u64) -> Self {
        self.req = Some(seq);
        self
    }
}

/// Typed frame body.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameBody {
    /// `event`
    Event(EventBody),
    /// `answer`
    Answer(AnswerBody),
    /// `reject`
    Reject(RejectBody),
    /// `register`
    Register(RegisterBody),
    /// `connect`
    Connect(ConnectBody),
    /// `disconnect`
    Disconnect(DisconnectBody),
}

impl FrameBody {
    /// Discriminant of this body.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Event(_) => FrameKind::Event,
            Self::Answer(_) => FrameKind::Answer,
            Self::Reject(_) => FrameKind::Reject,
            Self::Register(_) => FrameKind::Register,
            Self::Connect(_) => FrameKind::Connect,
            Self::Disconnect(_) => FrameKind::Disconnect,
        }
    }
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Per-channel sequence number.
    pub seq: u64,
    /// Typed body.
    pub body: FrameBody,
}

/// Envelope as it appears on the wire.
#[derive(Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    seq: u64,
    #[serde(default)]
    payload: Value,
}

/// Frame decoding failure.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text is not a frame envelope at all.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The envelope names a kind this protocol does not know.
    #[error("unknown frame type '{kind}' (seq {seq})")]
    UnknownKind {
        /// Sequence number of the offending frame.
        seq: u64,
        /// The unrecognised kind.
        kind: String,
    },
    /// The body does not match its kind.
    #[error("invalid {kind} body (seq {seq}): {source}")]
    InvalidBody {
        /// Sequence number of the offending frame.
        seq: u64,
        /// Declared kind.
        kind: FrameKind,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    /// Sequence number of the offending frame, when the envelope was readable.
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Malformed(_) => None,
            Self::UnknownKind { seq, .. } | Self::InvalidBody { seq, .. } => Some(*seq),
        }
    }
}

impl Frame {
    /// Build a frame.
    #[must_use]
    pub fn new(seq: u64, body: FrameBody) -> Self {
        Self { seq, body }
    }

    /// Discriminant of the body.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        self.body.kind()
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let payload = match &self.body {
            FrameBody::Event(b) => serde_json::to_value(b)?,
            FrameBody::Answer(b) => serde_json::to_value(b)?,
            FrameBody::Reject(b) => serde_json::to_value(b)?,
            FrameBody::Register(b) => serde_json::to_value(b)?,
            FrameBody::Connect(b) => serde_json::to_value(b)?,
            FrameBody::Disconnect(b) => serde_json::to_value(b)?,
        };
        serde_json::to_string(&WireFrame {
            kind: self.kind().as_str().to_owned(),
            seq: self.seq,
            payload,
        })
    }

    /// Decode a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let wire: WireFrame = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        let seq = wire.seq;
        let Some(kind) = FrameKind::parse(&wire.kind) else {
            return Err(FrameError::UnknownKind {
                seq,
                kind: wire.kind,
            });
        };
        let invalid = |source| FrameError::InvalidBody { seq, kind, source };
        let payload = wire.payload;
        let body = match kind {
            FrameKind::Event => FrameBody::Event(serde_json::from_value(payload).map_err(invalid)?),
            FrameKind::Answer => {
                FrameBody::Answer(serde_json::from_value(payload).map_err(invalid)?)
            }
            FrameKind::Reject => {
                FrameBody::Reject(serde_json::from_value(payload).map_err(invalid)?)
            }
            FrameKind::Register => {
                FrameBody::Register(serde_json::from_value(payload).map_err(invalid)?)
            }
            FrameKind::Connect => {
                FrameBody::Connect(serde_json::from_value(payload).map_err(invalid)?)
            }
            FrameKind::Disconnect => {
                FrameBody::Disconnect(serde_json::from_value(payload).map_err(invalid)?)
            }
        };
        Ok(Self { seq, body })
    }
}
