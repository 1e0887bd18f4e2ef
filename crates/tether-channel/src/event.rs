//! Occurrences a channel reports to its subscribers.

use std::sync::Arc;

use tether_core::{AnswerBody, EventBody, RegisterBody, RejectBody, ThreadUid};

use crate::errors::ChannelError;

/// Protocol occurrence on one channel.
///
/// `seq` is the sequence number of the frame that caused the occurrence.
/// Occurrences synthesized by a timeout or a socket close carry no `seq`.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// A client asked for a new subscription (server channels only).
    Register {
        /// Register payload.
        body: RegisterBody,
        /// Frame sequence number.
        seq: u64,
    },
    /// The connect handshake for `uid` completed on both sides.
    Connect {
        /// Thread.
        uid: ThreadUid,
        /// Sequence number of the completing frame.
        seq: u64,
    },
    /// A connect handshake ended without ever reaching the connected state.
    ///
    /// Reported when the peer refuses the connect, when the handshake times
    /// out, and when the socket closes while the thread is still connecting.
    /// In the last case `seq` is `None`, just like the `Disconnect` a close
    /// reports for connected threads.
    ConnectFail {
        /// Thread.
        uid: ThreadUid,
        /// Sequence number of the completing frame, if any.
        seq: Option<u64>,
    },
    /// A previously connected thread is gone.
    Disconnect {
        /// Thread.
        uid: ThreadUid,
        /// Sequence number of the completing frame, if any.
        seq: Option<u64>,
    },
    /// An application event arrived on a connected thread.
    Action {
        /// Event payload.
        body: EventBody,
        /// Frame sequence number.
        seq: u64,
    },
    /// The peer answered an earlier frame.
    Answer {
        /// Answer payload.
        body: AnswerBody,
        /// Frame sequence number.
        seq: u64,
    },
    /// The peer refused an earlier frame.
    Reject {
        /// Reject payload.
        body: RejectBody,
        /// Frame sequence number.
        seq: u64,
    },
    /// The socket closed. Always the last occurrence of a channel.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A frame could not be processed or a send failed asynchronously.
    Error(Arc<ChannelError>),
}

impl ChannelEvent {
    /// Short name for logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Connect { .. } => "connect",
            Self::ConnectFail { .. } => "connect_fail",
            Self::Disconnect { .. } => "disconnect",
            Self::Action { .. } => "action",
            Self::Answer { .. } => "answer",
            Self::Reject { .. } => "reject",
            Self::Close { .. } => "close",
            Self::Error(_) => "error",
        }
    }
}
