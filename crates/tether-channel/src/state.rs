//! Per-thread handshake state.
//!
//! Each side of a channel keeps one [`HandshakeState`] per thread. A thread
//! with no entry is absent. The connect and disconnect handshakes are two-way
//! confirmed: a phase completes once this side has both sent and received the
//! corresponding frame, in either order.

use tether_core::ThreadUid;

use crate::event::ChannelEvent;

/// Where a disconnect started from. Decides which terminal occurrence a
/// finished disconnect reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The thread never finished connecting.
    Connecting,
    /// The thread was connected.
    Connected,
}

/// Handshake phase of one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Connect frames in flight.
    Connecting {
        /// This side sent its connect.
        sent: bool,
        /// The peer's connect arrived.
        received: bool,
    },
    /// Both connects exchanged.
    Connected,
    /// Disconnect frames in flight.
    Disconnecting {
        /// This side sent its disconnect.
        sent: bool,
        /// The peer's disconnect arrived.
        received: bool,
        /// Phase the disconnect started from.
        origin: Origin,
    },
}

/// How a thread's state ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    /// Never connected.
    ConnectFail,
    /// Was connected.
    Disconnect,
}

impl Terminal {
    /// The occurrence to report for this ending.
    #[must_use]
    pub fn into_event(self, uid: ThreadUid, seq: Option<u64>) -> ChannelEvent {
        match self {
            Self::ConnectFail => ChannelEvent::ConnectFail { uid, seq },
            Self::Disconnect => ChannelEvent::Disconnect { uid, seq },
        }
    }
}

/// Phase plus the timer marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeState {
    /// Current phase.
    pub phase: Phase,
    /// A handshake timer is armed for this thread.
    pub outdating: bool,
}

impl HandshakeState {
    pub(crate) fn new(phase: Phase) -> Self {
        Self {
            phase,
            outdating: false,
        }
    }

    /// Both connects exchanged.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// Connect in flight.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(self.phase, Phase::Connecting { .. })
    }

    /// Disconnect in flight.
    #[must_use]
    pub fn is_disconnecting(&self) -> bool {
        matches!(self.phase, Phase::Disconnecting { .. })
    }

    /// Inbound events are delivered while connected, and during a locally
    /// started disconnect until the peer's disconnect arrives.
    #[must_use]
    pub fn accepts_inbound_event(&self) -> bool {
        matches!(
            self.phase,
            Phase::Connected
                | Phase::Disconnecting {
                    received: false,
                    origin: Origin::Connected,
                    ..
                }
        )
    }

    /// The connect handshake finished on this side.
    pub(crate) fn connect_complete(&self) -> bool {
        self.phase
            == Phase::Connecting {
                sent: true,
                received: true,
            }
    }

    /// The disconnect handshake finished on this side.
    pub(crate) fn disconnect_complete(&self) -> bool {
        matches!(
            self.phase,
            Phase::Disconnecting {
                sent: true,
                received: true,
                ..
            }
        )
    }

    /// Move into (or further along) the disconnecting phase, recording which
    /// halves are now done.
    pub(crate) fn mark_disconnect(&mut self, now_sent: bool, now_received: bool) {
        self.phase = match self.phase {
            Phase::Connecting { .. } => Phase::Disconnecting {
                sent: now_sent,
                received: now_received,
                origin: Origin::Connecting,
            },
            Phase::Connected => Phase::Disconnecting {
                sent: now_sent,
                received: now_received,
                origin: Origin::Connected,
            },
            Phase::Disconnecting {
                sent,
                received,
                origin,
            } => Phase::Disconnecting {
                sent: sent || now_sent,
                received: received || now_received,
                origin,
            },
        };
    }

    /// How the thread ends if its state is dropped right now.
    #[must_use]
    pub fn terminal(&self) -> Terminal {
        match self.phase {
            Phase::Connected
            | Phase::Disconnecting {
                origin: Origin::Connected,
                ..
            } => Terminal::Disconnect,
            Phase::Connecting { .. }
            | Phase::Disconnecting {
                origin: Origin::Connecting,
                ..
            } => Terminal::ConnectFail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connecting(sent: bool, received: bool) -> HandshakeState {
        HandshakeState::new(Phase::Connecting { sent, received })
    }

    #[test]
    fn connect_completes_only_with_both_halves() {
        assert!(!connecting(true, false).connect_complete());
        assert!(!connecting(false, true).connect_complete());
        assert!(connecting(true, true).connect_complete());
    }

    #[test]
    fn disconnect_from_connected_keeps_origin() {
        let mut st = HandshakeState::new(Phase::Connected);
        st.mark_disconnect(true, false);
        assert_eq!(
            st.phase,
            Phase::Disconnecting {
                sent: true,
                received: false,
                origin: Origin::Connected
            }
        );
        assert!(st.accepts_inbound_event());
        st.mark_disconnect(false, true);
        assert!(st.disconnect_complete());
        assert!(!st.accepts_inbound_event());
        assert_eq!(st.terminal(), Terminal::Disconnect);
    }

    #[test]
    fn disconnect_while_connecting_ends_as_connect_fail() {
        let mut st = connecting(true, false);
        st.mark_disconnect(false, true);
        assert!(st.is_disconnecting());
        assert!(!st.accepts_inbound_event());
        assert_eq!(st.terminal(), Terminal::ConnectFail);
    }

    #[test]
    fn connecting_threads_refuse_events() {
        assert!(!connecting(true, true).accepts_inbound_event());
        assert!(HandshakeState::new(Phase::Connected).accepts_inbound_event());
    }

    #[test]
    fn terminal_maps_to_event() {
        let ev = Terminal::ConnectFail.into_event(ThreadUid::from("t"), None);
        assert_eq!(ev.name(), "connect_fail");
    }
}
