//! The channel engine.
//!
//! A [`Channel`] wraps one transport and keeps a handshake state per thread.
//! Outbound operations set the local half of a handshake *before* the frame
//! goes out, then check for completion once the send resolves, so an echo
//! that the worker processes while the send is still in flight is never
//! misread as a fresh peer-initiated handshake.
//!
//! Every pending handshake arms one timer. A timer that fires on a thread
//! that is still not connected drops the thread's state and reports the
//! terminal occurrence.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tether_core::{
    AnswerBody, ChannelId, ConnectBody, ConnectionError, DisconnectBody, EventBody, Frame,
    FrameBody, RegisterBody, RejectBody, ThreadUid, TransportError, reject_code,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::errors::ChannelError;
use crate::event::ChannelEvent;
use crate::state::{HandshakeState, Phase, Terminal};
use crate::transport::{ReadyState, RequestInfo, Transport};

/// Default handshake window.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Close code used when the peer breaks the framing rules.
pub const PROTOCOL_ERROR: u16 = 1002;

/// Channel tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long a connect or disconnect may stay unconfirmed.
    pub handshake_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

struct Timer {
    token: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Shared {
    /// Highest sequence number seen or used on this channel.
    seq: u64,
    states: HashMap<ThreadUid, HandshakeState>,
    timers: HashMap<ThreadUid, Timer>,
    next_timer: u64,
    closed: bool,
}

impl Shared {
    fn cancel_timer(&mut self, uid: &ThreadUid) {
        if let Some(timer) = self.timers.remove(uid) {
            timer.handle.abort();
        }
        if let Some(st) = self.states.get_mut(uid) {
            st.outdating = false;
        }
    }
}

/// Inbound connect outcome, decided under the lock and acted on after it.
enum ConnectReaction {
    Echo,
    Refuse,
    Complete,
    Ignore,
}

/// Inbound disconnect outcome.
enum DisconnectReaction {
    Unknown,
    Echo,
    Complete(Terminal),
}

/// One physical duplex connection and the handshake state of every thread on
/// it.
pub struct Channel {
    id: ChannelId,
    is_client: bool,
    request: Option<RequestInfo>,
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    shared: Mutex<Shared>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    this: Weak<Channel>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("is_client", &self.is_client)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Server-side channel for a socket accepted from `request`.
    pub fn server(
        id: ChannelId,
        transport: Arc<dyn Transport>,
        request: RequestInfo,
        config: ChannelConfig,
    ) -> Arc<Self> {
        Self::build(id, false, Some(request), transport, config)
    }

    /// Client-side channel.
    pub fn client(id: ChannelId, transport: Arc<dyn Transport>, config: ChannelConfig) -> Arc<Self> {
        Self::build(id, true, None, transport, config)
    }

    fn build(
        id: ChannelId,
        is_client: bool,
        request: Option<RequestInfo>,
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            is_client,
            request,
            transport,
            config,
            shared: Mutex::new(Shared::default()),
            subscribers: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Channel identity.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Whether this is the client side.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Upgrade request of a server-side channel.
    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.request.as_ref()
    }

    /// Receive every occurrence reported from now on.
    ///
    /// The queue is unbounded so that a subscriber may call back into the
    /// channel without stalling the worker that feeds it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// The transport is open.
    pub fn is_ready(&self) -> bool {
        self.transport.ready_state() == ReadyState::Open
    }

    /// Socket readiness.
    pub fn ready_state(&self) -> ReadyState {
        self.transport.ready_state()
    }

    /// Both connects for `uid` have been exchanged.
    pub fn is_connected_to(&self, uid: &ThreadUid) -> bool {
        self.handshake_state(uid)
            .is_some_and(|st| st.is_connected())
    }

    /// A connect for `uid` is in flight.
    pub fn is_connecting_to(&self, uid: &ThreadUid) -> bool {
        self.handshake_state(uid)
            .is_some_and(|st| st.is_connecting())
    }

    /// A disconnect for `uid` is in flight.
    pub fn is_disconnecting_to(&self, uid: &ThreadUid) -> bool {
        self.handshake_state(uid)
            .is_some_and(|st| st.is_disconnecting())
    }

    /// Snapshot of the handshake state of `uid`. `None` means absent.
    pub fn handshake_state(&self, uid: &ThreadUid) -> Option<HandshakeState> {
        self.shared.lock().states.get(uid).copied()
    }

    /// Threads that currently have any handshake state.
    pub fn threads(&self) -> Vec<ThreadUid> {
        self.shared.lock().states.keys().cloned().collect()
    }

    // ── outbound ────────────────────────────────────────────────────────

    /// Start (or answer) the connect handshake for `body.uid`.
    ///
    /// Returns the sequence number of the sent frame. Fails if the thread is
    /// already connected, disconnecting, or has a connect outstanding, and
    /// once the socket has closed. A failed send leaves the thread as it was.
    pub async fn connect(&self, body: ConnectBody) -> Result<u64, ChannelError> {
        let uid = body.uid.clone();
        let (attempted, previous, armed) = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            if shared.closed {
                return Err(TransportError::Closed.into());
            }
            let previous = match shared.states.get(&uid).map(|st| st.phase) {
                None => None,
                Some(Phase::Connected) => {
                    return Err(ConnectionError::AlreadyConnected(uid).into());
                }
                Some(Phase::Disconnecting { .. }) => {
                    return Err(ConnectionError::Disconnecting(uid).into());
                }
                Some(Phase::Connecting { sent: true, .. }) => {
                    return Err(ConnectionError::AlreadyConnecting(uid).into());
                }
                Some(phase @ Phase::Connecting { sent: false, .. }) => Some(phase),
            };
            let received = matches!(previous, Some(Phase::Connecting { received: true, .. }));
            let attempted = Phase::Connecting {
                sent: true,
                received,
            };
            shared
                .states
                .entry(uid.clone())
                .or_insert_with(|| HandshakeState::new(attempted))
                .phase = attempted;
            (attempted, previous, self.arm_timer(shared, &uid))
        };

        let seq = match self.send_frame(FrameBody::Connect(body)).await {
            Ok(seq) => seq,
            Err(err) => {
                self.undo_unsent(&uid, attempted, previous, armed);
                return Err(err);
            }
        };

        let completed = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            let done = shared
                .states
                .get(&uid)
                .is_some_and(HandshakeState::connect_complete);
            if done {
                if let Some(st) = shared.states.get_mut(&uid) {
                    st.phase = Phase::Connected;
                }
                shared.cancel_timer(&uid);
            }
            done
        };
        if completed {
            info!(channel_id = %self.id, %uid, seq, "thread connected");
            self.emit(ChannelEvent::Connect { uid, seq });
        }
        Ok(seq)
    }

    /// Start (or answer) the disconnect handshake for `body.uid`.
    ///
    /// Returns `Ok(None)` without sending when this side already sent its
    /// disconnect. Fails if the thread has no state or the socket has closed.
    /// A failed send leaves the thread as it was.
    pub async fn disconnect(&self, body: DisconnectBody) -> Result<Option<u64>, ChannelError> {
        let uid = body.uid.clone();
        let (attempted, previous, armed) = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            if shared.closed {
                return Err(TransportError::Closed.into());
            }
            let Some(st) = shared.states.get_mut(&uid) else {
                return Err(ConnectionError::NoState(uid).into());
            };
            if matches!(st.phase, Phase::Disconnecting { sent: true, .. }) {
                debug!(channel_id = %self.id, %uid, "disconnect already sent");
                return Ok(None);
            }
            let previous = st.phase;
            st.mark_disconnect(true, false);
            let attempted = st.phase;
            (attempted, Some(previous), self.arm_timer(shared, &uid))
        };

        let seq = match self.send_frame(FrameBody::Disconnect(body)).await {
            Ok(seq) => seq,
            Err(err) => {
                self.undo_unsent(&uid, attempted, previous, armed);
                return Err(err);
            }
        };

        let terminal = {
            let mut shared = self.shared.lock();
            match shared.states.get(&uid).copied() {
                Some(st) if st.disconnect_complete() => {
                    shared.cancel_timer(&uid);
                    let _ = shared.states.remove(&uid);
                    Some(st.terminal())
                }
                _ => None,
            }
        };
        if let Some(terminal) = terminal {
            info!(channel_id = %self.id, %uid, seq, ?terminal, "thread released");
            self.emit(terminal.into_event(uid, Some(seq)));
        }
        Ok(Some(seq))
    }

    /// Send an application event. The thread must be connected.
    pub async fn event(&self, body: EventBody) -> Result<u64, ChannelError> {
        if !self.is_connected_to(&body.uid) {
            return Err(ConnectionError::NotConnected(body.uid).into());
        }
        self.send_frame(FrameBody::Event(body)).await
    }

    /// Answer an earlier frame.
    pub async fn answer(&self, body: AnswerBody) -> Result<u64, ChannelError> {
        self.send_frame(FrameBody::Answer(body)).await
    }

    /// Refuse an earlier frame.
    pub async fn reject(&self, body: RejectBody) -> Result<u64, ChannelError> {
        self.send_frame(FrameBody::Reject(body)).await
    }

    /// Ask the server for a new subscription. Client channels only.
    pub async fn register(&self, body: RegisterBody) -> Result<u64, ChannelError> {
        if !self.is_client {
            return Err(ConnectionError::RegisterOnServer.into());
        }
        self.send_frame(FrameBody::Register(body)).await
    }

    /// Close the socket. Cleanup happens when the close is reported back.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError> {
        debug!(channel_id = %self.id, code, reason, "closing channel");
        self.transport.close(code, reason).await?;
        Ok(())
    }

    async fn send_frame(&self, body: FrameBody) -> Result<u64, ChannelError> {
        let seq = {
            let mut shared = self.shared.lock();
            shared.seq = shared
                .seq
                .checked_add(1)
                .ok_or(ChannelError::SequenceExhausted)?;
            shared.seq
        };
        let frame = Frame::new(seq, body);
        let kind = frame.kind();
        let text = frame.encode()?;
        self.transport.send(text).await?;
        counter!("channel_frames_sent_total", "kind" => kind.as_str()).increment(1);
        trace!(channel_id = %self.id, seq, %kind, "frame sent");
        Ok(seq)
    }

    /// Put `uid` back to `previous` after its handshake frame failed to go
    /// out. Nothing changes if an inbound frame moved the thread on in the
    /// meantime. The timer armed for the attempt stops once the thread is
    /// absent or connected again; a still-pending thread keeps it so that it
    /// expires.
    fn undo_unsent(
        &self,
        uid: &ThreadUid,
        attempted: Phase,
        previous: Option<Phase>,
        armed: Option<u64>,
    ) {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;
        if shared.states.get(uid).is_none_or(|st| st.phase != attempted) {
            return;
        }
        let settled = match previous {
            Some(phase) => {
                if let Some(st) = shared.states.get_mut(uid) {
                    st.phase = phase;
                }
                phase == Phase::Connected
            }
            None => {
                let _ = shared.states.remove(uid);
                true
            }
        };
        let ours = armed
            .is_some_and(|token| shared.timers.get(uid).is_some_and(|t| t.token == token));
        if settled && ours {
            shared.cancel_timer(uid);
        }
        debug!(channel_id = %self.id, %uid, "handshake rolled back after failed send");
    }

    // ── inbound ─────────────────────────────────────────────────────────

    /// Process one inbound text frame.
    pub async fn handle_message(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(channel_id = %self.id, error = %err, "undecodable frame");
                counter!("channel_frames_invalid_total").increment(1);
                if let Some(seq) = err.seq() {
                    if !self.observe_seq(seq) {
                        self.refuse_exhausted(seq).await;
                        return;
                    }
                    self.reply_reject(RejectBody::new(
                        seq,
                        reject_code::BAD_REQUEST,
                        err.to_string(),
                    ))
                    .await;
                }
                self.emit_error(err.into());
                return;
            }
        };

        let seq = frame.seq;
        if !self.observe_seq(seq) {
            self.refuse_exhausted(seq).await;
            return;
        }
        counter!("channel_frames_received_total", "kind" => frame.kind().as_str()).increment(1);
        trace!(channel_id = %self.id, seq, kind = %frame.kind(), "frame received");

        match frame.body {
            FrameBody::Connect(body) => self.on_connect(body, seq).await,
            FrameBody::Disconnect(body) => self.on_disconnect(body, seq).await,
            FrameBody::Event(body) => self.on_event(body, seq).await,
            FrameBody::Register(body) => self.on_register(body, seq).await,
            FrameBody::Answer(body) => self.emit(ChannelEvent::Answer { body, seq }),
            FrameBody::Reject(body) => {
                debug!(channel_id = %self.id, req = body.req, code = body.code, reason = %body.reason, "peer rejected frame");
                self.emit(ChannelEvent::Reject { body, seq });
            }
        }
    }

    /// The socket closed. Every thread still tracked ends, all timers stop,
    /// and `Close` is reported last. Later calls do nothing.
    ///
    /// Connected threads end with `Disconnect`, threads still connecting end
    /// with `ConnectFail`. After this, `connect` and `disconnect` fail with
    /// [`TransportError::Closed`].
    pub fn handle_close(&self, code: u16, reason: &str) {
        let ended: Vec<(ThreadUid, Terminal)> = {
            let mut shared = self.shared.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            for (_, timer) in shared.timers.drain() {
                timer.handle.abort();
            }
            shared
                .states
                .drain()
                .map(|(uid, st)| (uid, st.terminal()))
                .collect()
        };
        info!(channel_id = %self.id, code, reason, threads = ended.len(), "channel closed");
        for (uid, terminal) in ended {
            self.emit(terminal.into_event(uid, None));
        }
        self.emit(ChannelEvent::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    /// The socket reported an error without closing.
    pub fn handle_transport_error(&self, err: TransportError) {
        warn!(channel_id = %self.id, error = %err, "transport error");
        self.emit_error(err.into());
    }

    async fn on_connect(&self, body: ConnectBody, seq: u64) {
        let uid = body.uid;
        let reaction = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            let reaction = match shared.states.get_mut(&uid) {
                None => {
                    let _ = shared.states.insert(
                        uid.clone(),
                        HandshakeState::new(Phase::Connecting {
                            sent: false,
                            received: true,
                        }),
                    );
                    if self.is_client {
                        ConnectReaction::Echo
                    } else {
                        ConnectReaction::Refuse
                    }
                }
                Some(st) => match st.phase {
                    Phase::Connecting { sent: true, .. } => {
                        st.phase = Phase::Connected;
                        ConnectReaction::Complete
                    }
                    Phase::Connecting { sent: false, .. } => {
                        st.phase = Phase::Connecting {
                            sent: false,
                            received: true,
                        };
                        ConnectReaction::Ignore
                    }
                    Phase::Connected | Phase::Disconnecting { .. } => ConnectReaction::Ignore,
                },
            };
            if matches!(reaction, ConnectReaction::Complete) {
                shared.cancel_timer(&uid);
            }
            reaction
        };

        match reaction {
            ConnectReaction::Complete => {
                info!(channel_id = %self.id, %uid, seq, "thread connected");
                self.emit(ChannelEvent::Connect { uid, seq });
            }
            ConnectReaction::Echo => {
                if let Err(err) = self.connect(ConnectBody::new(uid).replying_to(seq)).await {
                    warn!(channel_id = %self.id, error = %err, "failed to echo connect");
                    self.emit_error(err);
                }
            }
            ConnectReaction::Refuse => {
                info!(channel_id = %self.id, %uid, seq, "refusing peer-initiated connect");
                if let Err(err) = self
                    .disconnect(DisconnectBody::new(uid).replying_to(seq))
                    .await
                {
                    warn!(channel_id = %self.id, error = %err, "failed to refuse connect");
                    self.emit_error(err);
                }
            }
            ConnectReaction::Ignore => {
                debug!(channel_id = %self.id, %uid, seq, "ignoring connect");
            }
        }
    }

    async fn on_disconnect(&self, body: DisconnectBody, seq: u64) {
        let uid = body.uid;
        let reaction = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            let reaction = match shared.states.get_mut(&uid) {
                None => DisconnectReaction::Unknown,
                Some(st) => {
                    if matches!(st.phase, Phase::Disconnecting { sent: true, .. }) {
                        DisconnectReaction::Complete(st.terminal())
                    } else {
                        st.mark_disconnect(false, true);
                        DisconnectReaction::Echo
                    }
                }
            };
            if matches!(reaction, DisconnectReaction::Complete(_)) {
                shared.cancel_timer(&uid);
                let _ = shared.states.remove(&uid);
            }
            reaction
        };

        match reaction {
            DisconnectReaction::Unknown => {
                debug!(channel_id = %self.id, %uid, seq, "disconnect for unknown thread");
                self.reply_reject(RejectBody::new(
                    seq,
                    reject_code::NOT_FOUND,
                    format!("no connection to thread {uid}"),
                ))
                .await;
            }
            DisconnectReaction::Complete(terminal) => {
                info!(channel_id = %self.id, %uid, seq, ?terminal, "thread released");
                self.emit(terminal.into_event(uid, Some(seq)));
            }
            DisconnectReaction::Echo => {
                if let Err(err) = self
                    .disconnect(DisconnectBody::new(uid).replying_to(seq))
                    .await
                {
                    warn!(channel_id = %self.id, error = %err, "failed to echo disconnect");
                    self.emit_error(err);
                }
            }
        }
    }

    async fn on_event(&self, body: EventBody, seq: u64) {
        let accepted = self
            .handshake_state(&body.uid)
            .is_some_and(|st| st.accepts_inbound_event());
        if accepted {
            self.emit(ChannelEvent::Action { body, seq });
        } else {
            debug!(channel_id = %self.id, uid = %body.uid, seq, "event for unconnected thread");
            self.reply_reject(RejectBody::new(
                seq,
                reject_code::FORBIDDEN,
                format!("not connected to thread {}", body.uid),
            ))
            .await;
        }
    }

    async fn on_register(&self, body: RegisterBody, seq: u64) {
        if self.is_client {
            self.reply_reject(RejectBody::new(
                seq,
                reject_code::NOT_ALLOWED,
                "register is not accepted by clients",
            ))
            .await;
        } else {
            self.emit(ChannelEvent::Register { body, seq });
        }
    }

    async fn reply_reject(&self, body: RejectBody) {
        if let Err(err) = self.reject(body).await {
            warn!(channel_id = %self.id, error = %err, "failed to send reject");
            self.emit_error(err);
        }
    }

    /// Follow the peer's sequence number. A number that leaves no room for a
    /// reply is refused.
    fn observe_seq(&self, seq: u64) -> bool {
        if seq == u64::MAX {
            return false;
        }
        let mut shared = self.shared.lock();
        shared.seq = shared.seq.max(seq);
        true
    }

    /// The peer used up the sequence space. Nothing can be answered any
    /// more, so the socket is closed.
    async fn refuse_exhausted(&self, seq: u64) {
        warn!(channel_id = %self.id, seq, "peer exhausted the sequence space");
        counter!("channel_frames_invalid_total").increment(1);
        self.emit_error(ChannelError::SequenceExhausted);
        if let Err(err) = self.close(PROTOCOL_ERROR, "sequence exhausted").await {
            warn!(channel_id = %self.id, error = %err, "failed to close channel");
            self.emit_error(err);
        }
    }

    // ── timers ──────────────────────────────────────────────────────────

    /// Arm the handshake timer for `uid` unless one is already running.
    /// Returns the token of a newly armed timer.
    fn arm_timer(&self, shared: &mut Shared, uid: &ThreadUid) -> Option<u64> {
        if shared.closed || shared.timers.contains_key(uid) {
            return None;
        }
        shared.next_timer += 1;
        let token = shared.next_timer;
        let weak = self.this.clone();
        let timeout = self.config.handshake_timeout;
        let timer_uid = uid.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(channel) = weak.upgrade() {
                channel.handle_timeout(&timer_uid, token);
            }
        });
        let _ = shared.timers.insert(
            uid.clone(),
            Timer {
                token,
                handle: task.abort_handle(),
            },
        );
        if let Some(st) = shared.states.get_mut(uid) {
            st.outdating = true;
        }
        Some(token)
    }

    fn handle_timeout(&self, uid: &ThreadUid, token: u64) {
        let terminal = {
            let mut shared = self.shared.lock();
            // a completed handshake may have replaced or cancelled this timer
            if shared.timers.get(uid).is_none_or(|t| t.token != token) {
                return;
            }
            let _ = shared.timers.remove(uid);
            match shared.states.get(uid).copied() {
                None => return,
                Some(st) if st.is_connected() => {
                    shared.cancel_timer(uid);
                    return;
                }
                Some(st) => {
                    let _ = shared.states.remove(uid);
                    st.terminal()
                }
            }
        };
        counter!("channel_handshake_timeouts_total").increment(1);
        warn!(channel_id = %self.id, %uid, ?terminal, "handshake timed out");
        self.emit(terminal.into_event(uid.clone(), None));
    }

    // ── subscribers ─────────────────────────────────────────────────────

    fn emit(&self, event: ChannelEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn emit_error(&self, err: ChannelError) {
        self.emit(ChannelEvent::Error(Arc::new(err)));
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        for (_, timer) in self.shared.get_mut().timers.drain() {
            timer.handle.abort();
        }
    }
}
