//! The multiplexer.
//!
//! Two tables sit behind one lock: tracked channels, and connection records
//! keyed by thread then channel. Every tracked channel gets a consumer task
//! that turns its occurrences into table updates. The lock is never held
//! across an await.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::Value;
use tether_channel::{Channel, ChannelError, ChannelEvent};
use tether_core::{
    ChannelId, ConnectBody, DisconnectBody, EventBody, RegisterBody, RejectBody, ThreadUid,
    reject_code,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthOutcome, Authenticator};
use crate::errors::BrokerError;
use crate::event::BrokerEvent;

/// Capacity of the broker event stream.
const EVENT_CAPACITY: usize = 1024;

/// Bookkeeping for one `(thread, channel)` subscription.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionRecord {
    /// The channel reached the connected state for the thread.
    pub connected: bool,
    /// Metadata from the authenticator or the caller.
    pub info: Option<Value>,
}

struct ChannelRecord {
    channel: Arc<Channel>,
    /// Consecutive failed deliveries.
    health: u32,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Tables {
    channels: HashMap<ChannelId, ChannelRecord>,
    connections: HashMap<ThreadUid, HashMap<ChannelId, ConnectionRecord>>,
}

impl Tables {
    fn remove_record(&mut self, uid: &ThreadUid, channel_id: &ChannelId) -> Option<ConnectionRecord> {
        let records = self.connections.get_mut(uid)?;
        let removed = records.remove(channel_id);
        if records.is_empty() {
            let _ = self.connections.remove(uid);
        }
        removed
    }
}

/// Publish request.
#[derive(Clone, Debug)]
pub struct BroadcastRequest {
    /// Event to deliver. Its `uid` selects the thread.
    pub body: EventBody,
    /// Deliver only to these channels.
    pub whitelist: Option<HashSet<ChannelId>>,
    /// Never deliver to these channels.
    pub blacklist: Option<HashSet<ChannelId>>,
}

impl BroadcastRequest {
    /// Deliver to every channel bound to the event's thread.
    pub fn new(body: EventBody) -> Self {
        Self {
            body,
            whitelist: None,
            blacklist: None,
        }
    }

    /// Restrict delivery to `ids`.
    #[must_use]
    pub fn only(mut self, ids: impl IntoIterator<Item = ChannelId>) -> Self {
        self.whitelist = Some(ids.into_iter().collect());
        self
    }

    /// Exclude `ids` from delivery.
    #[must_use]
    pub fn except(mut self, ids: impl IntoIterator<Item = ChannelId>) -> Self {
        self.blacklist = Some(ids.into_iter().collect());
        self
    }

    fn admits(&self, id: &ChannelId) -> bool {
        self.whitelist.as_ref().is_none_or(|w| w.contains(id))
            && self.blacklist.as_ref().is_none_or(|b| !b.contains(id))
    }
}

struct Inner {
    tables: Mutex<Tables>,
    authenticator: Arc<dyn Authenticator>,
    events: broadcast::Sender<BrokerEvent>,
    shutdown: CancellationToken,
}

/// Maps threads to the channels subscribed to them. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.channel_count())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// New broker admitting registrations through `authenticator`.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                authenticator,
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Stream of broker occurrences.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop every channel consumer. Tables are left as they are.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    // ── channels ────────────────────────────────────────────────────────

    /// Start tracking `channel`. Returns `false` if its id is already
    /// tracked.
    pub fn add_channel(&self, channel: Arc<Channel>) -> bool {
        let id = channel.id().clone();
        let (events, cancel) = {
            let mut tables = self.inner.tables.lock();
            if tables.channels.contains_key(&id) {
                warn!(channel_id = %id, "channel already tracked");
                return false;
            }
            let events = channel.subscribe();
            let cancel = self.inner.shutdown.child_token();
            let _ = tables.channels.insert(
                id.clone(),
                ChannelRecord {
                    channel: channel.clone(),
                    health: 0,
                    cancel: cancel.clone(),
                },
            );
            (events, cancel)
        };
        gauge!("broker_channels_active").increment(1.0);
        info!(channel_id = %id, "channel tracked");
        drop(tokio::spawn(self.clone().consume(channel, events, cancel)));
        true
    }

    /// Stop tracking a channel and drop every connection record referring
    /// to it. Returns how many records were dropped.
    pub fn remove_channel(&self, channel_id: &ChannelId) -> usize {
        let (tracked, removed) = {
            let mut tables = self.inner.tables.lock();
            let tracked = tables.channels.remove(channel_id);
            let mut removed = 0;
            tables.connections.retain(|_, records| {
                if records.remove(channel_id).is_some() {
                    removed += 1;
                }
                !records.is_empty()
            });
            (tracked, removed)
        };
        if let Some(record) = tracked {
            record.cancel.cancel();
            gauge!("broker_channels_active").decrement(1.0);
            info!(channel_id = %channel_id, connections = removed, "channel untracked");
        }
        removed
    }

    /// Whether `channel_id` is tracked.
    pub fn has_channel(&self, channel_id: &ChannelId) -> bool {
        self.inner.tables.lock().channels.contains_key(channel_id)
    }

    /// A tracked channel.
    pub fn channel(&self, channel_id: &ChannelId) -> Option<Arc<Channel>> {
        self.inner
            .tables
            .lock()
            .channels
            .get(channel_id)
            .map(|r| r.channel.clone())
    }

    /// Number of tracked channels.
    pub fn channel_count(&self) -> usize {
        self.inner.tables.lock().channels.len()
    }

    /// Ids of all tracked channels.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.inner.tables.lock().channels.keys().cloned().collect()
    }

    /// Consecutive failed deliveries to a channel.
    pub fn channel_health(&self, channel_id: &ChannelId) -> Option<u32> {
        self.inner
            .tables
            .lock()
            .channels
            .get(channel_id)
            .map(|r| r.health)
    }

    // ── connections ─────────────────────────────────────────────────────

    /// Subscribe a tracked channel to `uid`, starting the handshake from
    /// this side. Returns the sequence number of the connect frame.
    pub async fn add_connection(
        &self,
        uid: ThreadUid,
        channel_id: &ChannelId,
        info: Option<Value>,
    ) -> Result<u64, BrokerError> {
        let channel = self
            .channel(channel_id)
            .ok_or_else(|| BrokerError::UnknownChannel(channel_id.clone()))?;
        self.admit(&channel, uid, info, None).await
    }

    /// Drop the record for the pair and start the disconnect handshake.
    pub async fn remove_connection(
        &self,
        uid: &ThreadUid,
        channel_id: &ChannelId,
    ) -> Result<Option<u64>, BrokerError> {
        let channel = {
            let mut tables = self.inner.tables.lock();
            if tables.remove_record(uid, channel_id).is_none() {
                return Err(BrokerError::NotConnected {
                    uid: uid.clone(),
                    channel_id: channel_id.clone(),
                });
            }
            tables.channels.get(channel_id).map(|r| r.channel.clone())
        };
        let channel = channel.ok_or_else(|| BrokerError::UnknownChannel(channel_id.clone()))?;
        debug!(channel_id = %channel_id, %uid, "removing connection");
        Ok(channel.disconnect(DisconnectBody::new(uid.clone())).await?)
    }

    /// Metadata stored for the pair.
    pub fn local_connection_info(&self, uid: &ThreadUid, channel_id: &ChannelId) -> Option<Value> {
        self.inner
            .tables
            .lock()
            .connections
            .get(uid)?
            .get(channel_id)?
            .info
            .clone()
    }

    /// Record for the pair.
    pub fn connection(&self, uid: &ThreadUid, channel_id: &ChannelId) -> Option<ConnectionRecord> {
        self.inner
            .tables
            .lock()
            .connections
            .get(uid)?
            .get(channel_id)
            .cloned()
    }

    /// Number of records (pending or connected) under `uid`.
    pub fn connection_count(&self, uid: &ThreadUid) -> usize {
        self.inner
            .tables
            .lock()
            .connections
            .get(uid)
            .map_or(0, HashMap::len)
    }

    /// Insert a pending record, then start the handshake. The record exists
    /// before the connect frame leaves so the echo always finds it.
    async fn admit(
        &self,
        channel: &Arc<Channel>,
        uid: ThreadUid,
        info: Option<Value>,
        req: Option<u64>,
    ) -> Result<u64, BrokerError> {
        let channel_id = channel.id().clone();
        {
            let mut tables = self.inner.tables.lock();
            let records = tables.connections.entry(uid.clone()).or_default();
            if records.contains_key(&channel_id) {
                return Err(BrokerError::AlreadyConnected { uid, channel_id });
            }
            let _ = records.insert(
                channel_id.clone(),
                ConnectionRecord {
                    connected: false,
                    info,
                },
            );
        }

        let mut body = ConnectBody::new(uid.clone());
        body.req = req;
        match channel.connect(body).await {
            Ok(seq) => {
                debug!(channel_id = %channel_id, %uid, seq, "connection pending");
                Ok(seq)
            }
            Err(err) => {
                let mut tables = self.inner.tables.lock();
                if tables
                    .connections
                    .get(&uid)
                    .and_then(|r| r.get(&channel_id))
                    .is_some_and(|r| !r.connected)
                {
                    let _ = tables.remove_record(&uid, &channel_id);
                }
                Err(err.into())
            }
        }
    }

    // ── broadcast ───────────────────────────────────────────────────────

    /// Deliver `request.body` to every channel connected to its thread.
    ///
    /// Deliveries run concurrently and fail independently. Failures are
    /// published as [`BrokerEvent::Error`]. Returns the ids that accepted
    /// the event, sorted.
    #[instrument(skip_all, fields(uid = %request.body.uid, kind = %request.body.kind))]
    pub async fn broadcast(&self, request: BroadcastRequest) -> Vec<ChannelId> {
        let uid = request.body.uid.clone();
        let targets: Vec<(ChannelId, Arc<Channel>)> = {
            let mut guard = self.inner.tables.lock();
            let Tables {
                channels,
                connections,
            } = &mut *guard;
            let Some(records) = connections.get_mut(&uid) else {
                debug!("no connections for thread");
                return Vec::new();
            };
            records.retain(|id, _| {
                let tracked = channels.contains_key(id);
                if !tracked {
                    debug!(channel_id = %id, "pruning record of untracked channel");
                }
                tracked
            });
            let targets = records
                .iter()
                .filter(|(id, record)| record.connected && request.admits(id))
                .filter_map(|(id, _)| channels.get(id).map(|c| (id.clone(), c.channel.clone())))
                .collect();
            if records.is_empty() {
                let _ = connections.remove(&uid);
            }
            targets
        };

        let results = join_all(targets.into_iter().map(|(id, channel)| {
            let body = request.body.clone();
            async move {
                let result = channel.event(body).await;
                (id, result)
            }
        }))
        .await;

        let mut delivered = Vec::new();
        let mut failed: Vec<(ChannelId, ChannelError)> = Vec::new();
        {
            let mut tables = self.inner.tables.lock();
            for (id, result) in results {
                let record = tables.channels.get_mut(&id);
                match result {
                    Ok(_) => {
                        if let Some(record) = record {
                            record.health = 0;
                        }
                        delivered.push(id);
                    }
                    Err(err) => {
                        if let Some(record) = record {
                            record.health = record.health.saturating_add(1);
                        }
                        failed.push((id, err));
                    }
                }
            }
        }

        counter!("broker_broadcast_deliveries_total").increment(delivered.len() as u64);
        counter!("broker_broadcast_failures_total").increment(failed.len() as u64);
        for (channel_id, err) in failed {
            warn!(channel_id = %channel_id, error = %err, "broadcast delivery failed");
            self.publish(BrokerEvent::Error {
                channel_id,
                error: Arc::new(err),
            });
        }
        delivered.sort();
        debug!(delivered = delivered.len(), "broadcast done");
        delivered
    }

    // ── occurrence handling ─────────────────────────────────────────────

    async fn consume(
        self,
        channel: Arc<Channel>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.dispatch(&channel, event).await,
                    None => break,
                },
            }
        }
        debug!(channel_id = %channel.id(), "channel consumer stopped");
    }

    async fn dispatch(&self, channel: &Arc<Channel>, event: ChannelEvent) {
        let channel_id = channel.id().clone();
        match event {
            ChannelEvent::Register { body, seq } => self.on_register(channel, body, seq).await,
            ChannelEvent::Connect { uid, .. } => self.on_connect(channel, uid).await,
            ChannelEvent::Disconnect { uid, .. } => {
                if self.inner.tables.lock().remove_record(&uid, &channel_id).is_some() {
                    info!(channel_id = %channel_id, %uid, "subscription ended");
                    self.publish(BrokerEvent::Disconnected { uid, channel_id });
                }
            }
            ChannelEvent::ConnectFail { uid, .. } => {
                if self.inner.tables.lock().remove_record(&uid, &channel_id).is_some() {
                    info!(channel_id = %channel_id, %uid, "subscription never completed");
                }
            }
            ChannelEvent::Action { body, seq } => {
                self.publish(BrokerEvent::Action {
                    channel_id,
                    body,
                    seq,
                });
            }
            ChannelEvent::Answer { body, seq } => {
                self.publish(BrokerEvent::Answer {
                    channel_id,
                    body,
                    seq,
                });
            }
            ChannelEvent::Reject { body, seq } => {
                self.publish(BrokerEvent::Reject {
                    channel_id,
                    body,
                    seq,
                });
            }
            ChannelEvent::Close { .. } => {
                let _ = self.remove_channel(&channel_id);
            }
            ChannelEvent::Error(error) => {
                self.publish(BrokerEvent::Error { channel_id, error });
            }
        }
    }

    async fn on_register(&self, channel: &Arc<Channel>, body: RegisterBody, seq: u64) {
        let channel_id = channel.id();
        if !self.has_channel(channel_id) {
            refuse(channel, seq, "channel is not tracked".into()).await;
            return;
        }
        let request = channel.request_info().cloned().unwrap_or_default();
        match self.inner.authenticator.authenticate(&request, &body).await {
            AuthOutcome::Accepted { thread, info } => {
                info!(channel_id = %channel_id, uid = %thread, kind = %body.kind, "registration accepted");
                if let Err(err) = self.admit(channel, thread, info, Some(seq)).await {
                    warn!(channel_id = %channel_id, error = %err, "failed to admit registration");
                    let reason = err.to_string();
                    match err {
                        BrokerError::Channel(err) => self.publish(BrokerEvent::Error {
                            channel_id: channel_id.clone(),
                            error: Arc::new(err),
                        }),
                        _ => refuse(channel, seq, reason).await,
                    }
                }
            }
            AuthOutcome::Rejected { reason } => {
                info!(channel_id = %channel_id, kind = %body.kind, %reason, "registration rejected");
                refuse(channel, seq, reason).await;
            }
        }
    }

    async fn on_connect(&self, channel: &Arc<Channel>, uid: ThreadUid) {
        let channel_id = channel.id().clone();
        let known = {
            let mut tables = self.inner.tables.lock();
            let tracked = tables.channels.contains_key(&channel_id);
            match tables
                .connections
                .get_mut(&uid)
                .and_then(|r| r.get_mut(&channel_id))
            {
                Some(record) if tracked => {
                    record.connected = true;
                    true
                }
                _ => false,
            }
        };
        if known {
            info!(channel_id = %channel_id, %uid, "subscription connected");
            self.publish(BrokerEvent::Connected { uid, channel_id });
            return;
        }
        info!(channel_id = %channel_id, %uid, "refusing connect without a pending record");
        if let Err(err) = channel.disconnect(DisconnectBody::new(uid)).await {
            warn!(channel_id = %channel_id, error = %err, "failed to refuse connect");
            self.publish(BrokerEvent::Error {
                channel_id,
                error: Arc::new(err),
            });
        }
    }

    fn publish(&self, event: BrokerEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }
}

async fn refuse(channel: &Channel, seq: u64, reason: String) {
    let body = RejectBody::new(seq, reject_code::FORBIDDEN, reason);
    if let Err(err) = channel.reject(body).await {
        warn!(channel_id = %channel.id(), error = %err, "failed to send reject");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OpenAuthenticator;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tether_channel::memory::{MemoryTransport, link};
    use tether_channel::{ChannelConfig, RequestInfo, TransportEvent, worker};
    use tether_core::{Frame, FrameBody};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Refusing;

    #[async_trait]
    impl Authenticator for Refusing {
        async fn authenticate(&self, _: &RequestInfo, _: &RegisterBody) -> AuthOutcome {
            AuthOutcome::reject("bad credentials")
        }
    }

    fn broker() -> Broker {
        Broker::new(Arc::new(OpenAuthenticator))
    }

    fn server_channel() -> (Arc<Channel>, Arc<MemoryTransport>, UnboundedReceiver<String>) {
        let (transport, wire) = MemoryTransport::new();
        let channel = Channel::server(
            ChannelId::new(),
            transport.clone(),
            RequestInfo::default(),
            ChannelConfig::default(),
        );
        (channel, transport, wire)
    }

    async fn next_frame(wire: &mut UnboundedReceiver<String>) -> Frame {
        let text = tokio::time::timeout(Duration::from_secs(5), wire.recv())
            .await
            .expect("frame in time")
            .expect("wire open");
        Frame::decode(&text).unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<BrokerEvent>) -> BrokerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("stream open")
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    /// Subscribe `channel` to `uid` through the broker and play the peer's
    /// echo.
    async fn bind(
        broker: &Broker,
        events: &mut broadcast::Receiver<BrokerEvent>,
        channel: &Arc<Channel>,
        wire: &mut UnboundedReceiver<String>,
        uid: &str,
    ) {
        let _ = broker
            .add_connection(ThreadUid::from(uid), channel.id(), None)
            .await
            .unwrap();
        let sent = next_frame(wire).await;
        let echo = Frame::new(
            sent.seq + 1,
            FrameBody::Connect(ConnectBody::new(uid).replying_to(sent.seq)),
        );
        channel.handle_message(&echo.encode().unwrap()).await;
        assert_matches!(
            next_event(events).await,
            BrokerEvent::Connected { uid: ref u, .. } if u.as_str() == uid
        );
    }

    #[tokio::test]
    async fn duplicate_channels_are_refused() {
        let broker = broker();
        let (channel, _t, _w) = server_channel();
        assert!(broker.add_channel(channel.clone()));
        assert!(!broker.add_channel(channel));
        assert_eq!(broker.channel_count(), 1);
    }

    #[tokio::test]
    async fn add_connection_validates_pair() {
        let broker = broker();
        let (channel, _t, _wire) = server_channel();
        let err = broker
            .add_connection(ThreadUid::from("t"), channel.id(), None)
            .await
            .unwrap_err();
        assert_matches!(err, BrokerError::UnknownChannel(_));

        let _ = broker.add_channel(channel.clone());
        let _ = broker
            .add_connection(ThreadUid::from("t"), channel.id(), Some(json!({"n": 1})))
            .await
            .unwrap();
        let record = broker.connection(&ThreadUid::from("t"), channel.id()).unwrap();
        assert!(!record.connected);
        assert_eq!(
            broker.local_connection_info(&ThreadUid::from("t"), channel.id()),
            Some(json!({"n": 1}))
        );

        let err = broker
            .add_connection(ThreadUid::from("t"), channel.id(), None)
            .await
            .unwrap_err();
        assert_matches!(err, BrokerError::AlreadyConnected { .. });
    }

    #[tokio::test]
    async fn failed_connect_drops_pending_record() {
        let broker = broker();
        let (channel, transport, _wire) = server_channel();
        let _ = broker.add_channel(channel.clone());
        transport.set_failing(true);

        let err = broker
            .add_connection(ThreadUid::from("t"), channel.id(), None)
            .await
            .unwrap_err();
        assert_matches!(err, BrokerError::Channel(_));
        assert_eq!(broker.connection_count(&ThreadUid::from("t")), 0);
    }

    #[tokio::test]
    async fn remove_connection_requires_record() {
        let broker = broker();
        let mut events = broker.subscribe();
        let (channel, _t, mut wire) = server_channel();
        let _ = broker.add_channel(channel.clone());

        let err = broker
            .remove_connection(&ThreadUid::from("t"), channel.id())
            .await
            .unwrap_err();
        assert_matches!(err, BrokerError::NotConnected { .. });

        bind(&broker, &mut events, &channel, &mut wire, "t").await;
        let seq = broker
            .remove_connection(&ThreadUid::from("t"), channel.id())
            .await
            .unwrap();
        assert!(seq.is_some());
        assert_matches!(next_frame(&mut wire).await.body, FrameBody::Disconnect(_));
        assert_eq!(broker.connection_count(&ThreadUid::from("t")), 0);
    }

    #[tokio::test]
    async fn broadcast_tolerates_partial_failure() {
        let broker = broker();
        let mut events = broker.subscribe();
        let mut channels = Vec::new();
        for _ in 0..3 {
            let (channel, transport, mut wire) = server_channel();
            let _ = broker.add_channel(channel.clone());
            bind(&broker, &mut events, &channel, &mut wire, "T").await;
            channels.push((channel, transport, wire));
        }
        channels[1].1.set_failing(true);

        let delivered = broker
            .broadcast(BroadcastRequest::new(EventBody::new("T", "ping", json!({}))))
            .await;

        let mut expected = vec![channels[0].0.id().clone(), channels[2].0.id().clone()];
        expected.sort();
        assert_eq!(delivered, expected);
        assert_matches!(
            next_event(&mut events).await,
            BrokerEvent::Error { ref channel_id, .. } if channel_id == channels[1].0.id()
        );
        assert_eq!(broker.channel_health(channels[1].0.id()), Some(1));
        assert_eq!(broker.channel_health(channels[0].0.id()), Some(0));
    }

    #[tokio::test]
    async fn broadcast_honours_lists_and_skips_pending() {
        let broker = broker();
        let mut events = broker.subscribe();
        let (a, _ta, mut wa) = server_channel();
        let (b, _tb, mut wb) = server_channel();
        let (c, _tc, _wc) = server_channel();
        for ch in [&a, &b, &c] {
            let _ = broker.add_channel(ch.clone());
        }
        bind(&broker, &mut events, &a, &mut wa, "T").await;
        bind(&broker, &mut events, &b, &mut wb, "T").await;
        // c never echoes
        let _ = broker
            .add_connection(ThreadUid::from("T"), c.id(), None)
            .await
            .unwrap();

        let body = EventBody::new("T", "ping", json!(null));
        let all = broker.broadcast(BroadcastRequest::new(body.clone())).await;
        assert_eq!(all.len(), 2);
        assert!(!all.contains(c.id()));

        let only_a = broker
            .broadcast(BroadcastRequest::new(body.clone()).only([a.id().clone()]))
            .await;
        assert_eq!(only_a, vec![a.id().clone()]);

        let not_a = broker
            .broadcast(BroadcastRequest::new(body).except([a.id().clone()]))
            .await;
        assert_eq!(not_a, vec![b.id().clone()]);
    }

    #[tokio::test]
    async fn close_cascades_cleanup() {
        let broker = broker();
        let mut events = broker.subscribe();
        let (channel, _t, mut wire) = server_channel();
        let (other, _to, _wo) = server_channel();
        let _ = broker.add_channel(channel.clone());
        let _ = broker.add_channel(other);
        bind(&broker, &mut events, &channel, &mut wire, "A").await;
        bind(&broker, &mut events, &channel, &mut wire, "B").await;
        assert_eq!(broker.channel_count(), 2);

        channel.handle_close(1000, "bye");

        let b = broker.clone();
        eventually(move || b.channel_count() == 1).await;
        assert_eq!(broker.connection_count(&ThreadUid::from("A")), 0);
        assert_eq!(broker.connection_count(&ThreadUid::from("B")), 0);
        assert!(!broker.has_channel(channel.id()));
    }

    #[tokio::test]
    async fn remove_channel_counts_records() {
        let broker = broker();
        let mut events = broker.subscribe();
        let (channel, _t, mut wire) = server_channel();
        let _ = broker.add_channel(channel.clone());
        bind(&broker, &mut events, &channel, &mut wire, "A").await;
        let _ = broker
            .add_connection(ThreadUid::from("B"), channel.id(), None)
            .await
            .unwrap();

        assert_eq!(broker.remove_channel(channel.id()), 2);
        assert_eq!(broker.channel_count(), 0);
        assert_eq!(broker.remove_channel(channel.id()), 0);
    }

    #[tokio::test]
    async fn unsolicited_connect_is_refused() {
        let broker = broker();
        let (channel, _t, mut wire) = server_channel();
        let _ = broker.add_channel(channel.clone());

        // handshake started behind the broker's back
        let _ = channel.connect(ConnectBody::new("rogue")).await.unwrap();
        let sent = next_frame(&mut wire).await;
        let echo = Frame::new(
            sent.seq + 1,
            FrameBody::Connect(ConnectBody::new("rogue").replying_to(sent.seq)),
        );
        channel.handle_message(&echo.encode().unwrap()).await;

        assert_matches!(next_frame(&mut wire).await.body, FrameBody::Disconnect(ref b) if b.uid.as_str() == "rogue");
        assert_eq!(broker.connection_count(&ThreadUid::from("rogue")), 0);
    }

    #[tokio::test]
    async fn rejected_registration_gets_forbidden() {
        let broker = Broker::new(Arc::new(Refusing));
        let (channel, _t, mut wire) = server_channel();
        let _ = broker.add_channel(channel.clone());

        let register = Frame::new(1, FrameBody::Register(RegisterBody::new("default")));
        channel.handle_message(&register.encode().unwrap()).await;

        assert_matches!(
            next_frame(&mut wire).await.body,
            FrameBody::Reject(RejectBody { req: 1, code: 403, ref reason, .. }) if reason == "bad credentials"
        );
        assert_eq!(broker.connection_count(&ThreadUid::from("default")), 0);
    }

    #[tokio::test]
    async fn register_connect_broadcast_round_trip() {
        let broker = broker();
        let mut events = broker.subscribe();

        let (server_transport, server_wire) = MemoryTransport::new();
        let (client_transport, client_wire) = MemoryTransport::new();
        let server = Channel::server(
            ChannelId::from("c1"),
            server_transport,
            RequestInfo::default(),
            ChannelConfig::default(),
        );
        let client = Channel::client(ChannelId::new(), client_transport, ChannelConfig::default());
        let (server_tx, server_rx) = mpsc::channel::<TransportEvent>(16);
        let (client_tx, client_rx) = mpsc::channel::<TransportEvent>(16);
        let _ = link(server_wire, client_tx);
        let _ = link(client_wire, server_tx);
        let _ = worker::spawn(server.clone(), server_rx);
        let _ = worker::spawn(client.clone(), client_rx);
        let mut client_events = client.subscribe();

        assert!(broker.add_channel(server.clone()));
        let _ = client.register(RegisterBody::new("default")).await.unwrap();

        assert_matches!(
            next_event(&mut events).await,
            BrokerEvent::Connected { ref uid, ref channel_id }
                if uid.as_str() == "default" && channel_id.as_str() == "c1"
        );
        assert!(client.is_connected_to(&ThreadUid::from("default")));

        let delivered = broker
            .broadcast(BroadcastRequest::new(EventBody::new("default", "ping", json!({}))))
            .await;
        assert_eq!(delivered, vec![ChannelId::from("c1")]);

        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), client_events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ChannelEvent::Action { body, .. } = ev {
                assert_eq!(body.kind, "ping");
                break;
            }
        }

        // inbound events surface on the broker stream
        let _ = client
            .event(EventBody::new("default", "pong", json!(1)))
            .await
            .unwrap();
        assert_matches!(
            next_event(&mut events).await,
            BrokerEvent::Action { ref body, .. } if body.kind == "pong"
        );
    }
}
