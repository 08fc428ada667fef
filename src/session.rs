use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;

use crate::inflight::{Inflight, InflightMessage};
use crate::queue::Queue;
use crate::types::{ClientId, DashMap, HashMap, MsgId, PacketId, QoS, TimestampMillis, TopicFilter};
use crate::{MqttError, Result};

///Outbound message parked while the recipient has no writable channel.
///The packet id was already allocated and recorded in the inflight
///window.
#[derive(Debug, Clone)]
pub struct EnqueuedMessage {
    pub packet_id: PacketId,
    pub msg_id: MsgId,
    pub qos: QoS,
}

const ENQUEUED_MAX: usize = 1000;

#[derive(Clone)]
pub struct ClientSession(Arc<ClientSessionInner>);

pub struct ClientSessionInner {
    pub client_id: ClientId,
    clean_session: AtomicBool,
    subscriptions: RwLock<HashMap<TopicFilter, QoS>>,
    inflight: RwLock<Inflight>,
    enqueued: Queue<EnqueuedMessage>,
    pub created_at: TimestampMillis,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientSession {{ {:?}, clean_session: {}, subscriptions: {}, inflight: {}, enqueued: {} }}",
            self.0.client_id,
            self.clean_session(),
            self.0.subscriptions.read().len(),
            self.0.inflight.read().len(),
            self.0.enqueued.len()
        )
    }
}

impl ClientSession {
    #[inline]
    pub fn new(client_id: ClientId, clean_session: bool) -> Self {
        Self(Arc::new(ClientSessionInner {
            client_id,
            clean_session: AtomicBool::new(clean_session),
            subscriptions: RwLock::new(HashMap::default()),
            inflight: RwLock::new(Inflight::new()),
            enqueued: Queue::new(ENQUEUED_MAX),
            created_at: chrono::Local::now().timestamp_millis(),
        }))
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.0.client_id
    }

    #[inline]
    pub fn clean_session(&self) -> bool {
        self.0.clean_session.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_clean_session(&self, clean_session: bool) {
        self.0.clean_session.store(clean_session, Ordering::SeqCst);
    }

    ///Re-subscribing the same filter overwrites the QoS; returns the
    ///replaced value.
    #[inline]
    pub fn subscribe(&self, topic_filter: TopicFilter, qos: QoS) -> Option<QoS> {
        self.0.subscriptions.write().insert(topic_filter, qos)
    }

    #[inline]
    pub fn unsubscribe_from(&self, topic_filter: &TopicFilter) -> bool {
        self.0.subscriptions.write().remove(topic_filter).is_some()
    }

    #[inline]
    pub fn subscriptions(&self) -> Vec<(TopicFilter, QoS)> {
        self.0.subscriptions.read().iter().map(|(t, q)| (t.clone(), *q)).collect()
    }

    #[inline]
    pub fn subscriptions_count(&self) -> usize {
        self.0.subscriptions.read().len()
    }

    #[inline]
    pub fn wipe_subscriptions(&self) -> Vec<TopicFilter> {
        self.0.subscriptions.write().drain().map(|(t, _)| t).collect()
    }

    #[inline]
    pub fn next_packet_id(&self) -> Result<PacketId> {
        self.0.inflight.read().next_id()
    }

    #[inline]
    pub fn inflight_push(&self, packet_id: PacketId, m: InflightMessage) {
        self.0.inflight.write().push_back(packet_id, m);
    }

    #[inline]
    pub fn get_inflight_message(&self, packet_id: PacketId) -> Option<InflightMessage> {
        self.0.inflight.read().get(packet_id).cloned()
    }

    #[inline]
    pub fn in_flight_acknowledged(&self, packet_id: PacketId) -> Option<InflightMessage> {
        self.0.inflight.write().acknowledged(packet_id)
    }

    #[inline]
    pub fn move_in_flight_to_second_phase_ack_waiting(&self, packet_id: PacketId) -> bool {
        self.0.inflight.write().move_to_second_phase(packet_id)
    }

    #[inline]
    pub fn second_phase_acknowledged(&self, packet_id: PacketId) -> Option<InflightMessage> {
        self.0.inflight.write().second_phase_acknowledged(packet_id)
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.0.inflight.read().len()
    }

    #[inline]
    pub fn enqueue(&self, m: EnqueuedMessage) -> Result<(), EnqueuedMessage> {
        self.0.enqueued.push(m)
    }

    #[inline]
    pub fn dequeue(&self) -> Option<EnqueuedMessage> {
        self.0.enqueued.pop()
    }

    #[inline]
    pub fn enqueued_len(&self) -> usize {
        self.0.enqueued.len()
    }

    #[inline]
    pub fn remove_enqueued(&self, msg_id: &MsgId) {
        let mut keep = Vec::with_capacity(self.0.enqueued.len());
        while let Some(m) = self.0.enqueued.pop() {
            if &m.msg_id != msg_id {
                keep.push(m);
            }
        }
        for m in keep {
            let _ = self.0.enqueued.push(m);
        }
    }

    ///Drains the first-phase inflight window plus the enqueued queue, in
    ///send order, deduplicated by GUID. Used for republish on reconnect
    ///with a persistent session.
    #[inline]
    pub fn stored_messages(&self) -> Vec<(MsgId, QoS)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for m in self.0.inflight.write().drain() {
            if seen.insert(m.msg_id.clone()) {
                out.push((m.msg_id, m.qos));
            }
        }
        while let Some(m) = self.0.enqueued.pop() {
            if seen.insert(m.msg_id.clone()) {
                out.push((m.msg_id, m.qos));
            }
        }
        out
    }

    ///Wipes subscriptions, both inflight phases and the enqueued queue.
    #[inline]
    pub fn clean(&self) {
        log::debug!("{:?} clean session state", self.0.client_id);
        self.0.subscriptions.write().clear();
        self.0.inflight.write().clear();
        while self.0.enqueued.pop().is_some() {}
    }
}

#[async_trait]
pub trait SessionStore: Sync + Send {
    async fn session_for_client(&self, client_id: &ClientId) -> Option<ClientSession>;

    ///Fails if a session with this id already exists.
    async fn create_new_session(&self, client_id: ClientId, clean_session: bool) -> Result<ClientSession>;

    ///Removes every subscription from the session, returning the wiped
    ///filters so the caller can drop them from the matcher as well.
    async fn wipe_subscriptions(&self, client_id: &ClientId) -> Vec<TopicFilter>;

    async fn next_packet_id(&self, client_id: &ClientId) -> Result<PacketId>;

    async fn sessions_count(&self) -> usize;
}

pub struct DefaultSessionStore {
    sessions: DashMap<ClientId, ClientSession>,
}

impl Default for DefaultSessionStore {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultSessionStore {
    #[inline]
    pub fn new() -> Self {
        Self { sessions: DashMap::default() }
    }
}

#[async_trait]
impl SessionStore for DefaultSessionStore {
    #[inline]
    async fn session_for_client(&self, client_id: &ClientId) -> Option<ClientSession> {
        self.sessions.get(client_id).map(|e| e.value().clone())
    }

    #[inline]
    async fn create_new_session(&self, client_id: ClientId, clean_session: bool) -> Result<ClientSession> {
        match self.sessions.entry(client_id.clone()) {
            Entry::Occupied(_) => Err(MqttError::SessionAlreadyExists(client_id.to_string())),
            Entry::Vacant(v) => {
                log::debug!("{:?} create persistent session, clean_session: {}", client_id, clean_session);
                let session = ClientSession::new(client_id, clean_session);
                v.insert(session.clone());
                Ok(session)
            }
        }
    }

    #[inline]
    async fn wipe_subscriptions(&self, client_id: &ClientId) -> Vec<TopicFilter> {
        if let Some(session) = self.sessions.get(client_id) {
            session.wipe_subscriptions()
        } else {
            Vec::new()
        }
    }

    #[inline]
    async fn next_packet_id(&self, client_id: &ClientId) -> Result<PacketId> {
        self.sessions
            .get(client_id)
            .ok_or(MqttError::ServiceUnavailable)
            .and_then(|session| session.next_packet_id())
    }

    #[inline]
    async fn sessions_count(&self) -> usize {
        self.sessions.len()
    }
}
