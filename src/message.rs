//! Message storage: in-flight QoS1/QoS2 payloads keyed by GUID plus the
//! retained-message index keyed by topic.

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{ClientId, DashMap, MsgId, StoredMessage, TopicName};
use crate::Result;

#[async_trait]
pub trait MessageStore: Sync + Send {
    ///Assigns a fresh GUID and persists the message. Fails only on
    ///underlying storage error.
    async fn store_publish_for_future(&self, msg: StoredMessage) -> Result<MsgId>;

    async fn get_message(&self, msg_id: &MsgId) -> Option<StoredMessage>;

    ///Sets the retained pointer for the topic.
    async fn store_retained(&self, topic: &TopicName, msg_id: &MsgId) -> Result<()>;

    ///Removes the retained pointer for the topic.
    async fn clean_retained(&self, topic: &TopicName);

    ///All retained messages whose topic satisfies the predicate. A linear
    ///scan over the retained index is permitted.
    async fn search_matching(&self, predicate: &(dyn for<'r> Fn(&'r str) -> bool + Sync)) -> Vec<StoredMessage>;

    ///Erases stored messages published by this client that are not
    ///referenced as retained.
    async fn drop_messages_in_session(&self, client_id: &ClientId);
}

pub struct DefaultMessageStore {
    messages: DashMap<MsgId, StoredMessage>,
    retained: DashMap<TopicName, MsgId>,
}

impl Default for DefaultMessageStore {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultMessageStore {
    #[inline]
    pub fn new() -> Self {
        Self { messages: DashMap::default(), retained: DashMap::default() }
    }

    #[inline]
    fn next_guid() -> MsgId {
        MsgId::from(Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_owned())
    }

    #[inline]
    pub fn messages_count(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

#[async_trait]
impl MessageStore for DefaultMessageStore {
    #[inline]
    async fn store_publish_for_future(&self, mut msg: StoredMessage) -> Result<MsgId> {
        let msg_id = Self::next_guid();
        msg.msg_id = msg_id.clone();
        log::debug!("store publish for future, guid: {}, topic: {}", msg_id, msg.topic);
        self.messages.insert(msg_id.clone(), msg);
        Ok(msg_id)
    }

    #[inline]
    async fn get_message(&self, msg_id: &MsgId) -> Option<StoredMessage> {
        self.messages.get(msg_id).map(|e| e.value().clone())
    }

    #[inline]
    async fn store_retained(&self, topic: &TopicName, msg_id: &MsgId) -> Result<()> {
        self.retained.insert(topic.clone(), msg_id.clone());
        Ok(())
    }

    #[inline]
    async fn clean_retained(&self, topic: &TopicName) {
        self.retained.remove(topic);
    }

    #[inline]
    async fn search_matching(&self, predicate: &(dyn for<'r> Fn(&'r str) -> bool + Sync)) -> Vec<StoredMessage> {
        self.retained
            .iter()
            .filter(|e| predicate(e.key()))
            .filter_map(|e| self.messages.get(e.value()).map(|m| m.value().clone()))
            .collect()
    }

    #[inline]
    async fn drop_messages_in_session(&self, client_id: &ClientId) {
        let retained_guids =
            self.retained.iter().map(|e| e.value().clone()).collect::<std::collections::HashSet<_>>();
        self.messages.retain(|msg_id, msg| &msg.client_id != client_id || retained_guids.contains(msg_id));
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::Bytes;

    use super::*;
    use crate::topic::Topic;
    use crate::types::QoS;

    fn stored(client_id: &str, topic: &str, payload: &'static [u8], qos: QoS) -> StoredMessage {
        StoredMessage {
            msg_id: MsgId::default(),
            client_id: ClientId::from(client_id),
            topic: TopicName::from(topic),
            payload: Bytes::from_static(payload),
            qos,
            retain: false,
            packet_id: None,
            create_time: chrono::Local::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn store_assigns_guid() {
        let store = DefaultMessageStore::new();
        let g1 = store.store_publish_for_future(stored("c1", "a/b", b"x", QoS::AtLeastOnce)).await.unwrap();
        let g2 = store.store_publish_for_future(stored("c1", "a/b", b"y", QoS::AtLeastOnce)).await.unwrap();
        assert_ne!(g1, g2);
        assert_eq!(g1.len(), 32);
        assert_eq!(store.get_message(&g1).await.unwrap().payload.as_ref(), b"x");
    }

    #[tokio::test]
    async fn retained_search_and_clean() {
        let store = DefaultMessageStore::new();
        let g = store.store_publish_for_future(stored("c1", "a/b", b"x", QoS::AtLeastOnce)).await.unwrap();
        store.store_retained(&TopicName::from("a/b"), &g).await.unwrap();

        let filter = Topic::from_str("a/+").unwrap();
        let found = store.search_matching(&|t| filter.matches_str(t)).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic, TopicName::from("a/b"));

        store.clean_retained(&TopicName::from("a/b")).await;
        assert!(store.search_matching(&|t| filter.matches_str(t)).await.is_empty());
    }

    #[tokio::test]
    async fn drop_in_session_spares_retained() {
        let store = DefaultMessageStore::new();
        let g1 = store.store_publish_for_future(stored("c1", "a/b", b"x", QoS::AtLeastOnce)).await.unwrap();
        let g2 = store.store_publish_for_future(stored("c1", "a/c", b"y", QoS::AtLeastOnce)).await.unwrap();
        let g3 = store.store_publish_for_future(stored("c2", "a/d", b"z", QoS::AtLeastOnce)).await.unwrap();
        store.store_retained(&TopicName::from("a/b"), &g1).await.unwrap();

        store.drop_messages_in_session(&ClientId::from("c1")).await;

        //g1 is retained, g3 belongs to another client, only g2 goes away
        assert!(store.get_message(&g1).await.is_some());
        assert!(store.get_message(&g2).await.is_none());
        assert!(store.get_message(&g3).await.is_some());
    }
}
