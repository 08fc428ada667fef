use std::sync::Arc;

use itertools::Itertools;

use crate::inflight::InflightMessage;
use crate::message::MessageStore;
use crate::registry::ConnectionRegistry;
use crate::session::{ClientSession, EnqueuedMessage, SessionStore};
use crate::types::{ClientId, MsgId, Packet, PacketId, QoS, StoredMessage, Subscription};

///Downstream fan-out. Delivery to one recipient goes through that
///recipient's session for packet id allocation and inflight tracking;
///recipients without a writable channel get the message parked on the
///session queue instead.
pub struct MessagesPublisher {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
}

impl MessagesPublisher {
    #[inline]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self { registry, sessions, messages }
    }

    ///Collapses the match list per client keeping the highest requested
    ///QoS, then delivers at min(publisher QoS, requested QoS).
    pub async fn publish_to_subscribers(&self, msg: &StoredMessage, subscriptions: &[Subscription]) {
        let grouped = subscriptions
            .iter()
            .map(|s| (s.client_id.clone(), s.qos))
            .into_grouping_map()
            .max();

        for (client_id, requested) in grouped {
            let qos = msg.qos.less_value(requested);
            self.send_publish(&client_id, msg, qos, false, false).await;
        }
    }

    ///Replays session-stored QoS1/QoS2 messages on reconnect with a
    ///persistent session, in their original order.
    pub async fn publish_stored(&self, session: &ClientSession, stored: Vec<(MsgId, QoS)>) {
        for (msg_id, qos) in stored {
            let msg = match self.messages.get_message(&msg_id).await {
                Some(msg) => msg,
                None => {
                    log::warn!("{:?} stored message is gone, guid: {}", session.client_id(), msg_id);
                    continue;
                }
            };
            self.send_publish(session.client_id(), &msg, qos, false, true).await;
        }
    }

    ///Delivers retained matches to a fresh subscription at
    ///min(stored QoS, subscription QoS).
    pub async fn publish_retained(&self, client_id: &ClientId, retained: Vec<StoredMessage>, sub_qos: QoS) {
        for msg in retained {
            let qos = msg.qos.less_value(sub_qos);
            self.send_publish(client_id, &msg, qos, true, false).await;
        }
    }

    async fn send_publish(&self, client_id: &ClientId, msg: &StoredMessage, qos: QoS, retain: bool, dup: bool) {
        if let QoS::AtMostOnce = qos {
            //no packet id, no storage, dropped when the channel cannot take it
            if let Some(descriptor) = self.registry.get(client_id) {
                if descriptor.channel.is_writable() {
                    let publish = msg.to_publish(qos, None, retain, dup);
                    if let Err(e) = descriptor.channel.send(Packet::Publish(publish)) {
                        log::debug!("{:?} deliver dropped, {:?}", client_id, e);
                    }
                }
            }
            return;
        }

        let session = match self.sessions.session_for_client(client_id).await {
            Some(session) => session,
            None => {
                log::debug!("{:?} no session for recipient, message dropped", client_id);
                return;
            }
        };

        let packet_id = match session.next_packet_id() {
            Ok(packet_id) => packet_id,
            Err(e) => {
                log::warn!("{:?} packet id allocation failed, {:?}", client_id, e);
                return;
            }
        };
        session.inflight_push(packet_id, InflightMessage::new(msg.msg_id.clone(), qos));

        let descriptor = self.registry.get(client_id);
        let writable = descriptor.as_ref().map(|d| d.channel.is_writable()).unwrap_or(false);
        if writable {
            let publish = msg.to_publish(qos, Some(packet_id), retain, dup);
            if let Some(descriptor) = descriptor {
                if let Err(e) = descriptor.channel.send(Packet::Publish(publish)) {
                    log::debug!("{:?} write failed, parking message, {:?}", client_id, e);
                    self.enqueue(&session, packet_id, msg.msg_id.clone(), qos);
                }
            }
        } else {
            //delivery resumes on reconnect or on the writable event
            self.enqueue(&session, packet_id, msg.msg_id.clone(), qos);
        }
    }

    #[inline]
    fn enqueue(&self, session: &ClientSession, packet_id: PacketId, msg_id: MsgId, qos: QoS) {
        if session.enqueue(EnqueuedMessage { packet_id, msg_id, qos }).is_err() {
            log::warn!("{:?} enqueued queue is full, message dropped", session.client_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::message::DefaultMessageStore;
    use crate::registry::ConnectionDescriptor;
    use crate::session::DefaultSessionStore;
    use crate::sink::mock;
    use crate::types::{Publish, TopicFilter, TopicName};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<DefaultSessionStore>,
        messages: Arc<DefaultMessageStore>,
        publisher: MessagesPublisher,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = Arc::new(DefaultSessionStore::new());
        let messages = Arc::new(DefaultMessageStore::new());
        let publisher =
            MessagesPublisher::new(registry.clone(), sessions.clone(), messages.clone());
        Fixture { registry, sessions, messages, publisher }
    }

    async fn connect(f: &Fixture, client_id: &str) -> (Arc<mock::MockSink>, ClientSession) {
        let (sink, channel) = mock::channel();
        channel.set_client_id(client_id.into());
        let descriptor =
            Arc::new(ConnectionDescriptor::new(client_id.into(), channel, false));
        assert!(f.registry.put_if_absent(descriptor).is_none());
        let session = f.sessions.create_new_session(client_id.into(), false).await.unwrap();
        (sink, session)
    }

    async fn stored(f: &Fixture, topic: &str, payload: &'static [u8], qos: QoS) -> StoredMessage {
        let publish = Publish {
            dup: false,
            retain: false,
            qos,
            topic: TopicName::from(topic),
            packet_id: None,
            payload: Bytes::from_static(payload),
        };
        let mut msg = StoredMessage::from_publish("pub".into(), &publish);
        let guid = f.messages.store_publish_for_future(msg.clone()).await.unwrap();
        msg.msg_id = guid;
        msg
    }

    fn subscription(client_id: &str, filter: &str, qos: QoS) -> Subscription {
        Subscription { client_id: client_id.into(), topic_filter: TopicFilter::from(filter), qos }
    }

    #[tokio::test]
    async fn duplicate_matches_collapse_to_highest_qos() {
        let f = fixture();
        let (sink, session) = connect(&f, "c1").await;
        let msg = stored(&f, "a/b", b"x", QoS::ExactlyOnce).await;

        //same client reached through two filters, only one delivery
        let subs =
            vec![subscription("c1", "a/+", QoS::AtMostOnce), subscription("c1", "a/b", QoS::AtLeastOnce)];
        f.publisher.publish_to_subscribers(&msg, &subs).await;

        let packets = sink.take_packets();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Publish(p) => {
                assert_eq!(p.qos, QoS::AtLeastOnce);
                assert_eq!(p.topic, TopicName::from("a/b"));
                assert!(p.packet_id.is_some());
            }
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(session.inflight_len(), 1);
    }

    #[tokio::test]
    async fn qos0_is_not_tracked() {
        let f = fixture();
        let (sink, session) = connect(&f, "c1").await;
        let msg = stored(&f, "a/b", b"x", QoS::AtMostOnce).await;

        f.publisher.publish_to_subscribers(&msg, &[subscription("c1", "a/b", QoS::ExactlyOnce)]).await;

        let packets = sink.take_packets();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Publish(p) => {
                assert_eq!(p.qos, QoS::AtMostOnce);
                assert!(p.packet_id.is_none());
            }
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(session.inflight_len(), 0);
    }

    #[tokio::test]
    async fn unwritable_channel_parks_message() {
        let f = fixture();
        let (sink, session) = connect(&f, "c1").await;
        sink.set_writable(false);
        let msg = stored(&f, "a/b", b"x", QoS::AtLeastOnce).await;

        f.publisher.publish_to_subscribers(&msg, &[subscription("c1", "a/b", QoS::AtLeastOnce)]).await;

        assert!(sink.take_packets().is_empty());
        assert_eq!(session.inflight_len(), 1);
        assert_eq!(session.enqueued_len(), 1);
    }

    #[tokio::test]
    async fn offline_recipient_parks_message() {
        let f = fixture();
        //session exists, no live connection
        let session = f.sessions.create_new_session("c1".into(), false).await.unwrap();
        let msg = stored(&f, "a/b", b"x", QoS::AtLeastOnce).await;

        f.publisher.publish_to_subscribers(&msg, &[subscription("c1", "a/b", QoS::AtLeastOnce)]).await;

        assert_eq!(session.enqueued_len(), 1);
        assert_eq!(session.inflight_len(), 1);
    }

    #[tokio::test]
    async fn publish_stored_sets_dup() {
        let f = fixture();
        let (sink, session) = connect(&f, "c1").await;
        let msg = stored(&f, "a/b", b"x", QoS::AtLeastOnce).await;

        f.publisher.publish_stored(&session, vec![(msg.msg_id.clone(), QoS::AtLeastOnce)]).await;

        let packets = sink.take_packets();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Publish(p) => assert!(p.dup),
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_retained_lowers_to_subscription_qos() {
        let f = fixture();
        let (sink, _session) = connect(&f, "c1").await;
        let msg = stored(&f, "a/b", b"x", QoS::ExactlyOnce).await;

        f.publisher.publish_retained(&"c1".into(), vec![msg], QoS::AtLeastOnce).await;

        let packets = sink.take_packets();
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Publish(p) => {
                assert!(p.retain);
                assert_eq!(p.qos, QoS::AtLeastOnce);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }
}
