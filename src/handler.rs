//! Inbound PUBLISH handling, one flow per QoS level.

use std::str::FromStr;
use std::sync::Arc;

use crate::auth::Authorizator;
use crate::hook::{InterceptMessage, InterceptorBus};
use crate::message::MessageStore;
use crate::publisher::MessagesPublisher;
use crate::sink::Channel;
use crate::topic::{Level, Topic};
use crate::trie::SubscriptionMatcher;
use crate::types::{ClientId, DashMap, MsgId, Packet, PacketId, Publish, StoredMessage};

pub struct PublishHandler {
    authorizator: Arc<dyn Authorizator>,
    matcher: Arc<SubscriptionMatcher>,
    messages: Arc<dyn MessageStore>,
    publisher: Arc<MessagesPublisher>,
    interceptor: Arc<InterceptorBus>,
    //QoS2 first phase, (receiver, packet id) => stored GUID until PUBREL
    qos2_receiving: DashMap<(ClientId, PacketId), MsgId>,
}

impl PublishHandler {
    #[inline]
    pub fn new(
        authorizator: Arc<dyn Authorizator>,
        matcher: Arc<SubscriptionMatcher>,
        messages: Arc<dyn MessageStore>,
        publisher: Arc<MessagesPublisher>,
        interceptor: Arc<InterceptorBus>,
    ) -> Self {
        Self { authorizator, matcher, messages, publisher, interceptor, qos2_receiving: DashMap::default() }
    }

    ///A publish topic is a concrete name, wildcards in it are a protocol
    ///violation.
    fn parse_topic_name(publish: &Publish) -> Option<Topic> {
        let topic = Topic::from_str(&publish.topic).ok()?;
        if topic.levels().iter().all(|l| matches!(l, Level::Normal(_) | Level::Blank)) {
            Some(topic)
        } else {
            None
        }
    }

    async fn authorized(&self, channel: &Channel, client_id: &ClientId, publish: &Publish) -> bool {
        let username = channel.username().map(|u| u.to_string());
        if self.authorizator.can_write(&publish.topic, username.as_deref(), client_id).await {
            true
        } else {
            //authorization failure on publish is a silent drop
            log::debug!("{:?} publish on {} not authorized, dropped", client_id, publish.topic);
            false
        }
    }

    fn notify_published(&self, channel: &Channel, client_id: &ClientId, publish: &Publish) {
        self.interceptor.notify(InterceptMessage::MessagePublished {
            client_id: client_id.clone(),
            username: channel.username().cloned(),
            topic: publish.topic.clone(),
            qos: publish.qos,
            retain: publish.retain,
            payload: publish.payload.clone(),
        });
    }

    pub async fn received_publish_qos0(&self, channel: &Arc<Channel>, client_id: &ClientId, publish: Publish) {
        let topic = match Self::parse_topic_name(&publish) {
            Some(topic) => topic,
            None => {
                channel.close();
                return;
            }
        };
        if !self.authorized(channel, client_id, &publish).await {
            return;
        }

        let msg = StoredMessage::from_publish(client_id.clone(), &publish);
        let subscriptions = self.matcher.matches(&topic);
        self.publisher.publish_to_subscribers(&msg, &subscriptions).await;

        if publish.retain {
            if publish.payload.is_empty() {
                self.messages.clean_retained(&publish.topic).await;
            } else if let Ok(guid) = self.messages.store_publish_for_future(msg).await {
                let _ = self.messages.store_retained(&publish.topic, &guid).await;
            }
        }

        self.notify_published(channel, client_id, &publish);
    }

    pub async fn received_publish_qos1(&self, channel: &Arc<Channel>, client_id: &ClientId, publish: Publish) {
        let (topic, packet_id) = match (Self::parse_topic_name(&publish), publish.packet_id) {
            (Some(topic), Some(packet_id)) => (topic, packet_id),
            _ => {
                channel.close();
                return;
            }
        };
        //denied publishers get no PUBACK either
        if !self.authorized(channel, client_id, &publish).await {
            return;
        }

        let mut msg = StoredMessage::from_publish(client_id.clone(), &publish);
        let guid = match self.messages.store_publish_for_future(msg.clone()).await {
            Ok(guid) => guid,
            Err(e) => {
                log::warn!("{:?} storage failed, {:?}", client_id, e);
                channel.close();
                return;
            }
        };
        msg.msg_id = guid.clone();

        let subscriptions = self.matcher.matches(&topic);
        self.publisher.publish_to_subscribers(&msg, &subscriptions).await;

        if publish.retain {
            if publish.payload.is_empty() {
                self.messages.clean_retained(&publish.topic).await;
            } else {
                //the message is already persisted, reuse its GUID
                let _ = self.messages.store_retained(&publish.topic, &guid).await;
            }
        }

        if channel.send(Packet::PublishAck { packet_id }).is_ok() {
            channel.flush();
        }
        self.notify_published(channel, client_id, &publish);
    }

    pub async fn received_publish_qos2(&self, channel: &Arc<Channel>, client_id: &ClientId, publish: Publish) {
        let packet_id = match (Self::parse_topic_name(&publish), publish.packet_id) {
            (Some(_), Some(packet_id)) => packet_id,
            _ => {
                channel.close();
                return;
            }
        };
        if !self.authorized(channel, client_id, &publish).await {
            return;
        }

        let key = (client_id.clone(), packet_id);
        if self.qos2_receiving.contains_key(&key) {
            //retransmitted first phase, ack again without a second store
            log::debug!("{:?} duplicate QoS2 publish, packet id {}", client_id, packet_id);
            if channel.send(Packet::PublishReceived { packet_id }).is_ok() {
                channel.flush();
            }
            return;
        }

        let msg = StoredMessage::from_publish(client_id.clone(), &publish);
        let guid = match self.messages.store_publish_for_future(msg).await {
            Ok(guid) => guid,
            Err(e) => {
                log::warn!("{:?} storage failed, {:?}", client_id, e);
                channel.close();
                return;
            }
        };
        self.qos2_receiving.insert(key, guid);

        if channel.send(Packet::PublishReceived { packet_id }).is_ok() {
            channel.flush();
        }
    }

    ///Second phase of inbound QoS2: fan out the stored message, clear the
    ///receiving entry, answer PUBCOMP.
    pub async fn received_pub_rel(&self, channel: &Arc<Channel>, client_id: &ClientId, packet_id: PacketId) {
        if let Some((_, guid)) = self.qos2_receiving.remove(&(client_id.clone(), packet_id)) {
            if let Some(msg) = self.messages.get_message(&guid).await {
                if let Ok(topic) = Topic::from_str(&msg.topic) {
                    let subscriptions = self.matcher.matches(&topic);
                    self.publisher.publish_to_subscribers(&msg, &subscriptions).await;
                }
                if msg.retain {
                    if msg.payload.is_empty() {
                        self.messages.clean_retained(&msg.topic).await;
                    } else {
                        let _ = self.messages.store_retained(&msg.topic, &guid).await;
                    }
                }
                self.interceptor.notify(InterceptMessage::MessagePublished {
                    client_id: client_id.clone(),
                    username: channel.username().cloned(),
                    topic: msg.topic.clone(),
                    qos: msg.qos,
                    retain: msg.retain,
                    payload: msg.payload.clone(),
                });
            }
        } else {
            log::debug!("{:?} PUBREL without a pending publish, packet id {}", client_id, packet_id);
        }

        if channel.send(Packet::PublishComplete { packet_id }).is_ok() {
            channel.flush();
        }
    }
}
