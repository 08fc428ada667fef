//! Protocol director: top-level dispatch of decoded control packets and
//! the connection lifecycle state machine.
//!
//! CONNECT processing is a strict sequence of compare-and-set transitions
//! on the connection descriptor; every step fails closed by dropping the
//! channel. DISCONNECT and connection-lost run their own transition
//! sequences, the latter deciding whether the will testament goes out.

use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::auth::{Authenticator, Authorizator};
use crate::handler::PublishHandler;
use crate::hook::{InterceptHandler, InterceptMessage, InterceptorBus};
use crate::message::MessageStore;
use crate::publisher::MessagesPublisher;
use crate::registry::{ConnectionDescriptor, ConnectionRegistry, ConnectionState};
use crate::session::{ClientSession, SessionStore};
use crate::settings::Settings;
use crate::sink::Channel;
use crate::topic::Topic;
use crate::trie::SubscriptionMatcher;
use crate::types::{
    ClientId, Connect, ConnectAckReason, DashMap, LastWill, MsgId, Packet, PacketId, Publish, QoS,
    StoredMessage, SubscribeReturnCode, Subscription, TopicFilter, BROKER_SELF_CLIENT_ID, MQTT_LEVEL_31,
    MQTT_LEVEL_311,
};
use crate::Result;

const AUTO_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Verified,
    Stored,
}

#[derive(Clone)]
pub struct ProtocolDirector(Arc<DirectorInner>);

pub struct DirectorInner {
    settings: Settings,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    matcher: Arc<SubscriptionMatcher>,
    authenticator: Arc<dyn Authenticator>,
    authorizator: Arc<dyn Authorizator>,
    interceptor: Arc<InterceptorBus>,
    publisher: Arc<MessagesPublisher>,
    handler: PublishHandler,
    //client id => will testament, inserted on CONNECT with the will flag,
    //removed on graceful DISCONNECT or after publication on loss
    will_store: DashMap<ClientId, LastWill>,
    //guard against concurrent processing of the same SUBSCRIBE
    subscription_in_course: DashMap<(ClientId, PacketId), SubscriptionState>,
}

impl Deref for ProtocolDirector {
    type Target = DirectorInner;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl ProtocolDirector {
    pub fn new(
        settings: Settings,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        authenticator: Arc<dyn Authenticator>,
        authorizator: Arc<dyn Authorizator>,
        interceptor: Arc<InterceptorBus>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let matcher = Arc::new(SubscriptionMatcher::new());
        let publisher =
            Arc::new(MessagesPublisher::new(registry.clone(), sessions.clone(), messages.clone()));
        let handler = PublishHandler::new(
            authorizator.clone(),
            matcher.clone(),
            messages.clone(),
            publisher.clone(),
            interceptor.clone(),
        );
        Self(Arc::new(DirectorInner {
            settings,
            registry,
            sessions,
            messages,
            matcher,
            authenticator,
            authorizator,
            interceptor,
            publisher,
            handler,
            will_store: DashMap::default(),
            subscription_in_course: DashMap::default(),
        }))
    }

    #[inline]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[inline]
    pub fn matcher(&self) -> &Arc<SubscriptionMatcher> {
        &self.matcher
    }

    #[inline]
    pub fn add_intercept_handler(&self, handler: Arc<dyn InterceptHandler>) {
        self.interceptor.add_handler(handler);
    }

    #[inline]
    pub fn remove_intercept_handler(&self, handler: &Arc<dyn InterceptHandler>) -> bool {
        self.interceptor.remove_handler(handler)
    }

    ///Top-level dispatch. The transport calls this once per decoded
    ///packet; ordering per channel is its responsibility.
    pub async fn process(&self, channel: &Arc<Channel>, packet: Packet) {
        if channel.is_closed() {
            log::debug!("{:?} packet on closed channel discarded", channel);
            return;
        }
        channel.touch();
        match packet {
            Packet::Connect(connect) => self.process_connect(channel, *connect).await,
            Packet::Publish(publish) => self.process_publish(channel, publish).await,
            Packet::PublishAck { packet_id } => self.process_pub_ack(channel, packet_id).await,
            Packet::PublishReceived { packet_id } => self.process_pub_rec(channel, packet_id).await,
            Packet::PublishRelease { packet_id } => self.process_pub_rel(channel, packet_id).await,
            Packet::PublishComplete { packet_id } => self.process_pub_comp(channel, packet_id).await,
            Packet::Subscribe { packet_id, topic_filters } => {
                self.process_subscribe(channel, packet_id, topic_filters).await
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                self.process_unsubscribe(channel, packet_id, topic_filters).await
            }
            Packet::PingRequest => {
                if channel.send(Packet::PingResponse).is_ok() {
                    channel.flush();
                }
            }
            Packet::Disconnect => self.process_disconnect(channel).await,
            other => {
                log::warn!("{:?} unexpected packet {:?}", channel, other);
                channel.close();
            }
        }
    }

    pub async fn process_connect(&self, channel: &Arc<Channel>, mut connect: Connect) {
        log::info!("CONNECT for client {:?}", connect.client_id);

        if connect.protocol_level != MQTT_LEVEL_31 && connect.protocol_level != MQTT_LEVEL_311 {
            log::warn!("{:?} CONNECT with unacceptable protocol version {}", channel, connect.protocol_level);
            self.refuse(channel, ConnectAckReason::UnacceptableProtocolVersion);
            return;
        }

        if connect.client_id.is_empty() {
            if !connect.clean_session || !self.settings.allow_zero_byte_client_id {
                log::warn!("{:?} CONNECT with empty client id rejected", channel);
                self.refuse(channel, ConnectAckReason::IdentifierRejected);
                return;
            }
            connect.client_id = ClientId::from(
                Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_owned(),
            );
            log::info!("client connected with server generated identifier: {:?}", connect.client_id);
        }

        if !self.login(channel, &connect).await {
            channel.close();
            return;
        }

        let client_id = connect.client_id.clone();
        channel.set_client_id(client_id.clone());

        let descriptor =
            Arc::new(ConnectionDescriptor::new(client_id.clone(), channel.clone(), connect.clean_session));
        if let Some(existing) = self.registry.put_if_absent(descriptor.clone()) {
            log::info!("{:?} found an existing connection with same client id, forcing close", client_id);
            //the loss handler of the old channel must observe the
            //reconnecting mark, so this CONNECT is abandoned and the
            //client retries
            self.registry.mark_reconnecting(existing.clone());
            existing.abort();
            return;
        }

        self.install_keep_alive(channel, connect.keep_alive);

        if !self.send_ack(&descriptor, &connect).await {
            channel.close();
            return;
        }

        //interceptor, client connected
        self.interceptor.notify(InterceptMessage::ClientConnected { connect: connect.clone() });

        let session = match self.create_or_load_session(&descriptor, &connect).await {
            Some(session) => session,
            None => {
                channel.close();
                return;
            }
        };

        if let Some(will) = connect.last_will.clone() {
            log::info!("{:?} session with will to topic {}", client_id, will.topic);
            self.will_store.insert(client_id.clone(), will);
        }

        if !self.republish(&descriptor, &connect, &session).await {
            channel.close();
            return;
        }

        if !descriptor.assign_state(ConnectionState::MessagesRepublished, ConnectionState::Established) {
            channel.close();
            return;
        }
        log::info!("{:?} connection established", client_id);
    }

    async fn login(&self, channel: &Arc<Channel>, connect: &Connect) -> bool {
        if let Some(username) = connect.username.as_ref() {
            let password = connect.password.as_ref().map(|p| p.as_ref());
            if password.is_none() && !self.settings.allow_anonymous {
                self.refuse(channel, ConnectAckReason::BadUserNameOrPassword);
                return false;
            }
            if !self.authenticator.check_valid(&connect.client_id, username, password).await {
                log::info!("{:?} failed to connect with bad username or password", connect.client_id);
                self.refuse(channel, ConnectAckReason::BadUserNameOrPassword);
                return false;
            }
            channel.set_username(username.clone());
            true
        } else if !self.settings.allow_anonymous {
            log::info!("{:?} anonymous connection refused", connect.client_id);
            self.refuse(channel, ConnectAckReason::NotAuthorized);
            false
        } else {
            true
        }
    }

    #[inline]
    fn refuse(&self, channel: &Arc<Channel>, return_code: ConnectAckReason) {
        let _ = channel.send(Packet::ConnectAck { return_code, session_present: false });
        channel.flush();
        channel.close();
    }

    async fn send_ack(&self, descriptor: &Arc<ConnectionDescriptor>, connect: &Connect) -> bool {
        if !descriptor.assign_state(ConnectionState::Disconnected, ConnectionState::SendAck) {
            return false;
        }

        let session = self.sessions.session_for_client(&connect.client_id).await;
        let session_present = !connect.clean_session && session.is_some();
        if let Some(session) = session {
            session.set_clean_session(connect.clean_session);
        }
        if descriptor
            .channel
            .send(Packet::ConnectAck { return_code: ConnectAckReason::ConnectionAccepted, session_present })
            .is_err()
        {
            return false;
        }
        descriptor.channel.flush();
        true
    }

    async fn create_or_load_session(
        &self,
        descriptor: &Arc<ConnectionDescriptor>,
        connect: &Connect,
    ) -> Option<ClientSession> {
        if !descriptor.assign_state(ConnectionState::SendAck, ConnectionState::SessionCreated) {
            return None;
        }

        let session = match self.sessions.session_for_client(&connect.client_id).await {
            Some(session) => session,
            None => self
                .sessions
                .create_new_session(connect.client_id.clone(), connect.clean_session)
                .await
                .map_err(|e| log::warn!("{:?} session creation failed, {:?}", connect.client_id, e))
                .ok()?,
        };
        if connect.clean_session {
            //discard prior state, matcher entries included
            for (topic_filter, _) in session.subscriptions() {
                if let Ok(topic) = Topic::from_str(&topic_filter) {
                    self.matcher.remove(&topic, &connect.client_id);
                }
            }
            session.clean();
        }
        Some(session)
    }

    async fn republish(
        &self,
        descriptor: &Arc<ConnectionDescriptor>,
        connect: &Connect,
        session: &ClientSession,
    ) -> bool {
        if !descriptor.assign_state(ConnectionState::SessionCreated, ConnectionState::MessagesRepublished) {
            return false;
        }

        if !connect.clean_session {
            let stored = session.stored_messages();
            if stored.is_empty() {
                log::info!("{:?} no stored messages", connect.client_id);
            } else {
                log::info!("{:?} republishing {} stored messages", connect.client_id, stored.len());
                let guids = stored.iter().map(|(guid, _)| guid.clone()).collect::<Vec<MsgId>>();
                self.publisher.publish_stored(session, stored).await;
                for guid in guids {
                    session.remove_enqueued(&guid);
                }
            }
        }

        self.install_auto_flush(descriptor);
        true
    }

    fn install_keep_alive(&self, channel: &Arc<Channel>, keep_alive: u16) {
        if keep_alive == 0 {
            return;
        }
        let idle_millis = ((keep_alive as f64 * 1.5).ceil() as i64) * 1000;
        let director = self.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            loop {
                if channel.is_closed() {
                    break;
                }
                let idle = channel.idle_millis();
                if idle >= idle_millis {
                    log::info!("{:?} keep alive timeout, dropping connection", channel);
                    channel.close();
                    director.process_connection_lost(&channel).await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis((idle_millis - idle).max(1) as u64)).await;
            }
        });
    }

    fn install_auto_flush(&self, descriptor: &Arc<ConnectionDescriptor>) {
        let channel = descriptor.channel.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(AUTO_FLUSH_INTERVAL).await;
                if channel.is_closed() {
                    break;
                }
                channel.flush_pending();
            }
        });
    }

    pub async fn process_publish(&self, channel: &Arc<Channel>, publish: Publish) {
        let client_id = match channel.client_id() {
            Some(client_id) => client_id.clone(),
            None => {
                //PUBLISH before CONNECT completed
                channel.close();
                return;
            }
        };
        log::debug!("{:?} incoming publish: {:?}", client_id, publish);
        match publish.qos {
            QoS::AtMostOnce => self.handler.received_publish_qos0(channel, &client_id, publish).await,
            QoS::AtLeastOnce => self.handler.received_publish_qos1(channel, &client_id, publish).await,
            QoS::ExactlyOnce => self.handler.received_publish_qos2(channel, &client_id, publish).await,
        }
    }

    pub async fn process_pub_ack(&self, channel: &Arc<Channel>, packet_id: PacketId) {
        let (client_id, session) = match self.channel_session(channel).await {
            Some(found) => found,
            None => return,
        };
        if let Some(inflight) = session.in_flight_acknowledged(packet_id) {
            self.notify_acknowledged(&client_id, inflight.msg_id, inflight.qos).await;
        } else {
            log::debug!("{:?} PUBACK for unknown packet id {}", client_id, packet_id);
        }
    }

    ///Moves the packet id to the PUBCOMP wait and answers PUBREL.
    pub async fn process_pub_rec(&self, channel: &Arc<Channel>, packet_id: PacketId) {
        let (client_id, session) = match self.channel_session(channel).await {
            Some(found) => found,
            None => return,
        };
        if !session.move_in_flight_to_second_phase_ack_waiting(packet_id) {
            log::debug!("{:?} PUBREC for unknown packet id {}", client_id, packet_id);
        }
        if channel.send(Packet::PublishRelease { packet_id }).is_ok() {
            channel.flush();
        }
    }

    pub async fn process_pub_rel(&self, channel: &Arc<Channel>, packet_id: PacketId) {
        let client_id = match channel.client_id() {
            Some(client_id) => client_id.clone(),
            None => {
                channel.close();
                return;
            }
        };
        self.handler.received_pub_rel(channel, &client_id, packet_id).await;
    }

    pub async fn process_pub_comp(&self, channel: &Arc<Channel>, packet_id: PacketId) {
        let (client_id, session) = match self.channel_session(channel).await {
            Some(found) => found,
            None => return,
        };
        if let Some(inflight) = session.second_phase_acknowledged(packet_id) {
            self.notify_acknowledged(&client_id, inflight.msg_id, inflight.qos).await;
        } else {
            log::debug!("{:?} PUBCOMP for unknown packet id {}", client_id, packet_id);
        }
    }

    pub async fn process_subscribe(
        &self,
        channel: &Arc<Channel>,
        packet_id: PacketId,
        topic_filters: Vec<(TopicFilter, QoS)>,
    ) {
        let (client_id, session) = match self.channel_session(channel).await {
            Some(found) => found,
            None => {
                channel.close();
                return;
            }
        };
        log::debug!("SUBSCRIBE client {:?} packet id {}", client_id, packet_id);

        let key = (client_id.clone(), packet_id);
        match self.subscription_in_course.entry(key.clone()) {
            Entry::Occupied(_) => {
                log::debug!("{:?} sent another SUBSCRIBE while this one was processing", client_id);
                return;
            }
            Entry::Vacant(v) => {
                v.insert(SubscriptionState::Verified);
            }
        }

        let username = channel.username().map(|u| u.to_string());
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut accepted: Vec<(Topic, TopicFilter, QoS)> = Vec::new();
        for (topic_filter, qos) in topic_filters.iter() {
            if !self.authorizator.can_read(topic_filter, username.as_deref(), &client_id).await {
                log::debug!("{:?} no read credentials on {}", client_id, topic_filter);
                status.push(SubscribeReturnCode::Failure);
                continue;
            }
            match SubscriptionMatcher::validate(topic_filter) {
                Ok(topic) => {
                    status.push(SubscribeReturnCode::Success(*qos));
                    accepted.push((topic, topic_filter.clone(), *qos));
                }
                Err(_) => status.push(SubscribeReturnCode::Failure),
            }
        }

        let advanced = match self.subscription_in_course.get_mut(&key) {
            Some(mut state) if *state == SubscriptionState::Verified => {
                *state = SubscriptionState::Stored;
                true
            }
            _ => false,
        };
        if !advanced {
            log::debug!("{:?} sent another SUBSCRIBE while this one was verifying filters", client_id);
            return;
        }

        for (topic, topic_filter, qos) in accepted.iter() {
            session.subscribe(topic_filter.clone(), *qos);
            self.matcher.add(topic, client_id.clone(), *qos);
        }

        log::debug!("SUBACK for packet id {}", packet_id);
        if channel.send(Packet::SubscribeAck { packet_id, status }).is_ok() {
            channel.flush();
        }

        //deliver retained matches for each fresh subscription
        for (topic, topic_filter, qos) in accepted {
            let retained = self.messages.search_matching(&|t: &str| topic.matches_str(t)).await;
            if !retained.is_empty() {
                self.publisher.publish_retained(&client_id, retained, qos).await;
            }
            //interceptor, topic subscribed
            self.interceptor.notify(InterceptMessage::TopicSubscribed {
                subscription: Subscription { client_id: client_id.clone(), topic_filter, qos },
                username: channel.username().cloned(),
            });
        }

        if self.subscription_in_course.remove_if(&key, |_, s| *s == SubscriptionState::Stored).is_none() {
            log::warn!("{:?} failed to remove the subscription guard", client_id);
        }
    }

    pub async fn process_unsubscribe(
        &self,
        channel: &Arc<Channel>,
        packet_id: PacketId,
        topic_filters: Vec<TopicFilter>,
    ) {
        let (client_id, session) = match self.channel_session(channel).await {
            Some(found) => found,
            None => {
                channel.close();
                return;
            }
        };
        log::debug!("UNSUBSCRIBE on topics {:?} for client {:?}", topic_filters, client_id);

        for topic_filter in topic_filters {
            let topic = match SubscriptionMatcher::validate(&topic_filter) {
                Ok(topic) => topic,
                Err(_) => {
                    //an invalid filter here is a protocol violation
                    log::warn!("{:?} UNSUBSCRIBE with invalid topic filter {}", client_id, topic_filter);
                    channel.close();
                    return;
                }
            };
            self.matcher.remove(&topic, &client_id);
            session.unsubscribe_from(&topic_filter);
            //interceptor, topic unsubscribed
            self.interceptor.notify(InterceptMessage::TopicUnsubscribed {
                client_id: client_id.clone(),
                topic_filter,
                username: channel.username().cloned(),
            });
        }

        if channel.send(Packet::UnsubscribeAck { packet_id }).is_ok() {
            channel.flush();
        }
    }

    pub async fn process_disconnect(&self, channel: &Arc<Channel>) {
        channel.flush();
        let client_id = match channel.client_id() {
            Some(client_id) => client_id.clone(),
            None => {
                channel.close();
                return;
            }
        };
        let descriptor = match self.registry.get(&client_id) {
            Some(descriptor) => descriptor,
            None => {
                //another client with the same id removed the descriptor
                channel.close();
                return;
            }
        };
        if !Arc::ptr_eq(&descriptor.channel, channel) {
            //another connection owns the registry entry now
            channel.close();
            return;
        }

        if !self.remove_subscriptions(&descriptor, &client_id).await {
            channel.close();
            return;
        }
        if !self.drop_stored_messages(&descriptor, &client_id).await {
            channel.close();
            return;
        }
        if !self.clean_will_and_notify(&descriptor, &client_id) {
            channel.close();
            return;
        }
        if !self.close_descriptor_channel(&descriptor) {
            return;
        }
        if !self.registry.remove_if_same(&client_id, &descriptor) {
            return;
        }
        log::info!("DISCONNECT client {:?} finished", client_id);
    }

    async fn remove_subscriptions(&self, descriptor: &Arc<ConnectionDescriptor>, client_id: &ClientId) -> bool {
        if !descriptor.assign_state(ConnectionState::Established, ConnectionState::SubscriptionsRemoved) {
            return false;
        }
        if descriptor.clean_session {
            log::info!("cleaning old saved subscriptions for client {:?}", client_id);
            for topic_filter in self.sessions.wipe_subscriptions(client_id).await {
                if let Ok(topic) = Topic::from_str(&topic_filter) {
                    self.matcher.remove(&topic, client_id);
                }
            }
        }
        true
    }

    async fn drop_stored_messages(&self, descriptor: &Arc<ConnectionDescriptor>, client_id: &ClientId) -> bool {
        if !descriptor.assign_state(ConnectionState::SubscriptionsRemoved, ConnectionState::MessagesDropped) {
            return false;
        }
        if descriptor.clean_session {
            log::debug!("removing messages in session for client {:?}", client_id);
            self.messages.drop_messages_in_session(client_id).await;
        }
        true
    }

    fn clean_will_and_notify(&self, descriptor: &Arc<ConnectionDescriptor>, client_id: &ClientId) -> bool {
        if !descriptor.assign_state(ConnectionState::MessagesDropped, ConnectionState::InterceptorsNotified) {
            return false;
        }
        //graceful disconnect never publishes the will
        self.will_store.remove(client_id);
        //interceptor, client disconnected
        self.interceptor.notify(InterceptMessage::ClientDisconnected {
            client_id: client_id.clone(),
            username: descriptor.channel.username().cloned(),
        });
        true
    }

    fn close_descriptor_channel(&self, descriptor: &Arc<ConnectionDescriptor>) -> bool {
        if !descriptor.assign_state(ConnectionState::InterceptorsNotified, ConnectionState::Disconnected) {
            return false;
        }
        descriptor.channel.close();
        true
    }

    ///Ungraceful loss of a channel. The will goes out unless this id was
    ///displaced by a newer CONNECT.
    pub async fn process_connection_lost(&self, channel: &Arc<Channel>) {
        let client_id = match channel.client_id() {
            Some(client_id) => client_id.clone(),
            None => return,
        };
        log::debug!("connection lost for client {:?}", client_id);
        self.registry.remove_if_channel(&client_id, channel);

        if self.registry.take_reconnecting(&client_id).is_some() {
            //the loss was forced by a newer CONNECT, keep the will quiet
            return;
        }

        if let Some((_, will)) = self.will_store.remove(&client_id) {
            self.forward_publish_will(will, &client_id).await;
        }

        //interceptor, connection lost
        self.interceptor.notify(InterceptMessage::ConnectionLost {
            client_id,
            username: channel.username().cloned(),
        });
    }

    async fn forward_publish_will(&self, will: LastWill, client_id: &ClientId) {
        log::debug!("{:?} publishing will on topic {}", client_id, will.topic);
        let mut msg = StoredMessage::from_will(client_id.clone(), &will);
        if !matches!(will.qos, QoS::AtMostOnce) {
            //recipient windows resolve messages by GUID, persist first
            match self.messages.store_publish_for_future(msg.clone()).await {
                Ok(guid) => msg.msg_id = guid,
                Err(e) => {
                    log::warn!("{:?} will message storage failed, {:?}", client_id, e);
                    return;
                }
            }
        }
        if let Ok(topic) = Topic::from_str(&msg.topic) {
            let subscriptions = self.matcher.matches(&topic);
            self.publisher.publish_to_subscribers(&msg, &subscriptions).await;
        }
    }

    ///Drains the session queue back onto the channel while it stays
    ///writable, then flushes.
    pub async fn notify_channel_writable(&self, channel: &Arc<Channel>) {
        let (_, session) = match self.channel_session(channel).await {
            Some(found) => found,
            None => return,
        };
        while channel.is_writable() {
            let parked = match session.dequeue() {
                Some(parked) => parked,
                None => break,
            };
            let msg = match self.messages.get_message(&parked.msg_id).await {
                Some(msg) => msg,
                None => continue,
            };
            let publish = msg.to_publish(parked.qos, Some(parked.packet_id), false, false);
            if channel.send(Packet::Publish(publish)).is_err() {
                break;
            }
        }
        channel.flush();
    }

    ///Embedded publish for the hosting application: no authorization
    ///check and no inbound handshake phases.
    pub async fn internal_publish(&self, publish: Publish, client_id: Option<ClientId>) -> Result<()> {
        let client_id = client_id
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ClientId::from(BROKER_SELF_CLIENT_ID));
        log::info!("embedded PUBLISH on topic {} with QoS {:?}", publish.topic, publish.qos);

        let mut msg = StoredMessage::from_publish(client_id, &publish);
        let mut guid = None;
        if !matches!(publish.qos, QoS::AtMostOnce) {
            let g = self.messages.store_publish_for_future(msg.clone()).await?;
            msg.msg_id = g.clone();
            guid = Some(g);
        }

        let topic = Topic::from_str(&publish.topic)?;
        let subscriptions = self.matcher.matches(&topic);
        self.publisher.publish_to_subscribers(&msg, &subscriptions).await;

        if !publish.retain {
            return Ok(());
        }
        if matches!(publish.qos, QoS::AtMostOnce) || publish.payload.is_empty() {
            self.messages.clean_retained(&publish.topic).await;
            return Ok(());
        }
        let guid = match guid {
            Some(guid) => guid,
            None => self.messages.store_publish_for_future(msg).await?,
        };
        self.messages.store_retained(&publish.topic, &guid).await?;
        Ok(())
    }

    async fn channel_session(&self, channel: &Arc<Channel>) -> Option<(ClientId, ClientSession)> {
        let client_id = channel.client_id()?.clone();
        let session = self.sessions.session_for_client(&client_id).await?;
        Some((client_id, session))
    }

    async fn notify_acknowledged(&self, client_id: &ClientId, msg_id: MsgId, qos: QoS) {
        let topic = match self.messages.get_message(&msg_id).await {
            Some(msg) => msg.topic,
            None => return,
        };
        //interceptor, message acknowledged
        self.interceptor.notify(InterceptMessage::MessageAcknowledged {
            client_id: client_id.clone(),
            topic,
            msg_id,
            qos,
        });
    }
}
