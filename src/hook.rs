//! Interceptor bus: lifecycle events fanned out to registered observers.
//! Observers run after the state change they describe and never block the
//! director; delivery is best-effort and unordered across observers.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::types::{ClientId, Connect, MsgId, QoS, Subscription, TopicFilter, TopicName, UserName};

#[derive(Debug, Clone)]
pub enum InterceptMessage {
    ClientConnected {
        connect: Connect,
    },
    ClientDisconnected {
        client_id: ClientId,
        username: Option<UserName>,
    },
    ConnectionLost {
        client_id: ClientId,
        username: Option<UserName>,
    },
    MessagePublished {
        client_id: ClientId,
        username: Option<UserName>,
        topic: TopicName,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    },
    TopicSubscribed {
        subscription: Subscription,
        username: Option<UserName>,
    },
    TopicUnsubscribed {
        client_id: ClientId,
        topic_filter: TopicFilter,
        username: Option<UserName>,
    },
    MessageAcknowledged {
        client_id: ClientId,
        topic: TopicName,
        msg_id: MsgId,
        qos: QoS,
    },
}

impl InterceptMessage {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            InterceptMessage::ClientConnected { connect } => serde_json::json!({
                "event": "client_connected",
                "connect": connect.to_json(),
            }),
            InterceptMessage::ClientDisconnected { client_id, username } => serde_json::json!({
                "event": "client_disconnected",
                "clientid": client_id,
                "username": username,
            }),
            InterceptMessage::ConnectionLost { client_id, username } => serde_json::json!({
                "event": "connection_lost",
                "clientid": client_id,
                "username": username,
            }),
            InterceptMessage::MessagePublished { client_id, username, topic, qos, retain, payload } => {
                serde_json::json!({
                    "event": "message_published",
                    "clientid": client_id,
                    "username": username,
                    "topic": topic,
                    "qos": qos.value(),
                    "retain": retain,
                    "payload_len": payload.len(),
                })
            }
            InterceptMessage::TopicSubscribed { subscription, username } => serde_json::json!({
                "event": "topic_subscribed",
                "clientid": subscription.client_id,
                "username": username,
                "topic_filter": subscription.topic_filter,
                "qos": subscription.qos.value(),
            }),
            InterceptMessage::TopicUnsubscribed { client_id, topic_filter, username } => serde_json::json!({
                "event": "topic_unsubscribed",
                "clientid": client_id,
                "username": username,
                "topic_filter": topic_filter,
            }),
            InterceptMessage::MessageAcknowledged { client_id, topic, msg_id, qos } => serde_json::json!({
                "event": "message_acknowledged",
                "clientid": client_id,
                "topic": topic,
                "guid": msg_id,
                "qos": qos.value(),
            }),
        }
    }
}

#[async_trait]
pub trait InterceptHandler: Sync + Send {
    async fn handle(&self, msg: &InterceptMessage);
}

///Concurrent observer list. Observers can be attached and detached on
///the running bus.
pub struct InterceptorBus {
    handlers: RwLock<Vec<Arc<dyn InterceptHandler>>>,
}

impl Default for InterceptorBus {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorBus {
    #[inline]
    pub fn new() -> Self {
        Self { handlers: RwLock::new(Vec::new()) }
    }

    #[inline]
    pub fn add_handler(&self, handler: Arc<dyn InterceptHandler>) {
        self.handlers.write().push(handler);
    }

    #[inline]
    pub fn remove_handler(&self, handler: &Arc<dyn InterceptHandler>) -> bool {
        let mut handlers = self.handlers.write();
        if let Some(pos) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
            handlers.remove(pos);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn handlers_count(&self) -> usize {
        self.handlers.read().len()
    }

    ///Fire-and-forget fan-out, one task per observer.
    #[inline]
    pub fn notify(&self, msg: InterceptMessage) {
        for handler in self.handlers.read().iter().cloned() {
            let msg = msg.clone();
            tokio::spawn(async move {
                handler.handle(&msg).await;
            });
        }
    }
}

///Observer that writes one log line per lifecycle event.
pub struct LoggingInterceptHandler;

#[async_trait]
impl InterceptHandler for LoggingInterceptHandler {
    async fn handle(&self, msg: &InterceptMessage) {
        match msg {
            InterceptMessage::ClientConnected { connect } => {
                log::info!(
                    "Connect [clientID: {}, proto: {}, ver: {:02X}, clean: {}]",
                    connect.client_id,
                    connect.protocol_name,
                    connect.protocol_level,
                    connect.clean_session
                );
            }
            InterceptMessage::ClientDisconnected { client_id, username } => {
                log::info!("Disconnect [clientID: {}, username: {:?}]", client_id, username);
            }
            InterceptMessage::ConnectionLost { client_id, username } => {
                log::info!("ConnectionLost [clientID: {}, username: {:?}]", client_id, username);
            }
            InterceptMessage::MessagePublished { client_id, topic, qos, .. } => {
                log::info!("Publish [clientID: {}, topic: {}, QoS: {}]", client_id, topic, qos.value());
            }
            InterceptMessage::TopicSubscribed { subscription, .. } => {
                log::info!(
                    "Subscribe [clientID: {}, topicFilter: {}, QoS: {}]",
                    subscription.client_id,
                    subscription.topic_filter,
                    subscription.qos.value()
                );
            }
            InterceptMessage::TopicUnsubscribed { client_id, topic_filter, .. } => {
                log::info!("Unsubscribe [clientID: {}, topicFilter: {}]", client_id, topic_filter);
            }
            InterceptMessage::MessageAcknowledged { client_id, topic, qos, .. } => {
                log::info!("Acknowledged [clientID: {}, topic: {}, QoS: {}]", client_id, topic, qos.value());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{InterceptHandler, InterceptMessage};

    ///Test observer collecting every event it sees.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub(crate) events: Mutex<Vec<InterceptMessage>>,
    }

    impl RecordingHandler {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn events(&self) -> Vec<InterceptMessage> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl InterceptHandler for RecordingHandler {
        async fn handle(&self, msg: &InterceptMessage) {
            self.events.lock().push(msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::recording::RecordingHandler;
    use super::*;

    #[tokio::test]
    async fn bus_delivers_to_every_handler() {
        let bus = InterceptorBus::new();
        let h1 = RecordingHandler::new();
        let h2 = RecordingHandler::new();
        bus.add_handler(h1.clone());
        bus.add_handler(h2.clone());
        assert_eq!(bus.handlers_count(), 2);

        bus.notify(InterceptMessage::ConnectionLost { client_id: "c1".into(), username: None });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h1.events().len(), 1);
        assert_eq!(h2.events().len(), 1);
    }

    #[tokio::test]
    async fn handlers_can_be_removed() {
        let bus = InterceptorBus::new();
        let h1 = RecordingHandler::new();
        let handler: Arc<dyn InterceptHandler> = h1.clone();
        bus.add_handler(handler.clone());
        assert!(bus.remove_handler(&handler));
        assert!(!bus.remove_handler(&handler));
        assert_eq!(bus.handlers_count(), 0);

        bus.notify(InterceptMessage::ConnectionLost { client_id: "c1".into(), username: None });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h1.events().is_empty());
    }

    #[test]
    fn event_to_json() {
        let msg = InterceptMessage::MessageAcknowledged {
            client_id: "c1".into(),
            topic: "a/b".into(),
            msg_id: "g1".into(),
            qos: crate::types::QoS::AtLeastOnce,
        };
        let v = msg.to_json();
        assert_eq!(v["event"], "message_acknowledged");
        assert_eq!(v["qos"], 1);
    }
}
