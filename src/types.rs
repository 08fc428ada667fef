use std::convert::TryFrom;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::MqttError;

pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type Password = Bytes;
pub type PacketId = u16;
///concrete topic name
pub type TopicName = ByteString;
///topic filter, may contain wildcards
pub type TopicFilter = ByteString;
///message store GUID
pub type MsgId = ByteString;
pub type TimestampMillis = i64;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type DashSet<V> = dashmap::DashSet<V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub const MQTT_LEVEL_31: u8 = 3;
pub const MQTT_LEVEL_311: u8 = 4;
pub const MQTT_PROTO_NAME_31: &str = "MQIsdp";
pub const MQTT_PROTO_NAME_311: &str = "MQTT";

///publisher identity used for embedded publishes with no client id
pub const BROKER_SELF_CLIENT_ID: &str = "BROKER_SELF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    #[inline]
    pub fn less_value(&self, qos: QoS) -> QoS {
        if self.value() < qos.value() {
            *self
        } else {
            qos
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    #[inline]
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::Msg(format!("invalid QoS value, {}", v))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAckReason {
    ConnectionAccepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServiceUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnectAckReason {
    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            ConnectAckReason::ConnectionAccepted => 0,
            ConnectAckReason::UnacceptableProtocolVersion => 1,
            ConnectAckReason::IdentifierRejected => 2,
            ConnectAckReason::ServiceUnavailable => 3,
            ConnectAckReason::BadUserNameOrPassword => 4,
            ConnectAckReason::NotAuthorized => 5,
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        matches!(self, ConnectAckReason::ConnectionAccepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: TopicName,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: ByteString,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: ClientId,
    pub username: Option<UserName>,
    pub password: Option<Password>,
    pub last_will: Option<LastWill>,
}

impl Connect {
    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "clientid": self.client_id,
            "username": self.username,
            "keepalive": self.keep_alive,
            "proto_ver": self.protocol_level,
            "clean_session": self.clean_session,
            "last_will": self.last_will.as_ref().map(|w| serde_json::json!({
                "topic": w.topic,
                "qos": w.qos.value(),
                "retain": w.retain,
                "payload_len": w.payload.len(),
            })),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: TopicName,
    pub packet_id: Option<PacketId>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    #[inline]
    pub fn byte(&self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos.value(),
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

///Decoded v3 control packet, both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck { return_code: ConnectAckReason, session_present: bool },
    Publish(Publish),
    PublishAck { packet_id: PacketId },
    PublishReceived { packet_id: PacketId },
    PublishRelease { packet_id: PacketId },
    PublishComplete { packet_id: PacketId },
    Subscribe { packet_id: PacketId, topic_filters: Vec<(TopicFilter, QoS)> },
    SubscribeAck { packet_id: PacketId, status: Vec<SubscribeReturnCode> },
    Unsubscribe { packet_id: PacketId, topic_filters: Vec<TopicFilter> },
    UnsubscribeAck { packet_id: PacketId },
    PingRequest,
    PingResponse,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: ClientId,
    pub topic_filter: TopicFilter,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub msg_id: MsgId,
    ///publisher client id
    pub client_id: ClientId,
    pub topic: TopicName,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub packet_id: Option<PacketId>,
    pub create_time: TimestampMillis,
}

impl StoredMessage {
    #[inline]
    pub fn from_publish(client_id: ClientId, publish: &Publish) -> Self {
        Self {
            msg_id: MsgId::default(),
            client_id,
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            packet_id: publish.packet_id,
            create_time: chrono::Local::now().timestamp_millis(),
        }
    }

    #[inline]
    pub fn from_will(client_id: ClientId, will: &LastWill) -> Self {
        Self {
            msg_id: MsgId::default(),
            client_id,
            topic: will.topic.clone(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
            packet_id: None,
            create_time: chrono::Local::now().timestamp_millis(),
        }
    }

    ///Outbound rendition for one recipient.
    #[inline]
    pub fn to_publish(&self, qos: QoS, packet_id: Option<PacketId>, retain: bool, dup: bool) -> Publish {
        Publish {
            dup,
            retain,
            qos,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos() {
        assert_eq!(QoS::AtMostOnce.value(), 0);
        assert_eq!(QoS::ExactlyOnce.value(), 2);
        assert_eq!(QoS::ExactlyOnce.less_value(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::AtMostOnce.less_value(QoS::ExactlyOnce), QoS::AtMostOnce);
        assert!(QoS::try_from(3).is_err());
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
    }

    #[test]
    fn test_connack_codes() {
        assert_eq!(ConnectAckReason::ConnectionAccepted.code(), 0);
        assert_eq!(ConnectAckReason::UnacceptableProtocolVersion.code(), 1);
        assert_eq!(ConnectAckReason::IdentifierRejected.code(), 2);
        assert_eq!(ConnectAckReason::BadUserNameOrPassword.code(), 4);
        assert_eq!(ConnectAckReason::NotAuthorized.code(), 5);
        assert!(ConnectAckReason::ConnectionAccepted.success());
        assert!(!ConnectAckReason::NotAuthorized.success());
    }

    #[test]
    fn test_subscribe_return_code() {
        assert_eq!(SubscribeReturnCode::Success(QoS::ExactlyOnce).byte(), 2);
        assert_eq!(SubscribeReturnCode::Failure.byte(), 0x80);
    }
}
