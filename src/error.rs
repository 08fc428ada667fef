use std::str::Utf8Error;

use config::ConfigError;
use thiserror::Error;

use crate::topic::TopicError;
use crate::types::PacketId;

pub type Result<T, E = MqttError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("bad username or password")]
    BadUserNameOrPassword,
    #[error("not authorized")]
    NotAuthorized,
    #[error("connection state transition failed")]
    StateTransitionFailed,
    #[error("channel is closed")]
    ChannelClosed,
    #[error("packet id {0} already in use")]
    PacketIdInUse(PacketId),
    #[error("no packet id available")]
    PacketIdExhausted,
    #[error("session for {0} already exists")]
    SessionAlreadyExists(String),
    #[error("topic error, {0}")]
    TopicError(String),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("utf8 error, {0}")]
    Utf8Error(#[from] Utf8Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl Default for MqttError {
    #[inline]
    fn default() -> Self {
        MqttError::ServiceUnavailable
    }
}

impl From<String> for MqttError {
    #[inline]
    fn from(e: String) -> Self {
        MqttError::Msg(e)
    }
}

impl From<&str> for MqttError {
    #[inline]
    fn from(e: &str) -> Self {
        MqttError::Msg(e.to_string())
    }
}

impl From<TopicError> for MqttError {
    #[inline]
    fn from(e: TopicError) -> Self {
        MqttError::TopicError(format!("{:?}", e))
    }
}
