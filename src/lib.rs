#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! MQTT v3.1 / v3.1.1 broker protocol engine.
//!
//! The engine consumes decoded control packets handed over by a transport
//! layer, keeps per-client session state, enforces the three QoS delivery
//! contracts, matches publications against a wildcard subscription trie
//! and drives transmission back to matching clients. Byte-level codec,
//! networking, TLS and WebSocket upgrades live outside and reach the
//! engine through the [`sink::Sink`] capability.
//!
//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mqtted::auth::{AcceptAllAuthenticator, PermitAllAuthorizator};
//! use mqtted::director::ProtocolDirector;
//! use mqtted::hook::InterceptorBus;
//! use mqtted::message::DefaultMessageStore;
//! use mqtted::session::DefaultSessionStore;
//! use mqtted::settings::Settings;
//!
//! let director = ProtocolDirector::new(
//!     Settings::default(),
//!     Arc::new(DefaultSessionStore::new()),
//!     Arc::new(DefaultMessageStore::new()),
//!     Arc::new(AcceptAllAuthenticator),
//!     Arc::new(PermitAllAuthorizator),
//!     Arc::new(InterceptorBus::new()),
//! );
//! //the transport wraps each connection in a Channel and feeds decoded
//! //packets into director.process(&channel, packet)
//! ```

/// Core Broker Components
pub mod director; // Protocol dispatch and connection lifecycle
pub mod handler; // Inbound publish handling per QoS level
pub mod publisher; // Downstream fan-out and republish
pub mod registry; // Live connection descriptors

/// State and Storage
pub mod inflight; // Delivery windows per session
pub mod message; // Message store and retained index
pub mod queue; // Bounded offline queue
pub mod session; // Client session store

/// Topic Handling
pub mod topic; // Topic parsing and validation
pub mod trie; // Subscription trie

/// Injected Capabilities
pub mod auth; // Authenticator and authorizator
pub mod hook; // Interceptor bus
pub mod sink; // Channel handle toward the transport

/// Ambient Services
pub mod error;
pub mod logger;
pub mod settings;
pub mod types;

pub use crate::error::{MqttError, Result};
pub use crate::types::QoS;
