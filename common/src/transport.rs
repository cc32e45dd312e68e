//! Seam between [`crate::ConnectionManager`] and a concrete broker client.
//!
//! A [`Connector`] opens one connection and hands back a [`Transport`] for
//! outbound operations. Everything the broker does on its own (connection
//! acknowledged, dropped, closed, messages arriving) flows back through the
//! [`EventSink`] supplied at connect time.

use std::{fmt, future::Future, sync::Arc};

use crate::{config::LinkConfig, error::TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub reconnect_period_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for ConnectOptions {
    fn from(config: &LinkConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            connect_timeout_ms: config.connect_timeout_ms,
            keep_alive_secs: config.keep_alive_secs,
            reconnect_period_ms: config.reconnect_period_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    /// A new connection attempt is starting after a failure.
    Reconnect,
    Error(String),
    /// The connection was closed deliberately by either side.
    End,
    Message { topic: String, payload: Vec<u8> },
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: TransportEvent);
}

#[derive(Clone)]
pub struct EventSink {
    handler: Arc<dyn EventHandler>,
}

impl EventSink {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self { handler }
    }

    pub fn emit(&self, event: TransportEvent) {
        self.handler.handle(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync + 'static {
    /// `retain` asks the broker to keep the message for later subscribers.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Resolves once the broker has accepted the subscription.
    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Closes the connection and stops reconnecting.
    fn end(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn set_max_listeners(&self, limit: usize);
}

pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Self::Transport, TransportError>;
}
