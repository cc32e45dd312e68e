pub mod clock;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod manager;
pub mod rumqtt;
pub mod topics;
pub mod transport;
pub mod types;

pub use config::{LinkConfig, LogProfile};
pub use error::{ErrorKind, LinkError, TransportError};
pub use link::{ConnectionState, LinkSnapshot, LinkTracker, LinkTransition};
pub use logging::{Logger, TracingLogger};
pub use manager::{ConnectionManager, MessageHandler, MqttConnectionManager};
pub use rumqtt::{RumqttConnector, RumqttTransport};
pub use topics::*;
pub use transport::{ConnectOptions, Connector, EventSink, Transport, TransportEvent};
pub use types::{Availability, SensorReport};
