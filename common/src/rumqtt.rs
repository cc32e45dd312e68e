use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    NetworkOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    transport::{ConnectOptions, Connector, EventSink, Transport, TransportEvent},
};

const DEFAULT_PORT: u16 = 1883;

type SubAckReply = oneshot::Sender<Result<(), TransportError>>;

/// Opens broker connections with `rumqttc`.
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    request_capacity: usize,
}

impl Default for RumqttConnector {
    fn default() -> Self {
        Self {
            request_capacity: 64,
        }
    }
}

impl RumqttConnector {
    pub fn with_capacity(request_capacity: usize) -> Self {
        Self {
            request_capacity: request_capacity.max(1),
        }
    }
}

/// Subscribe requests waiting for their SUBACK.
///
/// Requests leave the client queue in order, so each outgoing SUBSCRIBE
/// claims the oldest queued waiter and is then matched by packet id.
#[derive(Default)]
struct SubAckWaiters {
    queued: VecDeque<SubAckReply>,
    in_flight: HashMap<u16, SubAckReply>,
}

impl SubAckWaiters {
    fn sent(&mut self, pkid: u16) {
        if let Some(reply) = self.queued.pop_front() {
            self.in_flight.insert(pkid, reply);
        }
    }

    fn acked(&mut self, pkid: u16, accepted: bool) {
        let Some(reply) = self.in_flight.remove(&pkid) else {
            return;
        };
        let result = if accepted {
            Ok(())
        } else {
            Err(TransportError::new("broker rejected subscription"))
        };
        let _ = reply.send(result);
    }

    fn fail_all(&mut self, reason: &str) {
        let pending = self
            .queued
            .drain(..)
            .chain(self.in_flight.drain().map(|(_, reply)| reply));
        for reply in pending {
            let _ = reply.send(Err(TransportError::new(reason)));
        }
    }
}

type SharedWaiters = Arc<Mutex<SubAckWaiters>>;

fn lock_waiters(waiters: &SharedWaiters) -> MutexGuard<'_, SubAckWaiters> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RumqttTransport {
    client: AsyncClient,
    stopping: Arc<AtomicBool>,
    max_listeners: AtomicUsize,
    waiters: SharedWaiters,
}

impl RumqttTransport {
    pub fn max_listeners(&self) -> usize {
        self.max_listeners.load(Ordering::Relaxed)
    }
}

impl Connector for RumqttConnector {
    type Transport = RumqttTransport;

    fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Self::Transport, TransportError> {
        let (host, port) = parse_broker_url(url)?;
        if options.client_id.is_empty() || options.client_id.starts_with(' ') {
            return Err(TransportError::new(format!(
                "invalid client id {:?}",
                options.client_id
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| TransportError::new(format!("no async runtime available: {err}")))?;

        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive_secs));

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connect_timeout_ms.div_ceil(1_000));
        eventloop.set_network_options(network);

        let stopping = Arc::new(AtomicBool::new(false));
        let waiters = SharedWaiters::default();
        runtime.spawn(drive_event_loop(
            eventloop,
            events,
            stopping.clone(),
            waiters.clone(),
            Duration::from_millis(options.reconnect_period_ms),
        ));

        Ok(RumqttTransport {
            client,
            stopping,
            max_listeners: AtomicUsize::new(0),
            waiters,
        })
    }
}

impl Transport for RumqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|err| TransportError::new(err.to_string()))
    }

    /// Resolves once the broker acknowledges or rejects the subscription.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let (reply, acked) = oneshot::channel();
        {
            let mut waiters = lock_waiters(&self.waiters);
            self.client
                .try_subscribe(topic, QoS::AtMostOnce)
                .map_err(|err| TransportError::new(err.to_string()))?;
            waiters.queued.push_back(reply);
        }

        acked.await.unwrap_or_else(|_| {
            Err(TransportError::new(format!(
                "connection closed before {topic} was acknowledged"
            )))
        })
    }

    async fn end(&self) -> Result<(), TransportError> {
        self.stopping.store(true, Ordering::Release);
        self.client
            .disconnect()
            .await
            .map_err(|err| TransportError::new(format!("disconnect failed: {err}")))
    }

    fn set_max_listeners(&self, limit: usize) {
        debug!("mqtt listener ceiling set to {limit}");
        self.max_listeners.store(limit, Ordering::Relaxed);
    }
}

trait EventSource: Send {
    fn next_event(&mut self) -> impl Future<Output = Result<Event, ConnectionError>> + Send;
}

impl EventSource for EventLoop {
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        self.poll().await
    }
}

#[derive(Debug, PartialEq)]
enum LoopStep {
    Emit(TransportEvent),
    /// Our own DISCONNECT went out; nothing follows.
    Finish,
    SubscribeSent(u16),
    SubscribeAcked { pkid: u16, accepted: bool },
    Ignore,
}

fn map_event(event: Event) -> LoopStep {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                LoopStep::Emit(TransportEvent::Connect)
            } else {
                LoopStep::Emit(TransportEvent::Error(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )))
            }
        }
        Event::Incoming(Packet::Publish(message)) => LoopStep::Emit(TransportEvent::Message {
            topic: message.topic,
            payload: message.payload.to_vec(),
        }),
        Event::Incoming(Packet::SubAck(ack)) => LoopStep::SubscribeAcked {
            pkid: ack.pkid,
            accepted: !ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)),
        },
        Event::Incoming(Packet::Disconnect) => LoopStep::Emit(TransportEvent::End),
        Event::Outgoing(Outgoing::Subscribe(pkid)) => LoopStep::SubscribeSent(pkid),
        Event::Outgoing(Outgoing::Disconnect) => LoopStep::Finish,
        _ => LoopStep::Ignore,
    }
}

async fn drive_event_loop<S: EventSource>(
    mut source: S,
    events: EventSink,
    stopping: Arc<AtomicBool>,
    waiters: SharedWaiters,
    retry_delay: Duration,
) {
    loop {
        match source.next_event().await {
            Ok(event) => match map_event(event) {
                LoopStep::Emit(event) => events.emit(event),
                LoopStep::Finish => break,
                LoopStep::SubscribeSent(pkid) => lock_waiters(&waiters).sent(pkid),
                LoopStep::SubscribeAcked { pkid, accepted } => {
                    if !accepted {
                        warn!("broker rejected subscription (pkid {pkid})");
                    }
                    lock_waiters(&waiters).acked(pkid, accepted);
                }
                LoopStep::Ignore => {}
            },
            Err(err) => {
                lock_waiters(&waiters).fail_all("connection lost before subscription was acknowledged");
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                events.emit(TransportEvent::Error(err.to_string()));
                tokio::time::sleep(retry_delay).await;
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                events.emit(TransportEvent::Reconnect);
            }
        }
    }

    lock_waiters(&waiters).fail_all("connection closed");
    events.emit(TransportEvent::End);
    debug!("mqtt event loop stopped");
}

/// Accepts `mqtt://host[:port]`, `tcp://host[:port]` or bare `host[:port]`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16), TransportError> {
    let trimmed = url.trim();
    let authority = match trimmed.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(TransportError::new(format!(
                "unsupported broker url scheme {scheme:?}"
            )))
        }
        None => trimmed,
    };
    let authority = authority.split('/').next().unwrap_or_default();

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::new(format!("invalid broker port in {url:?}")))?;
            (host, port)
        }
        None => (authority, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(TransportError::new(format!("missing broker host in {url:?}")));
    }
    Ok((host.to_string(), port))
}
