//! Resilient broker connection shared by the home-automation nodes.
//!
//! [`ConnectionManager`] owns one transport, follows its lifecycle through a
//! [`LinkTracker`], and gives callers bounded waits instead of failing the
//! moment the broker is briefly unreachable:
//!
//! - `publish` waits up to `ready_timeout_ms` for a connection, then fails.
//! - `subscribe` waits just as long, then tries anyway.
//! - `exit` turns later publishes into no-ops and swallows subscribe errors
//!   caused by the teardown itself.
//!
//! Connection drops are never returned to callers. They show up in the logs
//! and through [`ConnectionManager::connected`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    clock::MonotonicClock,
    config::{LinkConfig, UNRESOLVED_URL},
    error::LinkError,
    link::{LinkSnapshot, LinkTracker, LinkTransition},
    logging::Logger,
    rumqtt::RumqttConnector,
    transport::{ConnectOptions, Connector, EventHandler, EventSink, Transport, TransportEvent},
};

/// Receives `(payload, topic)` for every message on its topic.
pub type MessageHandler = Arc<dyn Fn(&[u8], &str) + Send + Sync>;

pub type MqttConnectionManager = ConnectionManager<RumqttConnector>;

/// Re-issues broker subscriptions for the given topics on the live transport.
type Resubscriber = Arc<dyn Fn(Vec<String>) + Send + Sync>;

struct LinkInner {
    tracker: LinkTracker,
    exit_requested: bool,
    routes: HashMap<String, MessageHandler>,
    max_listeners: usize,
}

/// State shared between the manager and the transport's event callbacks.
struct LinkCore {
    url: String,
    clock: MonotonicClock,
    logger: Arc<dyn Logger>,
    inner: Mutex<LinkInner>,
    resubscriber: Mutex<Option<Resubscriber>>,
}

impl LinkCore {
    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_resubscriber(&self, resubscriber: Resubscriber) {
        *self
            .resubscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(resubscriber);
    }

    /// A fresh broker session has no subscriptions, so every route is bound again.
    fn restore_routes(&self, topics: Vec<String>) {
        let resubscriber = self
            .resubscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match resubscriber {
            Some(resubscribe) => resubscribe(topics),
            None => self
                .logger
                .warn("reconnected without a transport to re-subscribe on"),
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let handler = self.lock().routes.get(topic).cloned();
        match handler {
            Some(handler) => handler(payload, topic),
            None => self
                .logger
                .debug(&format!("no handler bound for message on {topic}")),
        }
    }
}

impl EventHandler for LinkCore {
    fn handle(&self, event: TransportEvent) {
        let now_ms = self.clock.now_ms();
        let url = &self.url;

        match event {
            TransportEvent::Connect => {
                let (transition, topics) = {
                    let mut inner = self.lock();
                    let reconnect = !inner.tracker.is_first_attempt();
                    let transition = inner.tracker.on_connect(now_ms);
                    let topics: Vec<String> = if reconnect {
                        inner.routes.keys().cloned().collect()
                    } else {
                        Vec::new()
                    };
                    (transition, topics)
                };
                match transition {
                    LinkTransition::Recovered { downtime_ms } => self.logger.info(&format!(
                        "reconnected to {url} after {:.1}s",
                        downtime_ms as f64 / 1_000.0
                    )),
                    _ => self.logger.info(&format!("connected to {url}")),
                }
                if !topics.is_empty() {
                    self.restore_routes(topics);
                }
            }
            TransportEvent::Reconnect => {
                let transition = self.lock().tracker.on_reconnect_attempt(now_ms);
                match transition {
                    LinkTransition::LossDetected { loss_count } => self.logger.warn(&format!(
                        "connection to {url} lost, reconnecting (loss count {loss_count})"
                    )),
                    _ => self.logger.debug(&format!("reconnect attempt to {url}")),
                }
            }
            TransportEvent::Error(reason) => {
                let transition = self.lock().tracker.on_error();
                if transition == LinkTransition::Lost {
                    self.logger
                        .error(&format!("connection to {url} lost: {reason}"));
                } else {
                    self.logger.debug(&format!("transport error: {reason}"));
                }
            }
            TransportEvent::End => {
                self.lock().tracker.on_end();
                self.logger.warn(&format!("connection to {url} ended"));
            }
            TransportEvent::Message { topic, payload } => self.dispatch(&topic, &payload),
        }
    }
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: LinkConfig,
    core: Arc<LinkCore>,
    transport: Mutex<Option<Arc<C::Transport>>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        url: impl Into<String>,
        connector: C,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, LinkError> {
        Self::with_config(LinkConfig::new(url), connector, logger)
    }

    pub fn with_config(
        mut config: LinkConfig,
        connector: C,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, LinkError> {
        if config.broker_url == UNRESOLVED_URL || config.broker_url.trim().is_empty() {
            return Err(LinkError::InvalidBrokerUrl(config.broker_url));
        }
        config.sanitize();

        let core = LinkCore {
            url: config.broker_url.clone(),
            clock: MonotonicClock::new(),
            logger,
            inner: Mutex::new(LinkInner {
                tracker: LinkTracker::new(),
                exit_requested: false,
                routes: HashMap::new(),
                max_listeners: config.max_listeners,
            }),
            resubscriber: Mutex::new(None),
        };

        Ok(Self {
            connector,
            config,
            core: Arc::new(core),
            transport: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.broker_url
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn connected(&self) -> bool {
        self.core.lock().tracker.is_connected()
    }

    pub fn exit_requested(&self) -> bool {
        self.core.lock().exit_requested
    }

    pub fn is_reconnecting(&self) -> bool {
        self.core.lock().tracker.is_reconnecting()
    }

    pub fn connection_loss_count(&self) -> u64 {
        self.core.lock().tracker.connection_loss_count()
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        self.core.lock().tracker.snapshot()
    }

    pub fn listener_count(&self) -> usize {
        self.core.lock().routes.len()
    }

    pub fn max_listeners(&self) -> usize {
        self.core.lock().max_listeners
    }

    pub fn set_max_listeners(&self, limit: usize) {
        self.core.lock().max_listeners = limit;
        if let Some(transport) = self.current_transport() {
            transport.set_max_listeners(limit);
        }
    }

    /// Starts connecting without waiting for the broker.
    ///
    /// Failures to set up the transport are logged, never returned.
    pub fn connect(&self) {
        let logger = &self.core.logger;
        // Held until the new transport is stored so concurrent callers open one.
        let mut slot = self.transport_slot();
        if slot.is_some() {
            logger.warn(&format!(
                "connection to {} already started, ignoring connect",
                self.url()
            ));
            return;
        }

        let options = ConnectOptions::from(&self.config);
        let events = EventSink::new(self.core.clone());
        match self.connector.connect(self.url(), &options, events) {
            Ok(transport) => {
                transport.set_max_listeners(self.max_listeners());
                let transport = Arc::new(transport);
                self.core.set_resubscriber(self.resubscriber(&transport));
                *slot = Some(transport);
                logger.debug(&format!("connecting to {}", self.url()));
            }
            Err(err) => {
                logger.error(&format!("failed to start connection to {}: {err}", self.url()));
                logger.trace_stack();
            }
        }
    }

    pub async fn connect_and_wait(&self, timeout_ms: u64) -> Result<(), LinkError> {
        self.connect();
        if self.wait_for_connection(timeout_ms).await {
            return Ok(());
        }

        let transport = self.take_transport();
        if let Some(transport) = transport {
            if let Err(err) = transport.end().await {
                self.core
                    .logger
                    .warn(&format!("failed to end timed out connection: {err}"));
            }
        }

        let err = LinkError::ConnectTimeout {
            waited_ms: timeout_ms,
        };
        self.core.logger.error(&err.to_string());
        Err(err)
    }

    /// Builds the hook that rebinds routes after a reconnect.
    ///
    /// Holds the transport weakly so a replaced or ended transport is skipped.
    fn resubscriber(&self, transport: &Arc<C::Transport>) -> Resubscriber {
        let transport = Arc::downgrade(transport);
        let logger = self.core.logger.clone();
        Arc::new(move |topics: Vec<String>| {
            let Some(transport) = transport.upgrade() else {
                return;
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                logger.error("no async runtime available to re-subscribe on");
                return;
            };
            let logger = logger.clone();
            runtime.spawn(async move {
                logger.info(&format!("re-subscribing to {} topics", topics.len()));
                for topic in topics {
                    if let Err(err) = transport.subscribe(&topic).await {
                        logger.error(&format!("re-subscribe to {topic} failed: {err}"));
                    }
                }
            });
        })
    }

    /// Does nothing once [`exit`](Self::exit) has been requested.
    pub async fn publish(&self, topic: &str, message: impl Into<Vec<u8>>) -> Result<(), LinkError> {
        self.send(topic, message.into(), false).await
    }

    /// Like [`publish`](Self::publish), but the broker keeps the message for
    /// clients that subscribe later.
    pub async fn publish_retained(
        &self,
        topic: &str,
        message: impl Into<Vec<u8>>,
    ) -> Result<(), LinkError> {
        self.send(topic, message.into(), true).await
    }

    async fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), LinkError> {
        if self.exit_requested() {
            return Ok(());
        }

        match self.try_publish(topic, payload, retain).await {
            Ok(()) => Ok(()),
            Err(source) => {
                self.core
                    .logger
                    .error(&format!("publish to {topic} failed: {source}"));
                self.core.logger.trace_stack();
                Err(LinkError::Publish {
                    topic: topic.to_string(),
                    source: Box::new(source),
                })
            }
        }
    }

    async fn try_publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), LinkError> {
        let budget_ms = self.config.ready_timeout_ms;
        if !self.wait_for_connection(budget_ms).await {
            return Err(LinkError::PublishTimeout {
                waited_ms: budget_ms,
            });
        }

        let transport = self.ready()?;
        transport.publish(topic, payload, retain).await?;
        Ok(())
    }

    /// Binds `handler` to `topic`, replacing any earlier handler for it.
    ///
    /// Unlike publish, running out of wait time is not an error on its own.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<(), LinkError>
    where
        F: Fn(&[u8], &str) + Send + Sync + 'static,
    {
        let logger = &self.core.logger;
        if !self.wait_for_connection(self.config.ready_timeout_ms).await {
            logger.warn(&format!(
                "still not connected after {}ms, subscribing to {topic} anyway",
                self.config.ready_timeout_ms
            ));
        }

        let transport = self.ready_for(topic)?;

        if let Err(err) = transport.subscribe(topic).await {
            if self.exit_requested() {
                logger.debug(&format!(
                    "ignoring subscribe failure on {topic} during shutdown: {err}"
                ));
                return Ok(());
            }
            logger.error(&format!("subscribe to {topic} failed: {err}"));
            logger.trace_stack();
            return Err(LinkError::Subscribe {
                topic: topic.to_string(),
                source: err,
            });
        }

        self.ready_for(topic)?;

        let (count, limit) = {
            let mut inner = self.core.lock();
            inner.routes.insert(topic.to_string(), Arc::new(handler));
            (inner.routes.len(), inner.max_listeners)
        };
        if count > limit {
            logger.warn(&format!(
                "{count} message listeners registered, above the limit of {limit}"
            ));
        }
        logger.debug(&format!("subscribed to {topic}"));
        Ok(())
    }

    /// Shuts the connection down. Safe to call repeatedly or before connecting.
    pub async fn exit(&self) {
        let logger = &self.core.logger;
        self.core.lock().exit_requested = true;

        if let Err(err) = self.ready() {
            logger.warn(&format!("exit requested while link is not ready: {err}"));
        }

        let Some(transport) = self.take_transport() else {
            return;
        };
        self.core.lock().tracker.mark_disconnected();

        match transport.end().await {
            Ok(()) => logger.info(&format!("connection to {} closed", self.url())),
            Err(err) => {
                logger.warn(&format!("failed to close connection to {}: {err}", self.url()))
            }
        }
    }

    /// Polls every `poll_interval_ms` until connected or `budget_ms` has passed.
    async fn wait_for_connection(&self, budget_ms: u64) -> bool {
        let step = self.config.poll_interval_ms;
        let mut waited_ms = 0;
        while !self.connected() {
            if waited_ms >= budget_ms {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(step)).await;
            waited_ms += step;
        }
        true
    }

    fn ready(&self) -> Result<Arc<C::Transport>, LinkError> {
        if !self.connected() {
            return Err(LinkError::NotConnected);
        }
        self.current_transport().ok_or(LinkError::NotInitialized)
    }

    fn ready_for(&self, topic: &str) -> Result<Arc<C::Transport>, LinkError> {
        self.ready().map_err(|err| {
            self.core
                .logger
                .error(&format!("cannot subscribe to {topic}: {err}"));
            err
        })
    }

    fn transport_slot(&self) -> MutexGuard<'_, Option<Arc<C::Transport>>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_transport(&self) -> Option<Arc<C::Transport>> {
        self.transport_slot().clone()
    }

    fn take_transport(&self) -> Option<Arc<C::Transport>> {
        self.transport_slot().take()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;
    use tracing::Level;

    use super::*;
    use crate::{error::TransportError, link::ConnectionState, logging::testing::RecordingLogger};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Publish(String, Vec<u8>, bool),
        Subscribe(String),
        End,
        MaxListeners(usize),
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        sink: Arc<Mutex<Option<EventSink>>>,
        calls: Arc<Mutex<Vec<Call>>>,
        connects: Arc<AtomicUsize>,
        auto_connect: bool,
        fail_connect: bool,
        fail_subscribe: bool,
        subscribe_delay_ms: u64,
        connect_delay_ms: u64,
    }

    impl MockConnector {
        fn auto() -> Self {
            Self {
                auto_connect: true,
                ..Self::default()
            }
        }

        fn emit(&self, event: TransportEvent) {
            let sink = self.sink.lock().unwrap().clone();
            sink.expect("connect was not called").emit(event);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, wanted: &Call) -> usize {
            self.calls().iter().filter(|call| *call == wanted).count()
        }

        fn published(&self) -> usize {
            self.calls()
                .iter()
                .filter(|call| matches!(call, Call::Publish(..)))
                .count()
        }
    }

    struct MockTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_subscribe: bool,
        subscribe_delay_ms: u64,
    }

    impl Transport for MockTransport {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            retain: bool,
        ) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Publish(topic.to_string(), payload, retain));
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
            if self.subscribe_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.subscribe_delay_ms)).await;
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Subscribe(topic.to_string()));
            if self.fail_subscribe {
                return Err(TransportError::new("not authorized"));
            }
            Ok(())
        }

        async fn end(&self) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(Call::End);
            Ok(())
        }

        fn set_max_listeners(&self, limit: usize) {
            self.calls.lock().unwrap().push(Call::MaxListeners(limit));
        }
    }

    impl Connector for MockConnector {
        type Transport = MockTransport;

        fn connect(
            &self,
            _url: &str,
            options: &ConnectOptions,
            events: EventSink,
        ) -> Result<MockTransport, TransportError> {
            assert_eq!(options.connect_timeout_ms, 10_000);
            assert_eq!(options.keep_alive_secs, 60);

            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.connect_delay_ms));
            }
            *self.sink.lock().unwrap() = Some(events.clone());
            if self.fail_connect {
                return Err(TransportError::new("connection refused"));
            }
            if self.auto_connect {
                events.emit(TransportEvent::Connect);
            }
            Ok(MockTransport {
                calls: self.calls.clone(),
                fail_subscribe: self.fail_subscribe,
                subscribe_delay_ms: self.subscribe_delay_ms,
            })
        }
    }

    fn manager(
        connector: MockConnector,
    ) -> (Arc<ConnectionManager<MockConnector>>, RecordingLogger) {
        let logger = RecordingLogger::default();
        let manager =
            ConnectionManager::new("mqtt://broker.local", connector, Arc::new(logger.clone()))
                .unwrap();
        (Arc::new(manager), logger)
    }

    type Received = Arc<Mutex<Vec<(Vec<u8>, String)>>>;

    fn recorder() -> (Received, impl Fn(&[u8], &str) + Send + Sync + 'static) {
        let received: Received = Arc::default();
        let sink = received.clone();
        let handler = move |payload: &[u8], topic: &str| {
            sink.lock().unwrap().push((payload.to_vec(), topic.to_string()));
        };
        (received, handler)
    }

    #[test]
    fn rejects_unresolved_url() {
        let logger: Arc<dyn Logger> = Arc::new(RecordingLogger::default());
        let err = ConnectionManager::new("undefined", MockConnector::default(), logger.clone())
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::InvalidBrokerUrl(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);

        assert!(ConnectionManager::new("", MockConnector::default(), logger).is_err());
    }

    #[test]
    fn accepts_any_other_url() {
        let logger: Arc<dyn Logger> = Arc::new(RecordingLogger::default());
        for url in ["mqtt://localhost", "tcp://10.0.0.5:1883", "Undefined", "broker"] {
            let manager = ConnectionManager::new(url, MockConnector::default(), logger.clone());
            assert!(manager.is_ok(), "{url} should be accepted");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_wait_resolves_once_connected() {
        let connector = MockConnector::default();
        let (manager, logger) = manager(connector.clone());

        let emitter = connector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            emitter.emit(TransportEvent::Connect);
        });

        manager.connect_and_wait(1_000).await.unwrap();
        assert!(manager.connected());
        assert!(logger.contains(Level::INFO, "connected to mqtt://broker.local"));
        assert_eq!(connector.count(&Call::MaxListeners(15)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_wait_times_out_and_ends_transport() {
        let connector = MockConnector::default();
        let (manager, _logger) = manager(connector.clone());

        let started = Instant::now();
        let err = manager.connect_and_wait(1_000).await.unwrap_err();

        assert!(matches!(err, LinkError::ConnectTimeout { waited_ms: 1_000 }));
        assert!(err.to_string().contains("1000ms"));
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(connector.count(&Call::End), 1);
        assert!(!manager.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_is_logged_not_raised() {
        let connector = MockConnector {
            fail_connect: true,
            ..MockConnector::default()
        };
        let (manager, logger) = manager(connector);

        manager.connect();

        assert!(!manager.connected());
        assert!(logger.contains(Level::ERROR, "connection refused"));
        assert_eq!(logger.count(Level::TRACE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_ignored() {
        let connector = MockConnector::auto();
        let (manager, logger) = manager(connector.clone());

        manager.connect();
        manager.connect();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(logger.contains(Level::WARN, "already started"));
    }

    #[test]
    fn concurrent_connects_open_one_transport() {
        let connector = MockConnector {
            connect_delay_ms: 100,
            ..MockConnector::default()
        };
        let (manager, logger) = manager(connector.clone());

        std::thread::scope(|scope| {
            scope.spawn(|| manager.connect());
            scope.spawn(|| manager.connect());
        });

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(logger.contains(Level::WARN, "already started"));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_forwards_when_connected() {
        let connector = MockConnector::auto();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();

        manager.publish("home/porch/light", "on").await.unwrap();

        assert!(connector
            .calls()
            .contains(&Call::Publish("home/porch/light".to_string(), b"on".to_vec(), false)));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retained_asks_broker_to_keep_message() {
        let connector = MockConnector::auto();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();

        manager
            .publish_retained("homelink/sensor/status", "online")
            .await
            .unwrap();

        assert_eq!(
            connector.calls().last(),
            Some(&Call::Publish(
                "homelink/sensor/status".to_string(),
                b"online".to_vec(),
                true
            ))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publish_waits_for_late_connection() {
        let connector = MockConnector::default();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();

        let emitter = connector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            emitter.emit(TransportEvent::Connect);
        });

        manager.publish("home/garage/door", "closed").await.unwrap();
        assert_eq!(connector.published(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_fails_after_ready_timeout() {
        let connector = MockConnector::default();
        let (manager, logger) = manager(connector.clone());
        manager.connect();

        let started = Instant::now();
        let err = manager.publish("home/lamp", "on").await.unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(3_000));
        match &err {
            LinkError::Publish { topic, source } => {
                assert_eq!(topic, "home/lamp");
                assert!(matches!(**source, LinkError::PublishTimeout { waited_ms: 3_000 }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.kind(), crate::ErrorKind::Timing);
        assert_eq!(connector.published(), 0);
        assert!(logger.contains(Level::ERROR, "publish to home/lamp failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_reports_missing_transport() {
        let connector = MockConnector {
            fail_connect: true,
            ..MockConnector::default()
        };
        let (manager, _logger) = manager(connector.clone());
        manager.connect();
        connector.emit(TransportEvent::Connect);

        let err = manager.publish("home/lamp", "on").await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::Publish { ref source, .. } if matches!(**source, LinkError::NotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_after_exit_is_a_no_op() {
        let connector = MockConnector::auto();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();
        manager.exit().await;

        let started = Instant::now();
        manager.publish("home/lamp", "on").await.unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(connector.published(), 0);
        assert!(!manager.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_proceeds_after_ready_timeout() {
        let connector = MockConnector::default();
        let (manager, logger) = manager(connector.clone());
        manager.connect();

        let started = Instant::now();
        let err = manager.subscribe("home/+/motion", |_, _| {}).await.unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(3_000));
        assert!(matches!(err, LinkError::NotConnected));
        assert_eq!(err.kind(), crate::ErrorKind::State);
        assert!(logger.contains(Level::WARN, "subscribing to home/+/motion anyway"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_succeeds_if_connection_arrives_late() {
        let connector = MockConnector::default();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();

        let emitter = connector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            emitter.emit(TransportEvent::Connect);
        });

        manager.subscribe("home/hall/motion", |_, _| {}).await.unwrap();
        assert_eq!(connector.count(&Call::Subscribe("home/hall/motion".to_string())), 1);
        assert_eq!(manager.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_reach_only_the_matching_handler() {
        let connector = MockConnector::auto();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();

        let (kitchen, kitchen_handler) = recorder();
        let (hall, hall_handler) = recorder();
        manager.subscribe("home/kitchen/temp", kitchen_handler).await.unwrap();
        manager.subscribe("home/hall/temp", hall_handler).await.unwrap();

        connector.emit(TransportEvent::Message {
            topic: "home/kitchen/temp".to_string(),
            payload: b"21.5".to_vec(),
        });
        connector.emit(TransportEvent::Message {
            topic: "home/attic/temp".to_string(),
            payload: b"30.0".to_vec(),
        });

        assert_eq!(
            kitchen.lock().unwrap().clone(),
            vec![(b"21.5".to_vec(), "home/kitchen/temp".to_string())]
        );
        assert!(hall.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_subscribe_wins_per_topic() {
        let connector = MockConnector::auto();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();

        let (first, first_handler) = recorder();
        let (second, second_handler) = recorder();
        manager.subscribe("home/door", first_handler).await.unwrap();
        manager.subscribe("home/door", second_handler).await.unwrap();

        connector.emit(TransportEvent::Message {
            topic: "home/door".to_string(),
            payload: b"open".to_vec(),
        });

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
        assert_eq!(manager.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_error_propagates() {
        let connector = MockConnector {
            auto_connect: true,
            fail_subscribe: true,
            ..MockConnector::default()
        };
        let (manager, logger) = manager(connector);
        manager.connect();

        let err = manager.subscribe("home/vault", |_, _| {}).await.unwrap_err();
        assert!(matches!(err, LinkError::Subscribe { ref topic, .. } if topic == "home/vault"));
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
        assert!(logger.contains(Level::ERROR, "not authorized"));
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_error_is_swallowed_during_exit() {
        let connector = MockConnector {
            auto_connect: true,
            fail_subscribe: true,
            subscribe_delay_ms: 500,
            ..MockConnector::default()
        };
        let (manager, _logger) = manager(connector);
        manager.connect();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.subscribe("home/vault", |_, _| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.exit().await;

        pending.await.unwrap().unwrap();
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_limit_is_forwarded_and_enforced_by_warning() {
        let connector = MockConnector::auto();
        let (manager, logger) = manager(connector.clone());
        manager.connect();
        manager.set_max_listeners(2);

        for topic in ["home/a", "home/b", "home/c"] {
            manager.subscribe(topic, |_, _| {}).await.unwrap();
        }

        assert_eq!(connector.count(&Call::MaxListeners(2)), 1);
        assert_eq!(manager.max_listeners(), 2);
        assert!(logger.contains(Level::WARN, "above the limit of 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn loss_and_recovery_sequence() {
        let connector = MockConnector::auto();
        let (manager, logger) = manager(connector.clone());
        manager.connect();
        assert!(manager.connected());

        connector.emit(TransportEvent::Error("connection reset by peer".to_string()));
        assert!(!manager.connected());
        assert!(logger.contains(Level::ERROR, "connection reset by peer"));

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        connector.emit(TransportEvent::Reconnect);
        assert_eq!(manager.connection_loss_count(), 2);
        assert!(manager.is_reconnecting());

        connector.emit(TransportEvent::Reconnect);
        assert_eq!(manager.connection_loss_count(), 2);

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        connector.emit(TransportEvent::Connect);
        assert!(manager.connected());
        assert!(!manager.is_reconnecting());
        assert_eq!(manager.connection_loss_count(), 2);
        assert!(logger.contains(Level::INFO, "reconnected to mqtt://broker.local after 4.0s"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_restored_after_reconnect() {
        let connector = MockConnector::auto();
        let (manager, logger) = manager(connector.clone());
        manager.connect();
        manager.subscribe("home/hall/motion", |_, _| {}).await.unwrap();
        manager.subscribe("home/porch/light", |_, _| {}).await.unwrap();

        connector.emit(TransportEvent::Error("connection reset by peer".to_string()));
        connector.emit(TransportEvent::Reconnect);
        connector.emit(TransportEvent::Connect);
        tokio::time::sleep(Duration::from_millis(10)).await;

        for topic in ["home/hall/motion", "home/porch/light"] {
            assert_eq!(connector.count(&Call::Subscribe(topic.to_string())), 2);
        }
        assert!(logger.contains(Level::INFO, "re-subscribing to 2 topics"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resubscribe_is_logged() {
        let connector = MockConnector::auto();
        let (manager, logger) = manager(connector.clone());
        manager.connect();
        manager.subscribe("home/vault", |_, _| {}).await.unwrap();

        let rejecting = Arc::new(MockTransport {
            calls: connector.calls.clone(),
            fail_subscribe: true,
            subscribe_delay_ms: 0,
        });
        manager.core.set_resubscriber(manager.resubscriber(&rejecting));

        connector.emit(TransportEvent::Error("broker restarted".to_string()));
        connector.emit(TransportEvent::Reconnect);
        connector.emit(TransportEvent::Connect);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(logger.contains(Level::ERROR, "re-subscribe to home/vault failed"));
        assert!(manager.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn end_event_marks_disconnected_with_warning() {
        let connector = MockConnector::auto();
        let (manager, logger) = manager(connector.clone());
        manager.connect();

        connector.emit(TransportEvent::End);

        assert!(!manager.connected());
        assert!(logger.contains(Level::WARN, "ended"));
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_is_idempotent() {
        let connector = MockConnector::auto();
        let (manager, _logger) = manager(connector.clone());
        manager.connect();

        manager.exit().await;
        let after_first = manager.snapshot();
        manager.exit().await;

        assert_eq!(manager.snapshot(), after_first);
        assert_eq!(after_first.state, ConnectionState::Disconnected);
        assert!(manager.exit_requested());
        assert_eq!(connector.count(&Call::End), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exit_before_connect_is_safe() {
        let (manager, logger) = manager(MockConnector::default());
        manager.exit().await;

        assert!(!manager.connected());
        assert!(logger.contains(Level::WARN, "no active connection"));
    }
}
