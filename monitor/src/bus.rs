//! Shared MQTT connections with reference-counted topic subscriptions.
//!
//! Every broker endpoint gets at most one live connection. Widgets acquire a
//! [`Subscription`] per topic; the broker SUBSCRIBE goes out for the first
//! subscriber of a topic and the UNSUBSCRIBE after the last one is dropped.
//! When the last subscription of a connection is dropped the connection is
//! closed and its network task stops.

use crate::errors::{Error, Result};
use crate::metrics::{ACTIVE_SUBSCRIPTIONS, DROPPED_MESSAGES_TOTAL, RECONNECTS_TOTAL};
use crate::topic::TelemetryTopic;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Subscribed,
}

impl ConnectionState {
    /// True once the broker acknowledged the connection.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Subscribing | ConnectionState::Subscribed
        )
    }
}

/// Reconnect schedule after connection loss.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before giving up; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `failure`-th consecutive failure
    /// (1-based), or `None` when the policy is exhausted.
    pub fn backoff(&self, failure: u32) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if failure > max {
                return None;
            }
        }
        let factor = 2_u32.saturating_pow(failure.saturating_sub(1));
        Some(self.initial_backoff.saturating_mul(factor).min(self.max_backoff))
    }
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub client_prefix: String,
    pub keep_alive: Duration,
    /// Capacity of the request queue towards the network task
    pub request_capacity: usize,
    /// Capacity of each subscriber's message channel
    pub channel_capacity: NonZeroUsize,
    pub retry: RetryPolicy,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            client_prefix: "monitor".to_string(),
            keep_alive: Duration::from_secs(30),
            request_capacity: 100,
            channel_capacity: NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Route {
    subscribers: HashMap<u64, mpsc::Sender<Bytes>>,
}

/// Routing table and state shared between handles and the network task.
struct Shared {
    routes: Mutex<HashMap<String, Route>>,
    state: watch::Sender<ConnectionState>,
    pending_acks: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            routes: Mutex::new(HashMap::new()),
            state,
            pending_acks: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the subscriber id and whether the caller must send the broker
    /// SUBSCRIBE itself.
    ///
    /// The state is read under the routes lock, the same lock `on_connected`
    /// holds while it snapshots the topics and leaves `Connecting`. A new
    /// topic is therefore either in that snapshot or sees an established
    /// connection.
    fn add_subscriber(&self, topic: &str, tx: mpsc::Sender<Bytes>) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.routes();
        let route = routes.entry(topic.to_string()).or_default();
        let first = route.subscribers.is_empty();
        route.subscribers.insert(id, tx);
        (id, first && self.state().is_established())
    }

    /// Returns true when the last subscriber of `topic` left.
    fn remove_subscriber(&self, topic: &str, id: u64) -> bool {
        let mut routes = self.routes();
        let Some(route) = routes.get_mut(topic) else {
            return false;
        };
        if route.subscribers.remove(&id).is_none() || !route.subscribers.is_empty() {
            return false;
        }
        routes.remove(topic);
        true
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.routes()
            .get(topic)
            .map_or(0, |route| route.subscribers.len())
    }

    fn dispatch(&self, topic: &str, payload: Bytes) -> usize {
        let routes = self.routes();
        let Some(route) = routes.get(topic) else {
            debug!("No subscriber for topic {}", topic);
            return 0;
        };

        let mut delivered = 0;
        for tx in route.subscribers.values() {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    DROPPED_MESSAGES_TOTAL.inc();
                    warn!("Subscriber channel full on {}, dropping message", topic);
                }
                // receiver is being dropped, its release is on the way
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Moves to `Connected` and returns the topics to subscribe again.
    fn on_connected(&self) -> Vec<String> {
        let routes = self.routes();
        let topics: Vec<String> = routes.keys().cloned().collect();
        self.pending_acks.store(topics.len(), Ordering::Release);
        if topics.is_empty() {
            self.set_state(ConnectionState::Connected);
        } else {
            self.set_state(ConnectionState::Subscribing);
        }
        drop(routes);
        topics
    }

    fn on_subscribe_sent(&self) {
        self.pending_acks.fetch_add(1, Ordering::AcqRel);
        self.set_state(ConnectionState::Subscribing);
    }

    fn on_suback(&self) {
        let remaining = self
            .pending_acks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map_or(0, |prev| prev.saturating_sub(1));
        if remaining == 0 && self.state() == ConnectionState::Subscribing {
            self.set_state(ConnectionState::Subscribed);
        }
    }

    fn on_disconnected(&self) {
        self.pending_acks.store(0, Ordering::Release);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Ends every subscriber stream.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.routes().clear();
        self.on_disconnected();
    }
}

struct BusConnection {
    client: AsyncClient,
    shared: Arc<Shared>,
    shutdown: Arc<Notify>,
}

impl BusConnection {
    fn open(endpoint: &BrokerEndpoint, options: &BusOptions) -> Arc<Self> {
        let client_id = format!("{}-{}", options.client_prefix, uuid::Uuid::new_v4());
        let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.request_capacity);
        let shared = Arc::new(Shared::new());
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&shared),
            Arc::clone(&shutdown),
            options.retry.clone(),
            endpoint.clone(),
        ));

        Arc::new(Self {
            client,
            shared,
            shutdown,
        })
    }

    fn subscribe(
        self: &Arc<Self>,
        topic: &TelemetryTopic,
        capacity: NonZeroUsize,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(capacity.get());
        let (id, send_subscribe) = self.shared.add_subscriber(topic.as_str(), tx);

        // Until CONNACK the network task subscribes every routed topic itself.
        if send_subscribe {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                self.shared.remove_subscriber(topic.as_str(), id);
                return Err(Error::Mqtt(e));
            }
            self.shared.on_subscribe_sent();
            info!("Subscribed to {}", topic);
        }

        ACTIVE_SUBSCRIPTIONS.inc();
        Ok(Subscription {
            id,
            topic: topic.clone(),
            rx,
            state: self.shared.state.subscribe(),
            connection: Arc::clone(self),
        })
    }

    fn release(&self, topic: &str, id: u64) {
        ACTIVE_SUBSCRIPTIONS.dec();
        if self.shared.remove_subscriber(topic, id) && self.shared.state().is_established() {
            debug!("Unsubscribing from {}", topic);
            if let Err(e) = self.client.try_unsubscribe(topic) {
                warn!("Failed to unsubscribe from {}: {}", topic, e);
            }
        }
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        if self.shared.state().is_established() {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to request broker disconnect: {}", e);
            }
        }
        self.shutdown.notify_one();
    }
}

/// A widget's hold on one topic.
///
/// Dropping it unsubscribes (when it was the topic's last subscriber) and,
/// when it was the connection's last subscription, disconnects.
pub struct Subscription {
    id: u64,
    topic: TelemetryTopic,
    rx: mpsc::Receiver<Bytes>,
    state: watch::Receiver<ConnectionState>,
    connection: Arc<BusConnection>,
}

impl Subscription {
    pub fn topic(&self) -> &TelemetryTopic {
        &self.topic
    }

    /// Next raw payload; `None` once the connection gave up.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connection.release(self.topic.as_str(), self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic.as_str())
            .finish()
    }
}

/// Connections keyed by broker endpoint.
#[derive(Clone)]
pub struct BusPool {
    options: Arc<BusOptions>,
    connections: Arc<Mutex<HashMap<BrokerEndpoint, Weak<BusConnection>>>>,
}

impl BusPool {
    pub fn new(options: BusOptions) -> Self {
        Self {
            options: Arc::new(options),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribes to `topic`, opening the endpoint's connection if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire(&self, endpoint: &BrokerEndpoint, topic: &TelemetryTopic) -> Result<Subscription> {
        let connection = self.connection(endpoint);
        connection.subscribe(topic, self.options.channel_capacity)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<BrokerEndpoint, Weak<BusConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connection(&self, endpoint: &BrokerEndpoint) -> Arc<BusConnection> {
        let mut connections = self.connections();
        connections.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = connections.get(endpoint).and_then(Weak::upgrade) {
            if !existing.shared.is_closed() {
                return existing;
            }
        }

        info!("Opening broker connection to {}", endpoint);
        let connection = BusConnection::open(endpoint, &self.options);
        connections.insert(endpoint.clone(), Arc::downgrade(&connection));
        connection
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of subscriptions currently held on `topic` at `endpoint`.
    pub fn subscriber_count(&self, endpoint: &BrokerEndpoint, topic: &TelemetryTopic) -> usize {
        self.connections()
            .get(endpoint)
            .and_then(Weak::upgrade)
            .map_or(0, |conn| conn.shared.subscriber_count(topic.as_str()))
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    shutdown: Arc<Notify>,
    retry: RetryPolicy,
    endpoint: BrokerEndpoint,
) {
    info!("Connecting to MQTT broker at {}", endpoint);
    shared.set_state(ConnectionState::Connecting);
    let mut failures = 0_u32;

    loop {
        let event = tokio::select! {
            _ = shutdown.notified() => {
                drain(&mut eventloop, &shared).await;
                break;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                let topics = shared.on_connected();
                info!(
                    "Connected to broker {}, subscribing {} topic(s)",
                    endpoint,
                    topics.len()
                );
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        error!("Failed to subscribe to {}: {}", topic, e);
                        shared.on_suback();
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => shared.on_suback(),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                shared.dispatch(&publish.topic, publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                shared.on_disconnected();
                failures += 1;

                let Some(delay) = retry.backoff(failures) else {
                    error!(
                        "Giving up on broker {} after {} consecutive failures: {}",
                        endpoint, failures, e
                    );
                    shared.close();
                    break;
                };

                RECONNECTS_TOTAL.inc();
                warn!(
                    "Broker {} connection error (attempt {}): {}. Reconnecting in {:?}",
                    endpoint, failures, e, delay
                );
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                shared.set_state(ConnectionState::Connecting);
            }
        }
    }

    shared.on_disconnected();
    debug!("Connection task for {} stopped", endpoint);
}

/// Flushes a requested DISCONNECT to the broker.
async fn drain(eventloop: &mut EventLoop, shared: &Shared) {
    if !shared.state().is_established() {
        return;
    }
    let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("Timed out flushing broker disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::{resolve, EntityType};

    fn unreachable_endpoint() -> BrokerEndpoint {
        BrokerEndpoint::new("127.0.0.1", 1)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            max_retries: None,
        };
        let delays: Vec<u64> = (1..=6)
            .map(|n| policy.backoff(n).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert!(policy.backoff(u32::MAX).is_some());
    }

    #[test]
    fn test_backoff_exhausts() {
        let policy = RetryPolicy {
            max_retries: Some(2),
            ..RetryPolicy::default()
        };
        assert!(policy.backoff(2).is_some());
        assert!(policy.backoff(3).is_none());
    }

    #[test]
    fn test_established_states() {
        assert!(!ConnectionState::Disconnected.is_established());
        assert!(!ConnectionState::Connecting.is_established());
        assert!(ConnectionState::Connected.is_established());
        assert!(ConnectionState::Subscribing.is_established());
        assert!(ConnectionState::Subscribed.is_established());
    }

    #[test]
    fn test_routes_are_reference_counted() {
        let shared = Shared::new();
        shared.on_connected();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);

        let (id1, first1) = shared.add_subscriber("assets/a1/telemetry", tx1);
        let (id2, first2) = shared.add_subscriber("assets/a1/telemetry", tx2);
        assert!(first1);
        assert!(!first2);
        assert_eq!(shared.subscriber_count("assets/a1/telemetry"), 2);

        let delivered = shared.dispatch("assets/a1/telemetry", Bytes::from_static(b"{}"));
        assert_eq!(delivered, 2);
        assert_eq!(rx1.try_recv().unwrap(), Bytes::from_static(b"{}"));
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"{}"));

        assert!(!shared.remove_subscriber("assets/a1/telemetry", id1));
        assert!(shared.remove_subscriber("assets/a1/telemetry", id2));
        assert_eq!(shared.subscriber_count("assets/a1/telemetry"), 0);
        // second removal is a no-op
        assert!(!shared.remove_subscriber("assets/a1/telemetry", id2));
    }

    #[test]
    fn test_dispatch_is_per_topic() {
        let shared = Shared::new();
        let (tx, mut rx) = mpsc::channel(4);
        shared.add_subscriber("devices/d1/telemetry", tx);

        assert_eq!(shared.dispatch("devices/d2/telemetry", Bytes::from_static(b"{}")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_channel_drops() {
        let shared = Shared::new();
        let (tx, mut rx) = mpsc::channel(1);
        shared.add_subscriber("assets/a1/telemetry", tx);

        assert_eq!(shared.dispatch("assets/a1/telemetry", Bytes::from_static(b"1")), 1);
        assert_eq!(shared.dispatch("assets/a1/telemetry", Bytes::from_static(b"2")), 0);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"1"));
    }

    #[test]
    fn test_subscription_state_machine() {
        let shared = Shared::new();
        let mut state = shared.state.subscribe();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);

        let (tx, _rx) = mpsc::channel(1);
        shared.add_subscriber("assets/a1/telemetry", tx);
        let (tx, _rx2) = mpsc::channel(1);
        shared.add_subscriber("assets/a2/telemetry", tx);

        let mut topics = shared.on_connected();
        topics.sort();
        assert_eq!(topics, vec!["assets/a1/telemetry", "assets/a2/telemetry"]);
        assert_eq!(shared.state(), ConnectionState::Subscribing);

        shared.on_suback();
        assert_eq!(shared.state(), ConnectionState::Subscribing);
        shared.on_suback();
        assert_eq!(shared.state(), ConnectionState::Subscribed);

        shared.on_disconnected();
        assert_eq!(shared.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connected_without_topics() {
        let shared = Shared::new();
        assert!(shared.on_connected().is_empty());
        assert_eq!(shared.state(), ConnectionState::Connected);

        shared.on_subscribe_sent();
        assert_eq!(shared.state(), ConnectionState::Subscribing);
        shared.on_suback();
        assert_eq!(shared.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn test_topic_added_before_connack_is_resubscribed() {
        let shared = Shared::new();
        shared.set_state(ConnectionState::Connecting);

        // not established yet, the network task owns the SUBSCRIBE
        let (tx, _rx) = mpsc::channel(1);
        let (_, send_subscribe) = shared.add_subscriber("assets/a1/telemetry", tx);
        assert!(!send_subscribe);
        assert_eq!(shared.on_connected(), vec!["assets/a1/telemetry"]);

        // after CONNACK the caller owns it
        let (tx, _rx2) = mpsc::channel(1);
        let (_, send_subscribe) = shared.add_subscriber("assets/a2/telemetry", tx);
        assert!(send_subscribe);
    }

    #[test]
    fn test_concurrent_subscribe_and_connack_never_lose_a_topic() {
        for _ in 0..200 {
            let shared = Arc::new(Shared::new());
            shared.set_state(ConnectionState::Connecting);

            let adder = {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let (tx, rx) = mpsc::channel(1);
                    let (_, send_subscribe) = shared.add_subscriber("assets/a1/telemetry", tx);
                    (send_subscribe, rx)
                })
            };
            let resubscribed = shared.on_connected();
            let (send_subscribe, _rx) = adder.join().unwrap();

            let in_snapshot = resubscribed.iter().any(|t| t == "assets/a1/telemetry");
            assert!(
                in_snapshot != send_subscribe,
                "topic must be subscribed exactly once by one side"
            );
        }
    }

    #[test]
    fn test_close_ends_streams() {
        let shared = Shared::new();
        let (tx, mut rx) = mpsc::channel(1);
        shared.add_subscriber("assets/a1/telemetry", tx);

        shared.close();
        assert!(shared.is_closed());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_pool_shares_one_connection() {
        let pool = BusPool::new(BusOptions {
            retry: RetryPolicy {
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                max_retries: None,
            },
            ..BusOptions::default()
        });
        let endpoint = unreachable_endpoint();
        let topic = resolve(EntityType::Assets, "a1");
        let other = resolve(EntityType::Assets, "a2");

        let first = pool.acquire(&endpoint, &topic).unwrap();
        let second = pool.acquire(&endpoint, &topic).unwrap();
        let third = pool.acquire(&endpoint, &other).unwrap();

        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.subscriber_count(&endpoint, &topic), 2);
        assert_eq!(pool.subscriber_count(&endpoint, &other), 1);
        assert!(!first.connection_state().is_established());

        drop(first);
        assert_eq!(pool.subscriber_count(&endpoint, &topic), 1);

        drop(second);
        drop(third);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_ends_when_retries_exhausted() {
        let pool = BusPool::new(BusOptions {
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(10),
                max_retries: Some(1),
            },
            ..BusOptions::default()
        });
        let endpoint = unreachable_endpoint();
        let topic = resolve(EntityType::Devices, "d1");

        let mut subscription = pool.acquire(&endpoint, &topic).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
            .await
            .expect("subscription should end after retries are exhausted");
        assert!(next.is_none());
        assert_eq!(subscription.connection_state(), ConnectionState::Disconnected);

        // a closed connection is replaced on the next acquire
        let fresh = pool.acquire(&endpoint, &topic).unwrap();
        assert_eq!(pool.subscriber_count(&endpoint, &topic), 1);
        drop(fresh);
    }
}
