use crate::api::{LatestTelemetry, TelemetryApi};
use crate::bus::{BrokerEndpoint, BusPool, ConnectionState, Subscription};
use crate::cache::EntityCache;
use crate::decode::DecodeOptions;
use crate::errors::{Error, Result};
use crate::keys::KnownKeys;
use crate::live::{LiveTelemetry, WidgetSnapshot};
use crate::metrics::{DECODE_FAILURES_TOTAL, MESSAGES_TOTAL};
use crate::style::SeriesStyles;
use crate::threshold::ThresholdSet;
use crate::topic::{resolve, TelemetryTopic};
use bytes::Bytes;
use chrono::Utc;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WidgetConfig {
    pub endpoint: BrokerEndpoint,
    pub topic: TelemetryTopic,
    pub capacity: Option<NonZeroUsize>,
    pub decode: DecodeOptions,
    pub styles: SeriesStyles,
    /// How often "N seconds ago" ages are refreshed without new messages
    pub age_tick: Duration,
}

#[derive(Debug)]
pub enum WidgetCommand {
    /// Switch to another entity id of the same entity type.
    Retarget(String),
    Dispose,
}

/// Handle on a running widget task.
pub struct WidgetHandle {
    commands: mpsc::Sender<WidgetCommand>,
    snapshot: watch::Receiver<WidgetSnapshot>,
    task: JoinHandle<()>,
}

impl WidgetHandle {
    pub fn snapshot(&self) -> WidgetSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<WidgetSnapshot> {
        self.snapshot.clone()
    }

    pub async fn retarget(&self, entity_id: &str) -> Result<()> {
        self.commands
            .send(WidgetCommand::Retarget(entity_id.to_string()))
            .await
            .map_err(|_| Error::ChannelSend)
    }

    /// Stops the widget and waits until its subscription is released.
    pub async fn dispose(self) {
        if self.commands.send(WidgetCommand::Dispose).await.is_err() {
            debug!("Widget task already stopped");
        }
        if let Err(e) = self.task.await {
            error!("Widget task failed: {}", e);
        }
    }
}

/// Mounts a widget: subscribes to its topic, starts its query cache and
/// processes messages on a dedicated task.
pub fn spawn_widget(pool: BusPool, api: Arc<dyn TelemetryApi>, config: WidgetConfig) -> WidgetHandle {
    let (commands, rx) = mpsc::channel(8);
    let initial = WidgetSnapshot {
        topic: config.topic.to_string(),
        ..WidgetSnapshot::default()
    };
    let (snapshot_tx, snapshot) = watch::channel(initial);
    let task = tokio::spawn(run_widget(pool, api, config, rx, snapshot_tx));

    WidgetHandle {
        commands,
        snapshot,
        task,
    }
}

/// Everything tied to the widget's current topic.
struct Mounted {
    subscription: Option<Subscription>,
    state: watch::Receiver<ConnectionState>,
    cache: EntityCache,
    thresholds: watch::Receiver<ThresholdSet>,
    known_keys: watch::Receiver<KnownKeys>,
    latest: watch::Receiver<Vec<LatestTelemetry>>,
}

impl Mounted {
    fn mount(
        pool: &BusPool,
        api: &Arc<dyn TelemetryApi>,
        endpoint: &BrokerEndpoint,
        topic: &TelemetryTopic,
    ) -> Self {
        let cache = EntityCache::spawn(Arc::clone(api), topic.entity().clone());
        let subscription = match pool.acquire(endpoint, topic) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                error!("Failed to subscribe to {}: {}", topic, e);
                None
            }
        };
        let state = match &subscription {
            Some(subscription) => subscription.watch_state(),
            None => watch::channel(ConnectionState::Disconnected).1,
        };

        Self {
            subscription,
            state,
            thresholds: cache.thresholds(),
            known_keys: cache.known_keys(),
            latest: cache.latest(),
            cache,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.subscription
            .as_ref()
            .map_or(ConnectionState::Disconnected, Subscription::connection_state)
    }

    /// Drops the subscription, unsubscribing from the broker right away.
    fn release(&mut self) {
        self.subscription = None;
    }
}

enum WidgetEvent {
    Command(Option<WidgetCommand>),
    Message(Option<Bytes>),
    Tick,
    Thresholds,
    KnownKeys,
    Latest,
    Connection,
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<Bytes> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_widget(
    pool: BusPool,
    api: Arc<dyn TelemetryApi>,
    config: WidgetConfig,
    mut commands: mpsc::Receiver<WidgetCommand>,
    snapshot_tx: watch::Sender<WidgetSnapshot>,
) {
    let WidgetConfig {
        endpoint,
        topic,
        capacity,
        decode,
        styles,
        age_tick,
    } = config;

    info!("Mounting widget on {}", topic);
    let mut mounted = Mounted::mount(&pool, &api, &endpoint, &topic);
    let mut live = LiveTelemetry::new(topic, capacity, decode, styles)
        .with_invalidator(mounted.cache.invalidator());
    live.set_connection(mounted.connection_state());

    let mut ticker = tokio::time::interval(age_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let event = tokio::select! {
            command = commands.recv() => WidgetEvent::Command(command),
            message = next_message(&mut mounted.subscription) => WidgetEvent::Message(message),
            _ = ticker.tick() => WidgetEvent::Tick,
            Ok(()) = mounted.thresholds.changed() => WidgetEvent::Thresholds,
            Ok(()) = mounted.known_keys.changed() => WidgetEvent::KnownKeys,
            Ok(()) = mounted.latest.changed() => WidgetEvent::Latest,
            Ok(()) = mounted.state.changed() => WidgetEvent::Connection,
        };

        match event {
            WidgetEvent::Command(None) | WidgetEvent::Command(Some(WidgetCommand::Dispose)) => break,
            WidgetEvent::Command(Some(WidgetCommand::Retarget(entity_id))) => {
                let next = resolve(live.topic().entity().entity_type, &entity_id);
                if next == *live.topic() {
                    continue;
                }
                // the old topic is unsubscribed before the new one is subscribed
                mounted.release();
                mounted = Mounted::mount(&pool, &api, &endpoint, &next);
                live.retarget(next, Some(mounted.cache.invalidator()));
                live.set_connection(mounted.connection_state());
            }
            WidgetEvent::Message(Some(payload)) => {
                MESSAGES_TOTAL.inc();
                match live.handle_message(&payload, Utc::now().timestamp_millis()) {
                    Ok(outcome) => debug!(
                        "{} updated {} key(s), {} unseen",
                        live.topic(),
                        outcome.appended.len(),
                        outcome.new_keys.len()
                    ),
                    Err(e) => {
                        DECODE_FAILURES_TOTAL.inc();
                        warn!("Dropping message on {}: {}", live.topic(), e);
                        continue;
                    }
                }
            }
            WidgetEvent::Message(None) => {
                warn!("Telemetry stream for {} ended, broker unreachable", live.topic());
                mounted.release();
                live.set_connection(ConnectionState::Disconnected);
            }
            WidgetEvent::Tick => {}
            WidgetEvent::Thresholds => {
                let thresholds = mounted.thresholds.borrow_and_update().clone();
                live.apply_thresholds(thresholds);
            }
            WidgetEvent::KnownKeys => {
                let known_keys = mounted.known_keys.borrow_and_update().clone();
                live.apply_known_keys(known_keys);
            }
            WidgetEvent::Latest => {
                let latest = mounted.latest.borrow_and_update().clone();
                live.seed(&latest);
            }
            WidgetEvent::Connection => {
                let state = *mounted.state.borrow_and_update();
                if state == ConnectionState::Disconnected {
                    warn!("{} lost its broker connection", live.topic());
                }
                live.set_connection(state);
            }
        }

        snapshot_tx.send_replace(live.snapshot(Utc::now().timestamp_millis()));
    }

    live.dispose();
    mounted.release();
    live.set_connection(ConnectionState::Disconnected);
    snapshot_tx.send_replace(live.snapshot(Utc::now().timestamp_millis()));
    info!("Widget on {} disposed", live.topic());
}
