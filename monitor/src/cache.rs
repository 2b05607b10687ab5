//! Per-entity snapshots of REST state, refreshed on invalidation.

use crate::api::{LatestTelemetry, TelemetryApi};
use crate::errors::Result;
use crate::keys::KnownKeys;
use crate::metrics::REST_FAILURES_TOTAL;
use crate::threshold::ThresholdSet;
use crate::topic::EntityRef;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF_MS: u64 = 100;

/// Identifies one cached REST query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    KnownKeys { entity_id: String },
    Threshold { entity_id: String, key: String },
    Thresholds { entity_id: String },
    LatestTelemetry { entity_id: String },
}

impl QueryKey {
    pub fn known_keys(entity_id: &str) -> Self {
        QueryKey::KnownKeys {
            entity_id: entity_id.to_string(),
        }
    }

    pub fn threshold(entity_id: &str, key: &str) -> Self {
        QueryKey::Threshold {
            entity_id: entity_id.to_string(),
            key: key.to_string(),
        }
    }

    pub fn thresholds(entity_id: &str) -> Self {
        QueryKey::Thresholds {
            entity_id: entity_id.to_string(),
        }
    }

    pub fn latest_telemetry(entity_id: &str) -> Self {
        QueryKey::LatestTelemetry {
            entity_id: entity_id.to_string(),
        }
    }

    fn entity_id(&self) -> &str {
        match self {
            QueryKey::KnownKeys { entity_id }
            | QueryKey::Threshold { entity_id, .. }
            | QueryKey::Thresholds { entity_id }
            | QueryKey::LatestTelemetry { entity_id } => entity_id,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::KnownKeys { entity_id } => write!(f, "{}_keys", entity_id),
            QueryKey::Threshold { entity_id, key } => write!(f, "{}_thresholds_{}", entity_id, key),
            QueryKey::Thresholds { entity_id } => write!(f, "{}_thresholds", entity_id),
            QueryKey::LatestTelemetry { entity_id } => write!(f, "{}_latest_telemetry", entity_id),
        }
    }
}

/// Fire-and-forget handle for marking queries stale.
#[derive(Debug, Clone)]
pub struct Invalidator {
    tx: mpsc::UnboundedSender<QueryKey>,
}

impl Invalidator {
    pub fn new(tx: mpsc::UnboundedSender<QueryKey>) -> Self {
        Self { tx }
    }

    pub fn invalidate(&self, key: QueryKey) {
        debug!("Invalidating query {}", key);
        if self.tx.send(key).is_err() {
            debug!("Query cache already stopped");
        }
    }
}

struct Snapshots {
    thresholds: watch::Sender<ThresholdSet>,
    known_keys: watch::Sender<KnownKeys>,
    latest: watch::Sender<Vec<LatestTelemetry>>,
}

/// REST state of one entity, kept current by a background task.
///
/// Snapshots are eventually consistent with the telemetry stream: a
/// message may be processed against a key list or threshold that is
/// already being refetched.
pub struct EntityCache {
    entity: EntityRef,
    invalidator: Invalidator,
    thresholds: watch::Receiver<ThresholdSet>,
    known_keys: watch::Receiver<KnownKeys>,
    latest: watch::Receiver<Vec<LatestTelemetry>>,
    task: JoinHandle<()>,
}

impl EntityCache {
    /// Starts the cache task and schedules the initial load.
    pub fn spawn(api: Arc<dyn TelemetryApi>, entity: EntityRef) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (thresholds_tx, thresholds) = watch::channel(ThresholdSet::default());
        let (keys_tx, known_keys) = watch::channel(KnownKeys::default());
        let (latest_tx, latest) = watch::channel(Vec::new());

        let invalidator = Invalidator::new(tx);
        invalidator.invalidate(QueryKey::known_keys(&entity.entity_id));
        invalidator.invalidate(QueryKey::thresholds(&entity.entity_id));
        invalidator.invalidate(QueryKey::latest_telemetry(&entity.entity_id));

        let snapshots = Snapshots {
            thresholds: thresholds_tx,
            known_keys: keys_tx,
            latest: latest_tx,
        };
        let task = tokio::spawn(run_cache(api, entity.clone(), rx, snapshots));

        Self {
            entity,
            invalidator,
            thresholds,
            known_keys,
            latest,
            task,
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn invalidator(&self) -> Invalidator {
        self.invalidator.clone()
    }

    pub fn thresholds(&self) -> watch::Receiver<ThresholdSet> {
        self.thresholds.clone()
    }

    pub fn known_keys(&self) -> watch::Receiver<KnownKeys> {
        self.known_keys.clone()
    }

    pub fn latest(&self) -> watch::Receiver<Vec<LatestTelemetry>> {
        self.latest.clone()
    }
}

impl Drop for EntityCache {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_cache(
    api: Arc<dyn TelemetryApi>,
    entity: EntityRef,
    mut rx: mpsc::UnboundedReceiver<QueryKey>,
    snapshots: Snapshots,
) {
    info!("Starting query cache for {}", entity);

    while let Some(first) = rx.recv().await {
        // coalesce everything queued since the last refresh
        let mut batch = HashSet::from([first]);
        while let Ok(next) = rx.try_recv() {
            batch.insert(next);
        }
        batch.retain(|key| {
            let ours = key.entity_id() == entity.entity_id;
            if !ours {
                debug!("Ignoring invalidation {} on cache for {}", key, entity);
            }
            ours
        });
        refresh(api.as_ref(), &entity, &batch, &snapshots).await;
    }

    debug!("Query cache for {} stopped", entity);
}

async fn refresh(
    api: &dyn TelemetryApi,
    entity: &EntityRef,
    batch: &HashSet<QueryKey>,
    snapshots: &Snapshots,
) {
    let id = entity.entity_id.as_str();
    let full_thresholds = batch.contains(&QueryKey::thresholds(id));
    let mut single: BTreeSet<String> = batch
        .iter()
        .filter_map(|key| match key {
            QueryKey::Threshold { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect();

    if batch.contains(&QueryKey::known_keys(id)) {
        if let Some(keys) = fetch_with_retry("known keys", || api.known_keys(entity)).await {
            let fresh: KnownKeys = keys.into_iter().collect();
            let previous = snapshots.known_keys.borrow().clone();
            let added: Vec<String> = fresh
                .iter()
                .filter(|key| !previous.contains(key))
                .map(str::to_string)
                .collect();
            debug!("{} known keys for {} ({} new)", fresh.len(), entity, added.len());
            snapshots.known_keys.send_replace(fresh);
            // keys that just appeared may already have a threshold configured
            if !previous.is_empty() {
                single.extend(added);
            }
        }
    }

    if full_thresholds {
        if let Some(all) = fetch_with_retry("thresholds", || api.thresholds(entity)).await {
            debug!("{} thresholds for {}", all.len(), entity);
            snapshots.thresholds.send_replace(all.into_iter().collect());
        }
    } else {
        for key in single {
            let what = QueryKey::threshold(id, &key).to_string();
            if let Some(threshold) = fetch_with_retry(&what, || api.threshold(entity, &key)).await {
                snapshots.thresholds.send_modify(|set| match threshold {
                    Some(t) => set.insert(t),
                    None => {
                        set.remove(&key);
                    }
                });
            }
        }
    }

    if batch.contains(&QueryKey::latest_telemetry(id)) {
        if let Some(latest) =
            fetch_with_retry("latest telemetry", || api.latest_telemetry(entity)).await
        {
            snapshots.latest.send_replace(latest);
        }
    }
}

/// Runs `fetch` up to three times with exponential backoff.
///
/// Returns `None` after the last failure; callers keep their previous
/// snapshot in that case.
async fn fetch_with_retry<T, F, Fut>(what: &str, mut fetch: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match fetch().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Fetched {} after {} attempts", what, attempt);
                }
                return Some(value);
            }
            Err(e) if attempt >= FETCH_ATTEMPTS => {
                REST_FAILURES_TOTAL.inc();
                warn!(
                    "Failed to fetch {} after {} attempts: {}. Keeping previous snapshot",
                    what, attempt, e
                );
                return None;
            }
            Err(e) => {
                let backoff_ms = FETCH_BACKOFF_MS * 2_u64.pow(attempt - 1);
                debug!(
                    "Fetching {} failed (attempt {}/{}): {}. Retrying in {}ms",
                    what, attempt, FETCH_ATTEMPTS, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}
