use crate::api::LatestTelemetry;
use crate::bus::ConnectionState;
use crate::cache::{Invalidator, QueryKey};
use crate::decode::{decode, numeric, DecodeError, DecodeOptions};
use crate::keys::{check_new_keys, KnownKeys};
use crate::metrics::{KEY_INVALIDATIONS_TOTAL, OUT_OF_BAND_TOTAL, POINTS_APPENDED_TOTAL};
use crate::series::{SeriesAccumulator, TelemetryPoint};
use crate::style::SeriesStyles;
use crate::threshold::{evaluate, highlight_color, Evaluation, ThresholdSet};
use crate::topic::TelemetryTopic;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use tracing::{debug, info, warn};

/// What a single message changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOutcome {
    pub appended: Vec<String>,
    pub new_keys: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesView {
    pub key: String,
    pub label: String,
    pub latest: Option<TelemetryPoint>,
    pub age_secs: Option<u64>,
    pub points: usize,
    pub in_band: bool,
    pub color: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WidgetSnapshot {
    pub topic: String,
    pub connection: ConnectionState,
    pub series: Vec<SeriesView>,
    pub generated_at: i64,
}

/// State of one live telemetry widget.
///
/// Owns the series buffers of the widget's topic together with the latest
/// REST snapshots (thresholds, known keys) they are evaluated against.
pub struct LiveTelemetry {
    topic: TelemetryTopic,
    series: SeriesAccumulator,
    capacity: Option<NonZeroUsize>,
    thresholds: ThresholdSet,
    known_keys: KnownKeys,
    styles: SeriesStyles,
    options: DecodeOptions,
    invalidator: Option<Invalidator>,
    out_of_band: HashSet<String>,
    connection: ConnectionState,
    disposed: bool,
}

impl LiveTelemetry {
    pub fn new(
        topic: TelemetryTopic,
        capacity: Option<NonZeroUsize>,
        options: DecodeOptions,
        styles: SeriesStyles,
    ) -> Self {
        Self {
            topic,
            series: SeriesAccumulator::new(capacity),
            capacity,
            thresholds: ThresholdSet::default(),
            known_keys: KnownKeys::default(),
            styles,
            options,
            invalidator: None,
            out_of_band: HashSet::new(),
            connection: ConnectionState::Disconnected,
            disposed: false,
        }
    }

    pub fn with_invalidator(mut self, invalidator: Invalidator) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn topic(&self) -> &TelemetryTopic {
        &self.topic
    }

    pub fn series(&self) -> &SeriesAccumulator {
        &self.series
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Decodes a bus payload received at `now_ms` and merges it into the series.
    ///
    /// A disposed widget ignores every message.
    pub fn handle_message(
        &mut self,
        payload: &[u8],
        now_ms: i64,
    ) -> Result<MessageOutcome, DecodeError> {
        if self.disposed {
            debug!("Ignoring message for disposed widget on {}", self.topic);
            return Ok(MessageOutcome::default());
        }

        let decoded = decode(payload)?;

        let new_keys = check_new_keys(decoded.keys(), &self.known_keys);
        if !new_keys.is_empty() {
            debug!("Unseen keys {:?} on {}", new_keys, self.topic);
            if let Some(invalidator) = &self.invalidator {
                KEY_INVALIDATIONS_TOTAL.inc();
                invalidator.invalidate(QueryKey::known_keys(&self.topic.entity().entity_id));
            }
        }

        let mut appended = Vec::new();
        for (key, value) in decoded.measurements(&self.options) {
            self.series.append(key, TelemetryPoint::new(now_ms, value));
            appended.push(key.to_string());
        }
        POINTS_APPENDED_TOTAL.inc_by(appended.len() as f64);

        for key in &appended {
            self.track_band(key);
        }

        Ok(MessageOutcome { appended, new_keys })
    }

    /// Seeds series from stored values; only points newer than what a key
    /// already holds are appended.
    pub fn seed(&mut self, latest: &[LatestTelemetry]) {
        if self.disposed {
            return;
        }
        for entry in latest {
            let Some(value) = numeric(&entry.value, &self.options) else {
                continue;
            };
            let point = TelemetryPoint::new(entry.timestamp.timestamp_millis(), value);
            let newer = self
                .series
                .latest(&entry.key)
                .map_or(true, |current| point.timestamp > current.timestamp);
            if newer {
                self.series.append(&entry.key, point);
                self.track_band(&entry.key);
            }
        }
    }

    pub fn apply_thresholds(&mut self, thresholds: ThresholdSet) {
        if self.disposed {
            return;
        }
        self.thresholds = thresholds;
        let keys: Vec<String> = self.series.keys().map(str::to_string).collect();
        for key in keys {
            self.track_band(&key);
        }
    }

    pub fn apply_known_keys(&mut self, known_keys: KnownKeys) {
        if !self.disposed {
            self.known_keys = known_keys;
        }
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            debug!("{} connection {:?} -> {:?}", self.topic, self.connection, state);
            self.connection = state;
        }
    }

    pub fn latest(&self, key: &str) -> Option<TelemetryPoint> {
        self.series.latest(key)
    }

    pub fn evaluate(&self, key: &str) -> Option<Evaluation> {
        let latest = self.series.latest(key)?;
        Some(evaluate(&latest, self.thresholds.get(key)))
    }

    /// Points the widget at another entity; all per-entity state is dropped.
    pub fn retarget(&mut self, topic: TelemetryTopic, invalidator: Option<Invalidator>) {
        info!("Retargeting widget from {} to {}", self.topic, topic);
        self.topic = topic;
        self.series = SeriesAccumulator::new(self.capacity);
        self.thresholds = ThresholdSet::default();
        self.known_keys = KnownKeys::default();
        self.out_of_band.clear();
        self.invalidator = invalidator;
        self.connection = ConnectionState::Disconnected;
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.invalidator = None;
    }

    /// Renders the widget, with ages computed against `now_ms`.
    pub fn snapshot(&self, now_ms: i64) -> WidgetSnapshot {
        let mut keys: Vec<&str> = self.series.keys().collect();
        keys.sort_unstable();

        let series = keys
            .into_iter()
            .map(|key| {
                let latest = self.series.latest(key);
                let evaluation = self.evaluate(key).unwrap_or(Evaluation { in_band: true });
                SeriesView {
                    key: key.to_string(),
                    label: self.styles.label_for(key),
                    latest,
                    age_secs: self.series.age_of(key, now_ms).map(|age| age.as_secs()),
                    points: self.series.get(key).map_or(0, |buffer| buffer.len()),
                    in_band: evaluation.in_band,
                    color: highlight_color(evaluation, self.styles.color_for(key)).to_string(),
                }
            })
            .collect();

        WidgetSnapshot {
            topic: self.topic.to_string(),
            connection: self.connection,
            series,
            generated_at: now_ms,
        }
    }

    fn track_band(&mut self, key: &str) {
        let Some(evaluation) = self.evaluate(key) else {
            return;
        };
        let was_out = self.out_of_band.contains(key);
        if !evaluation.in_band && !was_out {
            OUT_OF_BAND_TOTAL.inc();
            if let (Some(latest), Some(band)) = (self.series.latest(key), self.thresholds.get(key)) {
                warn!(
                    "{} on {} out of band: {} not in [{}, {}]",
                    key, self.topic, latest.value, band.min, band.max
                );
            }
            self.out_of_band.insert(key.to_string());
        } else if evaluation.in_band && was_out {
            info!("{} on {} back in band", key, self.topic);
            self.out_of_band.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::{ALERT_COLOR, DEFAULT_COLOR};
    use crate::threshold::Threshold;
    use crate::topic::{resolve, EntityType};
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    fn widget() -> LiveTelemetry {
        LiveTelemetry::new(
            resolve(EntityType::Assets, "a1"),
            None,
            DecodeOptions::default(),
            SeriesStyles::default(),
        )
    }

    #[test]
    fn test_messages_update_only_their_keys() {
        let mut live = widget();

        live.handle_message(br#"{"temperature": 22.5}"#, 1000).unwrap();
        assert_eq!(live.latest("temperature"), Some(TelemetryPoint::new(1000, 22.5)));

        live.handle_message(br#"{"humidity": 55}"#, 2000).unwrap();
        assert_eq!(live.latest("temperature"), Some(TelemetryPoint::new(1000, 22.5)));
        assert_eq!(live.latest("humidity"), Some(TelemetryPoint::new(2000, 55.0)));
    }

    #[test]
    fn test_malformed_payload_leaves_series_untouched() {
        let mut live = widget();
        live.handle_message(br#"{"pH": 6.5}"#, 1000).unwrap();

        let payloads: [&[u8]; 4] = [b"{not json", b"", b"\xff\xfe", b"[1,2]"];
        for payload in payloads {
            assert!(live.handle_message(payload, 2000).is_err());
        }
        assert_eq!(live.series().get("pH").unwrap().len(), 1);
        assert_eq!(live.series().len(), 1);
    }

    #[test]
    fn test_disposed_widget_ignores_messages() {
        let mut live = widget();
        live.handle_message(br#"{"temperature": 20}"#, 1000).unwrap();
        live.dispose();

        let outcome = live.handle_message(br#"{"temperature": 30, "AQI": 12}"#, 2000).unwrap();
        assert!(outcome.appended.is_empty());
        assert_eq!(live.latest("temperature"), Some(TelemetryPoint::new(1000, 20.0)));
        assert!(live.latest("AQI").is_none());
        assert_eq!(live.series().get("temperature").unwrap().len(), 1);
    }

    #[test]
    fn test_zero_and_text_values_are_not_appended() {
        let mut live = widget();
        let outcome = live
            .handle_message(br#"{"AQI": 0, "status": "ok", "pH": 7.1}"#, 500)
            .unwrap();
        assert_eq!(outcome.appended, vec!["pH".to_string()]);
        assert!(live.latest("AQI").is_none());
    }

    #[test]
    fn test_new_keys_trigger_invalidation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut live = widget().with_invalidator(Invalidator::new(tx));
        live.apply_known_keys(["temperature"].into_iter().collect());

        let outcome = live
            .handle_message(br#"{"temperature": 21, "soil_moisture": 40}"#, 1000)
            .unwrap();
        assert_eq!(outcome.new_keys.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), QueryKey::known_keys("a1"));

        live.handle_message(br#"{"temperature": 21.5}"#, 2000).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_threshold_highlighting() {
        let mut live = widget();
        live.apply_thresholds(
            vec![Threshold::new("temperature", 0.0, 100.0)]
                .into_iter()
                .collect(),
        );

        live.handle_message(br#"{"temperature": 100}"#, 1000).unwrap();
        assert_eq!(live.evaluate("temperature"), Some(Evaluation { in_band: true }));

        live.handle_message(br#"{"temperature": 100.01}"#, 2000).unwrap();
        assert_eq!(live.evaluate("temperature"), Some(Evaluation { in_band: false }));

        let snapshot = live.snapshot(3500);
        let view = &snapshot.series[0];
        assert_eq!(view.color, ALERT_COLOR);
        assert_eq!(view.label, "temperature (°C)");
        assert_eq!(view.age_secs, Some(1));
        assert_eq!(view.points, 2);
    }

    #[test]
    fn test_threshold_snapshot_reevaluates() {
        let mut live = widget();
        live.handle_message(br#"{"soil_moisture": 75}"#, 1000).unwrap();
        assert_eq!(live.snapshot(1000).series[0].color, DEFAULT_COLOR);

        live.apply_thresholds(vec![Threshold::new("soil_moisture", 20.0, 60.0)].into_iter().collect());
        assert!(!live.snapshot(1000).series[0].in_band);

        live.apply_thresholds(ThresholdSet::default());
        assert!(live.snapshot(1000).series[0].in_band);
    }

    #[test]
    fn test_seed_only_appends_newer_points() {
        let mut live = widget();
        live.handle_message(br#"{"humidity": 60}"#, 5_000).unwrap();

        let at = |ms: i64| Utc.timestamp_millis_opt(ms).unwrap();
        live.seed(&[
            LatestTelemetry {
                key: "humidity".to_string(),
                value: serde_json::json!(58),
                timestamp: at(4_000),
            },
            LatestTelemetry {
                key: "pH".to_string(),
                value: serde_json::json!(6.9),
                timestamp: at(3_000),
            },
            LatestTelemetry {
                key: "status".to_string(),
                value: serde_json::json!("online"),
                timestamp: at(3_000),
            },
        ]);

        assert_eq!(live.latest("humidity"), Some(TelemetryPoint::new(5_000, 60.0)));
        assert_eq!(live.latest("pH"), Some(TelemetryPoint::new(3_000, 6.9)));
        assert!(live.latest("status").is_none());
    }

    #[test]
    fn test_retarget_clears_state() {
        let mut live = widget();
        live.handle_message(br#"{"temperature": 20}"#, 1000).unwrap();
        live.apply_thresholds(vec![Threshold::new("temperature", 0.0, 10.0)].into_iter().collect());

        live.retarget(resolve(EntityType::Assets, "a2"), None);
        assert_eq!(live.topic().as_str(), "assets/a2/telemetry");
        assert!(live.series().is_empty());

        live.handle_message(br#"{"temperature": 20}"#, 2000).unwrap();
        assert_eq!(live.evaluate("temperature"), Some(Evaluation { in_band: true }));
    }
}
