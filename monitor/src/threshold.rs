use crate::series::TelemetryPoint;
use crate::style::ALERT_COLOR;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Acceptable `[min, max]` range of a measurement key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub key: String,
    #[serde(rename = "threshold_min")]
    pub min: f64,
    #[serde(rename = "threshold_max")]
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Threshold {
    pub fn new(key: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            key: key.into(),
            min,
            max,
            modified_at: None,
        }
    }

    /// Inclusive on both ends. A band with `min > max` contains nothing.
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub in_band: bool,
}

/// Checks the latest point of a key against its threshold, if any.
pub fn evaluate(latest: &TelemetryPoint, threshold: Option<&Threshold>) -> Evaluation {
    let in_band = threshold.map_or(true, |t| t.contains(latest.value));
    Evaluation { in_band }
}

/// Series color after threshold highlighting.
pub fn highlight_color<'a>(evaluation: Evaluation, configured: &'a str) -> &'a str {
    if evaluation.in_band {
        configured
    } else {
        ALERT_COLOR
    }
}

/// Snapshot of all thresholds configured for an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    by_key: HashMap<String, Threshold>,
}

impl ThresholdSet {
    pub fn get(&self, key: &str) -> Option<&Threshold> {
        self.by_key.get(key)
    }

    pub fn insert(&mut self, threshold: Threshold) {
        self.by_key.insert(threshold.key.clone(), threshold);
    }

    pub fn remove(&mut self, key: &str) -> Option<Threshold> {
        self.by_key.remove(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.by_key.values()
    }
}

impl FromIterator<Threshold> for ThresholdSet {
    fn from_iter<I: IntoIterator<Item = Threshold>>(iter: I) -> Self {
        let mut set = ThresholdSet::default();
        for threshold in iter {
            set.insert(threshold);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::DEFAULT_COLOR;

    #[test]
    fn test_no_threshold_is_in_band() {
        let point = TelemetryPoint::new(0, 1e9);
        assert!(evaluate(&point, None).in_band);
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let band = Threshold::new("temperature", 0.0, 100.0);

        assert!(evaluate(&TelemetryPoint::new(0, 100.0), Some(&band)).in_band);
        assert!(evaluate(&TelemetryPoint::new(0, 0.0), Some(&band)).in_band);
        assert!(!evaluate(&TelemetryPoint::new(0, 100.01), Some(&band)).in_band);
        assert!(!evaluate(&TelemetryPoint::new(0, -0.5), Some(&band)).in_band);
    }

    #[test]
    fn test_inverted_band_rejects_everything() {
        let band = Threshold::new("pH", 8.0, 6.0);
        assert!(!evaluate(&TelemetryPoint::new(0, 7.0), Some(&band)).in_band);
    }

    #[test]
    fn test_highlight_color() {
        let ok = Evaluation { in_band: true };
        let alert = Evaluation { in_band: false };
        assert_eq!(highlight_color(ok, DEFAULT_COLOR), DEFAULT_COLOR);
        assert_eq!(highlight_color(alert, DEFAULT_COLOR), ALERT_COLOR);
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{"key": "humidity", "threshold_min": 30, "threshold_max": 80.5,
                       "modified_at": "2024-03-01T10:00:00Z", "threshold_id": 4}"#;
        let threshold: Threshold = serde_json::from_str(json).unwrap();
        assert_eq!(threshold.key, "humidity");
        assert_eq!(threshold.min, 30.0);
        assert_eq!(threshold.max, 80.5);
        assert!(threshold.modified_at.is_some());
    }

    #[test]
    fn test_set_replaces_by_key() {
        let mut set: ThresholdSet = vec![
            Threshold::new("pH", 6.0, 7.5),
            Threshold::new("AQI", 0.0, 50.0),
        ]
        .into_iter()
        .collect();
        set.insert(Threshold::new("pH", 5.5, 7.0));

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("pH").map(|t| t.min), Some(5.5));
    }
}
