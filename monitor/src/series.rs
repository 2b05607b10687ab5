use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::Duration;

/// One reading of a measurement key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Arrival time, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub value: f64,
}

impl TelemetryPoint {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Arrival-ordered history of one key.
#[derive(Debug, Clone, Default)]
pub struct SeriesBuffer {
    points: VecDeque<TelemetryPoint>,
    capacity: Option<NonZeroUsize>,
}

impl SeriesBuffer {
    fn with_capacity(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            points: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, point: TelemetryPoint) {
        if let Some(cap) = self.capacity {
            while self.points.len() >= cap.get() {
                self.points.pop_front();
            }
        }
        self.points.push_back(point);
    }

    pub fn latest(&self) -> Option<TelemetryPoint> {
        self.points.back().copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetryPoint> {
        self.points.iter()
    }
}

/// Per-key series owned by a single widget.
///
/// Buffers are unbounded unless a capacity is configured, in which case
/// every key keeps at most that many points and the oldest is evicted
/// first. Unbounded buffers grow for the widget's whole lifetime.
#[derive(Debug, Clone, Default)]
pub struct SeriesAccumulator {
    series: HashMap<String, SeriesBuffer>,
    capacity: Option<NonZeroUsize>,
}

impl SeriesAccumulator {
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            series: HashMap::new(),
            capacity,
        }
    }

    pub fn append(&mut self, key: &str, point: TelemetryPoint) {
        match self.series.get_mut(key) {
            Some(buffer) => buffer.push(point),
            None => {
                let mut buffer = SeriesBuffer::with_capacity(self.capacity);
                buffer.push(point);
                self.series.insert(key.to_string(), buffer);
            }
        }
    }

    pub fn latest(&self, key: &str) -> Option<TelemetryPoint> {
        self.series.get(key).and_then(SeriesBuffer::latest)
    }

    /// Time since the latest point of `key`, relative to `now_ms`.
    ///
    /// Clamped to zero when the point lies in the future.
    pub fn age_of(&self, key: &str, now_ms: i64) -> Option<Duration> {
        let latest = self.latest(key)?;
        let elapsed = now_ms.saturating_sub(latest.timestamp).max(0);
        Some(Duration::from_millis(elapsed as u64))
    }

    pub fn get(&self, key: &str) -> Option<&SeriesBuffer> {
        self.series.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}
