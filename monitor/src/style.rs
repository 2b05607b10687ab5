use serde::Serialize;

/// Color forced on a series whose latest value is out of band.
pub const ALERT_COLOR: &str = "#FF0000";

/// Color for keys without a configured style.
pub const DEFAULT_COLOR: &str = "#7FC7D9";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesStyle {
    pub key: String,
    pub color: String,
    pub unit: Option<String>,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
}

impl SeriesStyle {
    fn new(key: &str, color: &str, unit: Option<&str>, range: Option<(f64, f64)>) -> Self {
        Self {
            key: key.to_string(),
            color: color.to_string(),
            unit: unit.map(str::to_string),
            y_min: range.map(|r| r.0),
            y_max: range.map(|r| r.1),
        }
    }

    /// Legend label, `key` or `key (unit)`.
    pub fn label(&self) -> String {
        match &self.unit {
            Some(unit) if !unit.is_empty() => format!("{} ({})", self.key, unit),
            _ => self.key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesStyles {
    styles: Vec<SeriesStyle>,
}

impl SeriesStyles {
    pub fn new(styles: Vec<SeriesStyle>) -> Self {
        Self { styles }
    }

    pub fn get(&self, key: &str) -> Option<&SeriesStyle> {
        self.styles.iter().find(|s| s.key == key)
    }

    pub fn color_for(&self, key: &str) -> &str {
        self.get(key).map(|s| s.color.as_str()).unwrap_or(DEFAULT_COLOR)
    }

    pub fn label_for(&self, key: &str) -> String {
        self.get(key).map(SeriesStyle::label).unwrap_or_else(|| key.to_string())
    }
}

/// Palette of the farm dashboards.
impl Default for SeriesStyles {
    fn default() -> Self {
        Self::new(vec![
            SeriesStyle::new("temperature", "#EBE76C", Some("°C"), Some((0.0, 100.0))),
            SeriesStyle::new("humidity", "#F0B86E", Some("%"), Some((0.0, 100.0))),
            SeriesStyle::new("light_intensity", "#FFD0EC", Some("Lux"), Some((100.0, 1000.0))),
            SeriesStyle::new("pH", "#E1F0DA", None, Some((0.0, 10.0))),
            SeriesStyle::new("AQI", "#33FF57", None, None),
        ])
    }
}
