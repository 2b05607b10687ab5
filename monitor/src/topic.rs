use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity a telemetry stream is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Assets,
    Devices,
}

impl EntityType {
    /// Path segment used both on the bus and in REST urls.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Assets => "assets",
            EntityType::Devices => "devices",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Bus address of one entity's telemetry stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TelemetryTopic {
    entity: EntityRef,
    topic: String,
}

impl TelemetryTopic {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn as_str(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for TelemetryTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic)
    }
}

/// Derives the telemetry topic for an entity.
///
/// The id is not validated: an empty id resolves to a degenerate topic
/// (`assets//telemetry`) that no publisher ever writes to.
pub fn resolve(entity_type: EntityType, entity_id: &str) -> TelemetryTopic {
    TelemetryTopic {
        entity: EntityRef::new(entity_type, entity_id),
        topic: format!("{}/{}/telemetry", entity_type.as_str(), entity_id),
    }
}

/// Topic that control commands for a device are published on.
pub fn control_topic(device_id: &str) -> String {
    format!("devices/{}/control", device_id)
}
