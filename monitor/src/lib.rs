//! Live telemetry pipeline for the farm console.
//!
//! Widgets subscribe to `{entity_type}/{entity_id}/telemetry` through a shared
//! [`bus::BusPool`], decode each JSON message into per-key series and evaluate
//! the latest readings against thresholds loaded from the REST API.

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod control;
pub mod decode;
pub mod errors;
pub mod keys;
pub mod live;
pub mod metrics;
pub mod series;
pub mod server;
pub mod style;
pub mod threshold;
pub mod topic;
pub mod widget;
