use crate::errors::Result;
use crate::threshold::Threshold;
use crate::topic::EntityRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Latest stored value of one key, as returned by the REST layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestTelemetry {
    pub key: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    ts_key: String,
}

#[derive(Debug, Deserialize)]
struct ThresholdBand {
    threshold_min: f64,
    threshold_max: f64,
}

#[derive(Debug, Serialize)]
struct ThresholdBody<'a> {
    key: &'a str,
    threshold_min: f64,
    threshold_max: f64,
}

/// REST endpoints the telemetry pipeline reads from.
#[async_trait]
pub trait TelemetryApi: Send + Sync {
    async fn known_keys(&self, entity: &EntityRef) -> Result<Vec<String>>;

    /// `None` when no threshold is configured for `key`.
    async fn threshold(&self, entity: &EntityRef, key: &str) -> Result<Option<Threshold>>;

    async fn thresholds(&self, entity: &EntityRef) -> Result<Vec<Threshold>>;

    async fn set_threshold(&self, entity: &EntityRef, threshold: &Threshold) -> Result<()>;

    async fn delete_threshold(&self, entity: &EntityRef, key: &str) -> Result<()>;

    async fn latest_telemetry(&self, entity: &EntityRef) -> Result<Vec<LatestTelemetry>>;
}

/// [`TelemetryApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, entity: &EntityRef, path: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url, entity.entity_type, entity.entity_id, path
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        debug!("{} {}", method, url);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl TelemetryApi for HttpApi {
    async fn known_keys(&self, entity: &EntityRef) -> Result<Vec<String>> {
        let entries: Vec<KeyEntry> = self
            .request(reqwest::Method::GET, &self.url(entity, "keys"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(entries.into_iter().map(|e| e.ts_key).collect())
    }

    async fn threshold(&self, entity: &EntityRef, key: &str) -> Result<Option<Threshold>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &self.url(entity, &format!("threshold/{}", key)),
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let band: ThresholdBand = response.error_for_status()?.json().await?;
        Ok(Some(Threshold::new(key, band.threshold_min, band.threshold_max)))
    }

    async fn thresholds(&self, entity: &EntityRef) -> Result<Vec<Threshold>> {
        let thresholds = self
            .request(reqwest::Method::GET, &self.url(entity, "thresholds"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(thresholds)
    }

    async fn set_threshold(&self, entity: &EntityRef, threshold: &Threshold) -> Result<()> {
        let body = ThresholdBody {
            key: &threshold.key,
            threshold_min: threshold.min,
            threshold_max: threshold.max,
        };
        self.request(
            reqwest::Method::POST,
            &self.url(entity, &format!("threshold/{}", threshold.key)),
        )
        .json(&body)
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn delete_threshold(&self, entity: &EntityRef, key: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            &self.url(entity, &format!("threshold/{}", key)),
        )
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn latest_telemetry(&self, entity: &EntityRef) -> Result<Vec<LatestTelemetry>> {
        let latest = self
            .request(reqwest::Method::GET, &self.url(entity, "telemetry/latest"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(latest)
    }
}
