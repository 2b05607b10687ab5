use crate::bus::{BrokerEndpoint, BusOptions, RetryPolicy};
use crate::decode::DecodeOptions;
use clap::{ArgAction, Args};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Runtime settings, from flags or environment.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    #[arg(long, env = "MQTT_BROKER", default_value = "127.0.0.1")]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Base url of the farm REST API
    #[arg(long, env = "API_URL", default_value = "http://127.0.0.1:8000/api")]
    pub api_url: String,

    /// Bearer token for the REST API
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8081")]
    pub http_addr: String,

    /// Maximum points kept per key; unbounded when unset
    #[arg(long, env = "SERIES_CAPACITY")]
    pub series_capacity: Option<NonZeroUsize>,

    #[arg(long, env = "TREAT_ZERO_AS_ABSENT", default_value_t = true, action = ArgAction::Set)]
    pub treat_zero_as_absent: bool,

    #[arg(long, env = "RECONNECT_INITIAL_MS", default_value_t = 500)]
    pub reconnect_initial_ms: u64,

    #[arg(long, env = "RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    /// Consecutive connection failures before giving up; 0 retries forever
    #[arg(long, env = "RECONNECT_MAX_ATTEMPTS", default_value_t = 0)]
    pub reconnect_max_attempts: u32,

    #[arg(long, env = "KEEP_ALIVE_SECS", default_value_t = 30)]
    pub keep_alive_secs: u64,

    /// Messages buffered per subscriber before new ones are dropped
    #[arg(long, env = "CHANNEL_CAPACITY", default_value = "1024")]
    pub channel_capacity: NonZeroUsize,

    #[arg(long, env = "AGE_TICK_MS", default_value_t = 1000)]
    pub age_tick_ms: u64,
}

impl Settings {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(self.mqtt_broker.clone(), self.mqtt_port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.reconnect_initial_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_ms),
            max_retries: (self.reconnect_max_attempts > 0).then_some(self.reconnect_max_attempts),
        }
    }

    pub fn bus_options(&self) -> BusOptions {
        BusOptions {
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            channel_capacity: self.channel_capacity,
            retry: self.retry_policy(),
            ..BusOptions::default()
        }
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            treat_zero_as_absent: self.treat_zero_as_absent,
        }
    }

    pub fn age_tick(&self) -> Duration {
        Duration::from_millis(self.age_tick_ms.max(1))
    }
}
