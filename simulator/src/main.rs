mod reading;

use clap::Parser;
use monitor::topic::{resolve, EntityType};
use rand::Rng;
use reading::generate_reading;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes synthetic farm telemetry to `{entity_type}/{entity_id}/telemetry`.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "127.0.0.1")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(long, env = "ENTITY_TYPE", value_enum, default_value_t = EntityType::Assets)]
    entity_type: EntityType,

    /// Number of entities, published as `sim-0`, `sim-1`, ...
    #[arg(long, env = "ENTITIES", default_value_t = 3)]
    entities: usize,

    /// Delay between two rounds over all entities
    #[arg(long, env = "INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Probability that a round carries a malformed payload
    #[arg(long, env = "MALFORMED_RATE", default_value_t = 0.01)]
    malformed_rate: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting farm telemetry simulator");
    info!(
        "Broker: {}:{}, Entities: {} {}, Interval: {} ms",
        args.mqtt_broker, args.mqtt_port, args.entities, args.entity_type, args.interval_ms
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, args.mqtt_broker.clone(), args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let malformed_rate = args.malformed_rate.clamp(0.0, 1.0);
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Published {} messages, stopping", counter);
                return;
            }
        }

        for index in 0..args.entities {
            let topic = resolve(args.entity_type, &format!("sim-{}", index));
            let payload = {
                let mut rng = rand::thread_rng();
                if rng.gen_bool(malformed_rate) {
                    b"{\"temperature\": ".to_vec()
                } else {
                    match serde_json::to_vec(&generate_reading(&mut rng)) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("Failed to serialize reading: {}", e);
                            continue;
                        }
                    }
                }
            };

            match client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish to {}: {}", topic, e),
            }
        }

        if counter % 100 == 0 {
            info!("Published {} messages", counter);
        }
    }
}
