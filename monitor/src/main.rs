use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use monitor::api::{HttpApi, TelemetryApi};
use monitor::bus::BusPool;
use monitor::config::Settings;
use monitor::control::{send_control, ControlCommand};
use monitor::errors::Result;
use monitor::metrics;
use monitor::server;
use monitor::style::SeriesStyles;
use monitor::threshold::Threshold;
use monitor::topic::{resolve, EntityRef, EntityType};
use monitor::widget::{spawn_widget, WidgetConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "monitor", about = "Live telemetry monitor for the farm console")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream live telemetry for one or more entities
    Watch {
        #[arg(value_enum)]
        entity_type: EntityType,
        #[arg(required = true)]
        entity_ids: Vec<String>,
    },
    /// Publish a JSON control command to a device
    Control { device_id: String, json: String },
    /// Manage per-key thresholds through the REST API
    Threshold {
        #[arg(value_enum)]
        entity_type: EntityType,
        entity_id: String,
        #[command(subcommand)]
        action: ThresholdAction,
    },
}

#[derive(Debug, Subcommand)]
enum ThresholdAction {
    List,
    Set {
        key: String,
        #[arg(allow_negative_numbers = true)]
        min: f64,
        #[arg(allow_negative_numbers = true)]
        max: f64,
    },
    Delete { key: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match cli.command {
        Command::Watch {
            entity_type,
            entity_ids,
        } => watch(&cli.settings, entity_type, entity_ids).await,
        Command::Control { device_id, json } => control(&cli.settings, device_id, json).await,
        Command::Threshold {
            entity_type,
            entity_id,
            action,
        } => threshold(&cli.settings, EntityRef::new(entity_type, entity_id), action).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn watch(settings: &Settings, entity_type: EntityType, entity_ids: Vec<String>) -> Result<()> {
    info!("Starting live telemetry monitor");
    info!("MQTT broker: {}", settings.endpoint());
    info!("REST API: {}", settings.api_url);
    info!("HTTP server: {}", settings.http_addr);

    if let Err(e) = metrics::init_metrics() {
        warn!("Failed to register metrics: {}", e);
    }

    let api: Arc<dyn TelemetryApi> = Arc::new(HttpApi::new(
        settings.api_url.clone(),
        settings.api_token.clone(),
    ));
    let pool = BusPool::new(settings.bus_options());

    let widgets: Vec<_> = entity_ids
        .iter()
        .map(|entity_id| {
            let config = WidgetConfig {
                endpoint: settings.endpoint(),
                topic: resolve(entity_type, entity_id),
                capacity: settings.series_capacity,
                decode: settings.decode_options(),
                styles: SeriesStyles::default(),
                age_tick: settings.age_tick(),
            };
            spawn_widget(pool.clone(), Arc::clone(&api), config)
        })
        .collect();
    info!("Mounted {} widget(s) on {}", widgets.len(), entity_type);

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(server::create_router(
            widgets.iter().map(|w| w.watch()).collect(),
            settings.endpoint(),
            CONTROL_TIMEOUT,
        ));

    let listener = tokio::net::TcpListener::bind(&settings.http_addr).await?;
    info!("HTTP server listening on {}", settings.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    for widget in widgets {
        widget.dispose().await;
    }

    Ok(())
}

async fn control(settings: &Settings, device_id: String, json: String) -> Result<()> {
    let command = ControlCommand::new(device_id, json)?;
    send_control(&settings.endpoint(), &command, CONTROL_TIMEOUT).await?;
    println!("sent to {}", command.topic());
    Ok(())
}

async fn threshold(settings: &Settings, entity: EntityRef, action: ThresholdAction) -> Result<()> {
    let api = HttpApi::new(settings.api_url.clone(), settings.api_token.clone());

    match action {
        ThresholdAction::List => {
            let thresholds = api.thresholds(&entity).await?;
            if thresholds.is_empty() {
                println!("no thresholds configured for {}", entity);
            }
            for threshold in thresholds {
                println!("{}\t{}\t{}", threshold.key, threshold.min, threshold.max);
            }
        }
        ThresholdAction::Set { key, min, max } => {
            api.set_threshold(&entity, &Threshold::new(key, min, max)).await?;
            info!("Threshold saved for {}", entity);
        }
        ThresholdAction::Delete { key } => {
            api.delete_threshold(&entity, &key).await?;
            info!("Threshold {} removed from {}", key, entity);
        }
    }

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
