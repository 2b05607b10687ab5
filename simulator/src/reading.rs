use rand::Rng;
use serde::Serialize;

/// One flat telemetry message as a farm asset publishes it.
#[derive(Debug, Clone, Serialize)]
pub struct FarmReading {
    pub temperature: f64,
    pub humidity: f64,
    pub light_intensity: f64,
    #[serde(rename = "pH")]
    pub ph: f64,
    #[serde(rename = "AQI")]
    pub aqi: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soil_moisture: Option<f64>,
}

pub fn generate_reading(rng: &mut impl Rng) -> FarmReading {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(-10.0..60.0) // 5% outliers
    } else {
        rng.gen_range(18.0..32.0)
    };

    let humidity = if rng.gen_bool(0.05) {
        rng.gen_range(0.0..100.0)
    } else {
        rng.gen_range(40.0..80.0)
    };

    // sensors that lost their reading report 0
    let light_intensity = if rng.gen_bool(0.03) {
        0.0
    } else {
        rng.gen_range(100.0..1000.0)
    };

    // a key the console has not seen yet, now and then
    let soil_moisture = rng.gen_bool(0.1).then(|| rng.gen_range(10.0..60.0));

    FarmReading {
        temperature: round2(temperature),
        humidity: round2(humidity),
        light_intensity: round2(light_intensity),
        ph: round2(rng.gen_range(5.5..7.5)),
        aqi: rng.gen_range(10..150) as f64,
        soil_moisture: soil_moisture.map(round2),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
