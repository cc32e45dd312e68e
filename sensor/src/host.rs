use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use homelink_common::{
    logging, Availability, LinkConfig, LogProfile, MqttConnectionManager, RumqttConnector,
    SensorReport, TracingLogger, TOPIC_CMD_SENSOR, TOPIC_SENSOR_HUMIDITY, TOPIC_SENSOR_REPORT,
    TOPIC_SENSOR_STATUS, TOPIC_SENSOR_TEMP,
};

const CONNECT_WAIT_MS: u64 = 10_000;
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run() -> anyhow::Result<()> {
    let profile = LogProfile::from_env().context("invalid log profile")?;
    let log_dir = std::env::var("HOMELINK_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    logging::init(profile, &log_dir).context("failed to initialize logging")?;

    let mut config = LinkConfig::from_env();
    if config.client_id == LinkConfig::default().client_id {
        config.client_id = "homelink-sensor".to_string();
    }

    let mqtt = MqttConnectionManager::with_config(
        config,
        RumqttConnector::default(),
        Arc::new(TracingLogger),
    )
    .context("invalid broker configuration")?;

    mqtt.connect_and_wait(CONNECT_WAIT_MS)
        .await
        .context("broker did not accept the connection")?;

    mqtt.subscribe(TOPIC_CMD_SENSOR, |payload, topic| {
        let command = String::from_utf8_lossy(payload);
        info!("sensor command on {topic}: {command}");
    })
    .await
    .context("failed to subscribe to sensor commands")?;

    mqtt.publish_retained(TOPIC_SENSOR_STATUS, Availability::Online.as_str())
        .await
        .context("failed to publish sensor online status")?;

    info!("sensor publisher started ({profile} logging)");

    let mqtt_ref = &mqtt;
    let ticks = report_until(REPORT_INTERVAL, tokio::signal::ctrl_c(), |tick| async move {
        // Simulated readings until real drivers are wired in.
        let temperature_f = 68.0 + ((tick % 8) as f32 * 0.2);
        let humidity = 42.0 + ((tick % 6) as f32 * 0.5);

        if let Err(err) = publish_readings(mqtt_ref, temperature_f, humidity).await {
            warn!("sensor publish failed: {err:#}");
        }
    })
    .await;

    info!("shutting down sensor publisher after {ticks} reports");
    if let Err(err) = mqtt
        .publish_retained(TOPIC_SENSOR_STATUS, Availability::Offline.as_str())
        .await
    {
        warn!("failed to publish offline status: {err}");
    }
    mqtt.exit().await;
    Ok(())
}

/// Runs `report` on every tick until `shutdown` resolves. Returns the tick count.
async fn report_until<S, F, Fut>(period: Duration, shutdown: S, mut report: F) -> u64
where
    S: Future,
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    // One future for the whole run so a signal between ticks is not lost.
    tokio::pin!(shutdown);

    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => break,
        }
        tick = tick.saturating_add(1);
        report(tick).await;
    }
    tick
}

async fn publish_readings(
    mqtt: &MqttConnectionManager,
    temperature_f: f32,
    humidity: f32,
) -> anyhow::Result<()> {
    mqtt.publish(TOPIC_SENSOR_TEMP, format!("{temperature_f:.1}"))
        .await
        .context("failed to publish sensor temperature")?;
    mqtt.publish(TOPIC_SENSOR_HUMIDITY, format!("{humidity:.1}"))
        .await
        .context("failed to publish sensor humidity")?;

    let report = SensorReport {
        temperature_f,
        humidity,
        connection_loss_count: mqtt.connection_loss_count(),
        timestamp: Utc::now(),
    };
    let body = report
        .to_payload()
        .context("failed to serialize sensor report")?;
    mqtt.publish(TOPIC_SENSOR_REPORT, body)
        .await
        .context("failed to publish sensor report")?;
    Ok(())
}
