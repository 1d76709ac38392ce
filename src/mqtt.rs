use crate::daemon::Broadcaster;
use anyhow::{bail, Context, Result};
use gt06_lib::session::TelemetrySnapshot;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(default = "MqttConfig::default_channel_capacity")]
    channel_capacity: usize,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "gt06".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distr::Alphanumeric;
        use rand::Rng;

        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("gt06-gateway-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_channel_capacity() -> usize {
        64
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn quality_of_service(&self) -> Result<QoS> {
        Ok(match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => bail!("Invalid MQTT QoS {other}, expected 0, 1 or 2"),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive_interval);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

/// Publishes snapshots as JSON to `<topic>/<device id>`.
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    qos: QoS,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Creates the client and starts polling its event loop; must be called inside a Tokio runtime.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.quality_of_service()?;
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut event_loop) = AsyncClient::new(config.options(), config.channel_capacity);

        // rumqttc reconnects on the next poll after an error
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => log::trace!("MQTT event: {event:?}"),
                    Err(err) => {
                        log::error!("MQTT connection error: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            topic: config.topic,
            qos,
            event_loop,
        })
    }

    pub fn topic(&self, device_id: &str) -> String {
        format!("{}/{}", self.topic, device_id)
    }

    pub async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}",
            topic,
            self.qos
        );
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait::async_trait]
impl Broadcaster for MqttPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn publish_snapshot(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)
            .with_context(|| format!("Cannot serialize snapshot of {}", snapshot.device_id))?;
        self.publish(&self.topic(&snapshot.device_id), payload).await
    }
}
