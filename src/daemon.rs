use anyhow::{Context, Result};
use gt06_lib::session::{TelemetrySnapshot, TrackPoint};
use gt06_lib::sink::{MemoryStore, TelemetrySink};
use gt06_lib::tokio_server::{self, GatewayConfig, SinkDispatcher};
use gt06_lib::Error;
use log::{error, info, warn};
use std::sync::Arc;

use crate::commandline::{BroadcastOutput, ServeArgs};
use crate::mqtt;
use crate::store::FileStore;

/// A live output for snapshots.
#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish_snapshot(&self, snapshot: &TelemetrySnapshot) -> Result<()>;
}

pub struct ConsoleBroadcaster;

#[async_trait::async_trait]
impl Broadcaster for ConsoleBroadcaster {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn publish_snapshot(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let line = serde_json::to_string(snapshot)
            .with_context(|| format!("Cannot serialize snapshot of {}", snapshot.device_id))?;
        println!("{line}");
        Ok(())
    }
}

/// Sink handed to the gateway: one store plus any number of live outputs.
pub struct GatewaySink {
    store: Arc<dyn TelemetrySink>,
    broadcasters: Vec<Box<dyn Broadcaster>>,
}

impl GatewaySink {
    pub fn new(store: Arc<dyn TelemetrySink>, broadcasters: Vec<Box<dyn Broadcaster>>) -> Self {
        Self {
            store,
            broadcasters,
        }
    }
}

#[async_trait::async_trait]
impl TelemetrySink for GatewaySink {
    async fn persist(&self, snapshot: &TelemetrySnapshot) -> std::result::Result<(), Error> {
        self.store.persist(snapshot).await
    }

    async fn broadcast(&self, snapshot: &TelemetrySnapshot) -> std::result::Result<(), Error> {
        let mut failed = Vec::new();
        for broadcaster in &self.broadcasters {
            if let Err(err) = broadcaster.publish_snapshot(snapshot).await {
                warn!("Broadcast to {} failed: {err:#}", broadcaster.name());
                failed.push(broadcaster.name());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Sink(format!("broadcast failed for {}", failed.join(", "))))
        }
    }

    async fn lookup(
        &self,
        device_id: &str,
    ) -> std::result::Result<Option<TelemetrySnapshot>, Error> {
        self.store.lookup(device_id).await
    }

    async fn append_track(&self, point: &TrackPoint) -> std::result::Result<(), Error> {
        self.store.append_track(point).await
    }
}

fn open_store(args: &ServeArgs) -> Result<Arc<dyn TelemetrySink>> {
    let store: Arc<dyn TelemetrySink> = match &args.store_dir {
        Some(dir) => {
            info!("Storing snapshots in {dir:?}");
            Arc::new(FileStore::new(dir)?)
        }
        None => {
            warn!("No --store-dir given, snapshots are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

fn create_broadcasters(args: &ServeArgs) -> Result<Vec<Box<dyn Broadcaster>>> {
    let mut broadcasters: Vec<Box<dyn Broadcaster>> = Vec::new();
    for output in &args.broadcast {
        match output {
            BroadcastOutput::Console => broadcasters.push(Box::new(ConsoleBroadcaster)),
            BroadcastOutput::Mqtt => {
                let config = mqtt::MqttConfig::load(&args.mqtt_config).with_context(|| {
                    format!("Failed to open MQTT config file at '{}'", args.mqtt_config)
                })?;
                info!(
                    "Successfully loaded MQTT config from {}: {config:?}",
                    args.mqtt_config
                );
                let publisher = mqtt::MqttPublisher::new(config)
                    .with_context(|| "Failed to create MQTT publisher")?;
                broadcasters.push(Box::new(publisher));
            }
        }
    }
    Ok(broadcasters)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}

pub async fn run(args: ServeArgs) -> Result<()> {
    info!("Starting gateway: {args:?}");

    let sink = Arc::new(GatewaySink::new(
        open_store(&args)?,
        create_broadcasters(&args)?,
    ));
    let (dispatcher, worker) =
        SinkDispatcher::spawn(sink, args.queue_capacity, args.persist_interval);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Cannot listen on {}", args.bind))?;
    let config = GatewayConfig {
        idle_timeout: args.idle_timeout,
        read_buffer_size: args.read_buffer_size,
    };

    tokio_server::serve(listener, config, dispatcher, shutdown_signal())
        .await
        .with_context(|| "Gateway stopped with an error")?;

    info!("Flushing pending snapshots");
    worker.await.with_context(|| "Dispatch worker failed")?;
    Ok(())
}
