//! Downstream consumers of device snapshots.

use crate::session::{TelemetrySnapshot, TrackPoint};
use crate::Error;
use std::collections::HashMap;
use std::sync::RwLock;

/// Storage and live fan-out for snapshots.
///
/// Implementations are shared by every connection, so they must tolerate
/// concurrent calls. Retries belong to the implementation; the gateway logs a
/// failed call and moves on.
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    /// Stores `snapshot` as the latest state of its device. Must be idempotent.
    async fn persist(&self, snapshot: &TelemetrySnapshot) -> Result<(), Error>;

    /// Publishes `snapshot` to live subscribers, best effort.
    async fn broadcast(&self, snapshot: &TelemetrySnapshot) -> Result<(), Error>;

    /// Reads the stored snapshot of `device_id`.
    async fn lookup(&self, device_id: &str) -> Result<Option<TelemetrySnapshot>, Error>;

    /// Appends `point` to the position history of its device. Sinks without
    /// history ignore it.
    async fn append_track(&self, _point: &TrackPoint) -> Result<(), Error> {
        Ok(())
    }
}

/// Keeps the latest snapshot of every device in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, TelemetrySnapshot>>,
    tracks: RwLock<HashMap<String, Vec<TrackPoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded positions of `device_id`, oldest first.
    pub fn track(&self, device_id: &str) -> Vec<TrackPoint> {
        self.tracks
            .read()
            .map(|t| t.get(device_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TelemetrySink for MemoryStore {
    async fn persist(&self, snapshot: &TelemetrySnapshot) -> Result<(), Error> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| Error::Sink(e.to_string()))?;
        snapshots.insert(snapshot.device_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn broadcast(&self, _snapshot: &TelemetrySnapshot) -> Result<(), Error> {
        Ok(())
    }

    async fn lookup(&self, device_id: &str) -> Result<Option<TelemetrySnapshot>, Error> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| Error::Sink(e.to_string()))?;
        Ok(snapshots.get(device_id).cloned())
    }

    async fn append_track(&self, point: &TrackPoint) -> Result<(), Error> {
        let mut tracks = self.tracks.write().map_err(|e| Error::Sink(e.to_string()))?;
        tracks
            .entry(point.device_id.clone())
            .or_default()
            .push(point.clone());
        Ok(())
    }
}
