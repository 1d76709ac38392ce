use anyhow::Context;
use gt06_lib::session::{TelemetrySnapshot, TrackPoint};
use gt06_lib::sink::TelemetrySink;
use gt06_lib::Error;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Keeps the latest snapshot of every device as `<dir>/<device id>.json` and
/// its position history as JSON lines in `<dir>/<device id>.track.jsonl`.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create store directory {dir:?}"))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, device_id: &str) -> Result<PathBuf, Error> {
        self.file(device_id, "json")
    }

    pub fn track_path(&self, device_id: &str) -> Result<PathBuf, Error> {
        self.file(device_id, "track.jsonl")
    }

    fn file(&self, device_id: &str, extension: &str) -> Result<PathBuf, Error> {
        if device_id.is_empty() || !device_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Sink(format!("Invalid device id {device_id:?}")));
        }
        Ok(self.dir.join(format!("{device_id}.{extension}")))
    }
}

#[async_trait::async_trait]
impl TelemetrySink for FileStore {
    async fn persist(&self, snapshot: &TelemetrySnapshot) -> Result<(), Error> {
        let path = self.path(&snapshot.device_id)?;
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| Error::Sink(e.to_string()))?;
        // Readers never see a half written file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::trace!("Stored snapshot of {} in {:?}", snapshot.device_id, path);
        Ok(())
    }

    async fn broadcast(&self, _snapshot: &TelemetrySnapshot) -> Result<(), Error> {
        Ok(())
    }

    async fn lookup(&self, device_id: &str) -> Result<Option<TelemetrySnapshot>, Error> {
        let path = self.path(device_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Sink(format!("Corrupt snapshot {path:?}: {e}"))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn append_track(&self, point: &TrackPoint) -> Result<(), Error> {
        let path = self.track_path(&point.device_id)?;
        let mut line = serde_json::to_vec(point).map_err(|e| Error::Sink(e.to_string()))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        log::trace!("Appended position of {} to {:?}", point.device_id, path);
        Ok(())
    }
}
