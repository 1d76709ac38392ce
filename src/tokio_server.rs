//! TCP gateway on the Tokio runtime.
//!
//! Every accepted connection runs in its own task owning a [`FrameReader`] and
//! a [`DeviceSession`]; nothing is shared between connections except the
//! [`SinkDispatcher`], which hands snapshots to the telemetry sink without
//! blocking the read loop.
//!
//! # Example
//!
//! ```no_run
//! use gt06_lib::sink::MemoryStore;
//! use gt06_lib::tokio_server::{serve, GatewayConfig, SinkDispatcher};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gt06_lib::tokio_server::Error> {
//!     let store = Arc::new(MemoryStore::new());
//!     let (dispatcher, worker) = SinkDispatcher::spawn(store, 1024, Duration::from_secs(1));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:21100").await?;
//!     serve(listener, GatewayConfig::default(), dispatcher, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     let _ = worker.await;
//!     Ok(())
//! }
//! ```

use crate::frame::FrameReader;
use crate::session::{DeviceSession, TelemetrySnapshot, TrackPoint};
use crate::sink::TelemetrySink;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// Errors specific to the Tokio gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error originating from the protocol engine.
    #[error("GT06 error: {0}")]
    Gt06Error(#[from] crate::Error),
    /// An I/O error on the device connection or listener.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// The device stayed silent for longer than the idle timeout.
    #[error("Tokio timeout elapsed: {0}")]
    TokioElapsed(#[from] tokio::time::error::Elapsed),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Close a connection after this long without any bytes from the device.
    pub idle_timeout: Duration,
    /// Size of the socket read buffer.
    pub read_buffer_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            read_buffer_size: 1024,
        }
    }
}

/// Non-blocking hand-off from the connection tasks to a [`TelemetrySink`].
///
/// Updates go through a bounded queue to a single worker. The worker
/// broadcasts every snapshot as it arrives and persists the newest snapshot
/// per device every `flush_interval` (immediately when it is zero). Track
/// points bypass the coalescing and are appended one by one.
#[derive(Debug, Clone)]
pub struct SinkDispatcher {
    tx: mpsc::Sender<Update>,
    dropped: Arc<AtomicU64>,
}

#[derive(Debug)]
enum Update {
    Snapshot(TelemetrySnapshot),
    Track(TrackPoint),
}

impl Update {
    fn device_id(&self) -> &str {
        match self {
            Update::Snapshot(snapshot) => &snapshot.device_id,
            Update::Track(point) => &point.device_id,
        }
    }
}

impl SinkDispatcher {
    /// Starts the worker. It exits once every dispatcher clone is dropped and
    /// pending writes are flushed.
    pub fn spawn(
        sink: Arc<dyn TelemetrySink>,
        capacity: usize,
        flush_interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(sink, rx, flush_interval));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            worker,
        )
    }

    /// Queues `snapshot` without waiting. Returns `false` if it was dropped.
    pub fn dispatch(&self, snapshot: TelemetrySnapshot) -> bool {
        self.send(Update::Snapshot(snapshot))
    }

    /// Queues `point` for the device history without waiting. Returns `false` if it was dropped.
    pub fn record(&self, point: TrackPoint) -> bool {
        self.send(Update::Track(point))
    }

    fn send(&self, update: Update) -> bool {
        match self.tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(update)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Dispatch queue full, dropping update of {} ({} dropped so far)",
                    update.device_id(),
                    dropped
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(update)) => {
                log::warn!(
                    "Dispatch worker stopped, dropping update of {}",
                    update.device_id()
                );
                false
            }
        }
    }

    /// Number of updates dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn persist(sink: &dyn TelemetrySink, snapshot: &TelemetrySnapshot) {
    match sink.persist(snapshot).await {
        Ok(()) => log::trace!("Persisted snapshot of {}", snapshot.device_id),
        Err(err) => log::error!("Cannot persist snapshot of {}: {err}", snapshot.device_id),
    }
}

async fn flush(sink: &dyn TelemetrySink, pending: &mut HashMap<String, TelemetrySnapshot>) {
    for (_, snapshot) in pending.drain() {
        persist(sink, &snapshot).await;
    }
}

async fn run_worker(
    sink: Arc<dyn TelemetrySink>,
    mut rx: mpsc::Receiver<Update>,
    flush_interval: Duration,
) {
    let mut pending: HashMap<String, TelemetrySnapshot> = HashMap::new();
    let mut ticker = (!flush_interval.is_zero()).then(|| {
        tokio::time::interval_at(
            tokio::time::Instant::now() + flush_interval,
            flush_interval,
        )
    });

    loop {
        // None means the flush timer fired
        let received = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                snapshot = rx.recv() => Some(snapshot),
                _ = ticker.tick() => None,
            },
            None => Some(rx.recv().await),
        };

        match received {
            Some(Some(Update::Track(point))) => {
                if let Err(err) = sink.append_track(&point).await {
                    log::error!("Cannot record position of {}: {err}", point.device_id);
                }
            }
            Some(Some(Update::Snapshot(snapshot))) => {
                if let Err(err) = sink.broadcast(&snapshot).await {
                    log::error!("Cannot broadcast snapshot of {}: {err}", snapshot.device_id);
                }
                if ticker.is_some() {
                    pending.insert(snapshot.device_id.clone(), snapshot);
                } else {
                    persist(sink.as_ref(), &snapshot).await;
                }
            }
            Some(None) => break,
            None => flush(sink.as_ref(), &mut pending).await,
        }
    }

    flush(sink.as_ref(), &mut pending).await;
    log::debug!("Dispatch worker stopped");
}

async fn run_session<S>(
    stream: &mut S,
    peer: SocketAddr,
    config: &GatewayConfig,
    reader: &mut FrameReader,
    session: &mut DeviceSession,
    dispatcher: &SinkDispatcher,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut rx_buffer = vec![0; config.read_buffer_size.max(1)];
    loop {
        let received =
            tokio::time::timeout(config.idle_timeout, stream.read(&mut rx_buffer)).await??;
        if received == 0 {
            log::info!("Client {peer} closed the connection");
            return Ok(());
        }
        log::trace!("{peer} received: {:02X?}", &rx_buffer[..received]);

        for frame in reader.push(&rx_buffer[..received]) {
            match session.process(&frame) {
                Ok(processed) => {
                    if let Some(ack) = processed.ack {
                        log::trace!("{peer} write ack: {ack:02X?}");
                        stream.write_all(&ack).await?;
                    }
                    if let Some(point) = processed.track {
                        dispatcher.record(point);
                    }
                    if let Some(snapshot) = processed.snapshot {
                        dispatcher.dispatch(snapshot);
                    }
                }
                Err(err) => log::warn!(
                    "{peer}: dropping frame {:#04X} serial {}: {err}",
                    frame.protocol,
                    frame.serial_number
                ),
            }
        }
    }
}

/// Runs the protocol engine for one device connection until it closes.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    config: &GatewayConfig,
    dispatcher: &SinkDispatcher,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new();
    let mut session = DeviceSession::new();

    let result = run_session(
        &mut stream,
        peer,
        config,
        &mut reader,
        &mut session,
        dispatcher,
    )
    .await;
    session.close();

    let stats = reader.stats();
    log::info!(
        "Client {} ({}) disconnected: frames={} checksum_errors={} resyncs={} discarded_bytes={}",
        peer,
        session.device_id().unwrap_or("<unauthenticated>"),
        stats.frames,
        stats.checksum_errors,
        stats.resyncs,
        stats.discarded_bytes
    );
    result
}

/// Accepts device connections until `shutdown` completes, then aborts the
/// remaining connection tasks.
pub async fn serve<F>(
    listener: TcpListener,
    config: GatewayConfig,
    dispatcher: SinkDispatcher,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let config = Arc::new(config);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    log::info!("Gateway listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutting down gateway, closing {} connections", connections.len());
                break;
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::error!("Cannot accept connection: {err}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                log::info!("Client {peer} connected");
                if let Err(err) = stream.set_nodelay(true) {
                    log::debug!("Cannot set TCP_NODELAY for {peer}: {err}");
                }
                let config = config.clone();
                let dispatcher = dispatcher.clone();
                connections.spawn(async move {
                    match handle_connection(stream, peer, &config, &dispatcher).await {
                        Ok(()) => {}
                        Err(Error::TokioElapsed(_)) => {
                            log::warn!("Client {peer} idle for {:?}, closed", config.idle_timeout)
                        }
                        Err(err) => log::error!("Client {peer} connection error: {err}"),
                    }
                });
            }
        }
    }

    connections.shutdown().await;
    Ok(())
}
