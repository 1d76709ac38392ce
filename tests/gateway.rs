use gt06_lib::protocol::{
    encode_ack, encode_frame, encode_login, BatteryLevel, ACK_FRAME_SIZE, PROTOCOL_LOCATION,
    PROTOCOL_LOGIN, PROTOCOL_STATUS,
};
use gt06_lib::sink::{MemoryStore, TelemetrySink};
use gt06_lib::tokio_server::{serve, GatewayConfig, SinkDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const DEVICE_ID: [u8; 8] = [0x03, 0x55, 0x95, 0x10, 0x92, 0x33, 0x71, 0x65];

const LOCATION_PAYLOAD: [u8; 26] = [
    0x0B, 0x08, 0x1D, 0x11, 0x2E, 0x10, 0xCF, 0x02, 0x7A, 0xC7, 0xEB, 0x0C, 0x46, 0x58, 0x49,
    0x00, 0x14, 0x8F, 0x01, 0xCC, 0x00, 0x28, 0x7D, 0x00, 0x1F, 0xB8,
];

const STATUS_PAYLOAD: [u8; 5] = [0x45, 0x05, 0x04, 0x00, 0x02];

#[tokio::test]
async fn device_session_over_tcp() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, worker) = SinkDispatcher::spawn(store.clone(), 16, Duration::from_secs(60));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        GatewayConfig::default(),
        dispatcher,
        async move {
            let _ = stop_rx.await;
        },
    ));

    let mut client = TcpStream::connect(addr).await.unwrap();

    // rejected, not acknowledged
    client
        .write_all(&encode_frame(PROTOCOL_LOCATION, &LOCATION_PAYLOAD, 1))
        .await
        .unwrap();

    // serial 0x0102 followed by the timezone word for GMT+08:00
    let login = encode_login(&DEVICE_ID, 0x0102, Some(0x3202));
    for chunk in login.chunks(4) {
        client.write_all(chunk).await.unwrap();
        client.flush().await.unwrap();
    }

    let mut ack = [0u8; ACK_FRAME_SIZE];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut ack))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.to_vec(), encode_ack(PROTOCOL_LOGIN, 0x0102));

    let mut batch = encode_frame(PROTOCOL_LOCATION, &LOCATION_PAYLOAD, 0x0103);
    batch.extend(encode_frame(PROTOCOL_STATUS, &STATUS_PAYLOAD, 0x0104));
    client.write_all(&batch).await.unwrap();
    client.shutdown().await.unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty(), "only login is acknowledged");

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
    worker.await.unwrap();

    let snapshot = store.lookup("0355951092337165").await.unwrap().unwrap();
    assert!((snapshot.latitude.unwrap() - 23.111668).abs() < 1e-5);
    assert!((snapshot.longitude.unwrap() - 114.409285).abs() < 1e-5);
    assert_eq!(snapshot.speed_kmh, Some(0));
    assert_eq!(snapshot.battery, Some(BatteryLevel::High));
    assert_eq!(snapshot.timezone.unwrap().offset_minutes, 480);
    assert_eq!(store.len(), 1);
    assert_eq!(store.track("0355951092337165").len(), 1);
}

#[tokio::test]
async fn garbage_connection_is_closed_cleanly() {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, worker) = SinkDispatcher::spawn(store.clone(), 4, Duration::ZERO);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        GatewayConfig::default(),
        dispatcher,
        async move {
            let _ = stop_rx.await;
        },
    ));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
    worker.await.unwrap();
    assert!(store.is_empty());
}
