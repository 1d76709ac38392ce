#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Payload of protocol {protocol:#04X} too short - required={expected} received={actual}")]
    PayloadTooShort {
        protocol: u8,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid fix time {0:02X?}")]
    InvalidTimestamp([u8; 6]),
    #[error("Telemetry received before login")]
    NotAuthenticated,
    #[error("Session already closed")]
    SessionClosed,
    #[error("Login for device {received} on a connection bound to {bound}")]
    DeviceMismatch { bound: String, received: String },
    #[error("Sink error: {0}")]
    Sink(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
