use crate::frame::RawFrame;
use crate::protocol::{
    encode_ack, requires_ack, BatteryLevel, CellTower, DecodedMessage, GpsFix, RawStatus,
    SignalStrength, TerminalInfo, Timezone,
};
use crate::Error;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Latest known value of every field reported by one device.
///
/// Updated by merging: a field the current message does not carry keeps its
/// previous value, because status and location messages report disjoint sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub device_id: String,
    pub timezone: Option<Timezone>,
    pub terminal: Option<TerminalInfo>,
    pub battery: Option<BatteryLevel>,
    pub signal: Option<SignalStrength>,
    /// Alarm/language word of the last status message that carried one.
    pub alarm_language: Option<u16>,
    pub raw_status: Option<RawStatus>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: Option<u8>,
    pub heading: Option<u16>,
    pub north_latitude: Option<bool>,
    pub east_longitude: Option<bool>,
    pub gps_positioned: Option<bool>,
    pub real_time: Option<bool>,
    pub satellites: Option<u8>,
    pub fix_time: Option<NaiveDateTime>,
    pub fix_timestamp: Option<i64>,
    pub cell: Option<CellTower>,
}

impl TelemetrySnapshot {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ..Default::default()
        }
    }

    fn merge_fix(&mut self, fix: &GpsFix) {
        self.latitude = Some(fix.latitude);
        self.longitude = Some(fix.longitude);
        self.speed_kmh = Some(fix.speed_kmh);
        self.heading = Some(fix.course.heading);
        self.north_latitude = Some(fix.course.north_latitude);
        self.east_longitude = Some(!fix.course.west_longitude);
        self.gps_positioned = Some(fix.course.gps_positioned);
        self.real_time = Some(fix.course.real_time);
        self.satellites = Some(fix.satellites);
        self.fix_time = Some(fix.fix_time);
        self.fix_timestamp = Some(fix.unix_timestamp());
    }

    /// Folds the fields carried by `message` into the snapshot.
    pub fn merge(&mut self, message: &DecodedMessage) {
        match message {
            DecodedMessage::Login(login) => {
                if login.timezone.is_some() {
                    self.timezone = login.timezone;
                }
            }
            DecodedMessage::Location(location) => {
                self.merge_fix(&location.fix);
                self.cell = Some(location.cell);
            }
            DecodedMessage::Status(status) => {
                self.terminal = Some(status.terminal);
                self.battery = Some(status.battery);
                self.signal = Some(status.signal);
                if status.alarm_language.is_some() {
                    self.alarm_language = status.alarm_language;
                }
            }
            DecodedMessage::ExtendedLocationStatus(extended) => {
                self.merge_fix(&extended.fix);
                self.cell = Some(extended.cell);
                self.raw_status = Some(extended.status);
            }
            DecodedMessage::CellInfo(_) | DecodedMessage::Unknown { .. } => {}
        }
    }
}

/// One recorded position of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub device_id: String,
    pub fix_time: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: u8,
    pub heading: u16,
}

impl TrackPoint {
    /// Returns the position carried by `message`, if it has one.
    pub fn from_message(device_id: &str, message: &DecodedMessage) -> Option<Self> {
        let fix = match message {
            DecodedMessage::Location(location) => &location.fix,
            DecodedMessage::ExtendedLocationStatus(extended) => &extended.fix,
            _ => return None,
        };
        Some(Self {
            device_id: device_id.to_string(),
            fix_time: fix.fix_time,
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_kmh: fix.speed_kmh,
            heading: fix.course.heading,
        })
    }
}

/// Result of feeding one frame through a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub message: DecodedMessage,
    /// Acknowledgement to write back to the device, in frame order.
    pub ack: Option<Vec<u8>>,
    /// Snapshot copy to hand to the telemetry sink.
    pub snapshot: Option<TelemetrySnapshot>,
    /// Position to append to the device history; every fix is kept.
    pub track: Option<TrackPoint>,
}

/// Protocol state of one device connection.
#[derive(Debug)]
pub struct DeviceSession {
    device_id: Option<String>,
    state: AuthState,
    last_serial_number: Option<u16>,
    snapshot: TelemetrySnapshot,
}

impl DeviceSession {
    pub fn new() -> Self {
        Self {
            device_id: None,
            state: AuthState::Unauthenticated,
            last_serial_number: None,
            snapshot: TelemetrySnapshot::default(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn last_serial_number(&self) -> Option<u16> {
        self.last_serial_number
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    /// Decodes `frame` and applies it to the session.
    ///
    /// Errors are per frame; the caller logs them and keeps the connection open.
    pub fn process(&mut self, frame: &RawFrame) -> std::result::Result<Processed, Error> {
        if self.state == AuthState::Closed {
            return Err(Error::SessionClosed);
        }
        let message = frame.decode()?;
        self.apply(message, frame.serial_number)
    }

    /// Applies an already decoded message carrying `serial_number`.
    pub fn apply(
        &mut self,
        message: DecodedMessage,
        serial_number: u16,
    ) -> std::result::Result<Processed, Error> {
        match self.state {
            AuthState::Closed => return Err(Error::SessionClosed),
            AuthState::Unauthenticated => {
                let DecodedMessage::Login(login) = &message else {
                    log::warn!(
                        "Rejecting {} before login (serial {})",
                        message,
                        serial_number
                    );
                    return Err(Error::NotAuthenticated);
                };
                log::info!("Device {} logged in", login.device_id);
                self.device_id = Some(login.device_id.clone());
                self.snapshot = TelemetrySnapshot::new(&login.device_id);
                self.state = AuthState::Authenticated;
            }
            AuthState::Authenticated => {
                if let (DecodedMessage::Login(login), Some(bound)) = (&message, &self.device_id) {
                    if &login.device_id != bound {
                        log::warn!(
                            "Device {} tried to log in on connection bound to {}",
                            login.device_id,
                            bound
                        );
                        return Err(Error::DeviceMismatch {
                            bound: bound.clone(),
                            received: login.device_id.clone(),
                        });
                    }
                }
            }
        }

        self.last_serial_number = Some(serial_number);
        self.snapshot.merge(&message);
        log::debug!(
            "Device {}: {} (serial {})",
            self.snapshot.device_id,
            message,
            serial_number
        );

        let protocol = message.protocol_number();
        let ack = requires_ack(protocol).then(|| encode_ack(protocol, serial_number));
        let snapshot = match message {
            DecodedMessage::Unknown { .. } => None,
            _ => Some(self.snapshot.clone()),
        };
        let track = TrackPoint::from_message(&self.snapshot.device_id, &message);
        Ok(Processed {
            message,
            ack,
            snapshot,
            track,
        })
    }

    /// Marks the connection as torn down; later frames are refused.
    pub fn close(&mut self) {
        if self.state != AuthState::Closed {
            log::debug!(
                "Session for {} closed",
                self.device_id.as_deref().unwrap_or("<unauthenticated>")
            );
        }
        self.state = AuthState::Closed;
    }
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new()
    }
}
