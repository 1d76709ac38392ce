use crate::Error;
use chrono::{NaiveDate, NaiveDateTime};
use crc::{Crc, CRC_16_IBM_SDLC};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const START_MARKER: [u8; 2] = [0x78, 0x78];
pub const STOP_MARKER: [u8; 2] = [0x0d, 0x0a];

/// Smallest legal value of the length byte: protocol number, serial number and checksum.
pub const MIN_LENGTH: u8 = 5;
/// Bytes outside the region counted by the length byte: start marker, length byte, stop marker.
pub const FRAME_OVERHEAD: usize = START_MARKER.len() + 1 + STOP_MARKER.len();
pub const ACK_FRAME_SIZE: usize = FRAME_OVERHEAD + MIN_LENGTH as usize;

pub const PROTOCOL_LOGIN: u8 = 0x01;
pub const PROTOCOL_STATUS: u8 = 0x13;
pub const PROTOCOL_LOCATION: u8 = 0x22;
pub const PROTOCOL_CELL_INFO: u8 = 0x24;
pub const PROTOCOL_EXTENDED_LOCATION_STATUS: u8 = 0x26;

// CRC-ITU as used by the tracker firmware (reflected 0x1021, init 0xFFFF, xorout 0xFFFF)
const CRC_ITU: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Computes the frame checksum over `buffer`.
///
/// On the wire the checksum covers everything from the length byte up to and
/// including the serial number.
pub fn checksum(buffer: &[u8]) -> u16 {
    CRC_ITU.checksum(buffer)
}

/// Returns `true` if `expected` is the checksum of `buffer`.
pub fn validate_checksum(buffer: &[u8], expected: u16) -> bool {
    let calculated = checksum(buffer);
    if calculated != expected {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={:02X?}",
            calculated,
            expected,
            buffer
        );
        return false;
    }
    true
}

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

fn validate_len(protocol: u8, payload: &[u8], size: usize) -> std::result::Result<(), Error> {
    if payload.len() < size {
        log::warn!(
            "Invalid payload size for protocol {:#04X} - required={} received={}",
            protocol,
            size,
            payload.len()
        );
        return Err(Error::PayloadTooShort {
            protocol,
            expected: size,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buffer[offset], buffer[offset + 1]])
}

fn read_u24(buffer: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([0, buffer[offset], buffer[offset + 1], buffer[offset + 2]])
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

/// Builds a complete frame around `payload`.
pub fn encode_frame(protocol: u8, payload: &[u8], serial_number: u16) -> Vec<u8> {
    let mut body = payload.to_vec();
    body.extend_from_slice(&serial_number.to_be_bytes());
    encode_body(protocol, &body)
}

/// Builds a login frame as sent by a device: `<id:8> <serial:2> [<timezone:2>]`.
pub fn encode_login(device_id: &[u8; 8], serial_number: u16, timezone: Option<u16>) -> Vec<u8> {
    let mut body = device_id.to_vec();
    body.extend_from_slice(&serial_number.to_be_bytes());
    if let Some(word) = timezone {
        body.extend_from_slice(&word.to_be_bytes());
    }
    encode_body(PROTOCOL_LOGIN, &body)
}

fn encode_body(protocol: u8, body: &[u8]) -> Vec<u8> {
    // the length byte counts protocol number, body and checksum
    let length = 1 + body.len() + 2;
    let mut tx_buffer = Vec::with_capacity(FRAME_OVERHEAD + length);
    tx_buffer.extend_from_slice(&START_MARKER);
    // length is a single byte on the short frame format
    tx_buffer.push(length as u8);
    tx_buffer.push(protocol);
    tx_buffer.extend_from_slice(body);
    let crc = checksum(&tx_buffer[START_MARKER.len()..]);
    tx_buffer.extend_from_slice(&crc.to_be_bytes());
    tx_buffer.extend_from_slice(&STOP_MARKER);
    tx_buffer
}

/// Builds the acknowledgement the device expects for `protocol`, echoing its serial number.
pub fn encode_ack(protocol: u8, serial_number: u16) -> Vec<u8> {
    encode_frame(protocol, &[], serial_number)
}

/// Message types that must be answered with an acknowledgement frame.
pub fn requires_ack(protocol: u8) -> bool {
    protocol == PROTOCOL_LOGIN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    Chinese,
    English,
    Other(u8),
}

impl From<u8> for Language {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Language::Chinese,
            0x02 => Language::English,
            other => Language::Other(other),
        }
    }
}

/// UTC offset reported by the device at login, in signed minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timezone {
    pub offset_minutes: i16,
    pub language: Language,
}

impl Timezone {
    /// Decodes the timezone/language word.
    ///
    /// Bits 15..4 carry the offset as decimal `HHMM` (e.g. 530 for 5:30),
    /// bit 3 is set for western offsets and bits 1..0 select the language.
    pub fn decode(word: u16) -> Self {
        let value = (word >> 4) & 0x0fff;
        let minutes = ((value / 100) * 60 + value % 100) as i16;
        let west = read_bit!(word, 3);
        Self {
            offset_minutes: if west { -minutes } else { minutes },
            language: Language::from((word & 0x03) as u8),
        }
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let minutes = self.offset_minutes.unsigned_abs();
        write!(f, "GMT{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Login {
    /// Terminal identifier (IMEI digits) rendered as 16 hex characters.
    pub device_id: String,
    pub timezone: Option<Timezone>,
}

impl Login {
    pub const MIN_PAYLOAD: usize = 8;

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(PROTOCOL_LOGIN, payload, Self::MIN_PAYLOAD)?;
        let device_id = hex::encode(&payload[..8]);
        // The serial number is already split off, older firmware omits the timezone word.
        let timezone = (payload.len() >= 10).then(|| Timezone::decode(read_u16(payload, 8)));
        Ok(Self {
            device_id,
            timezone,
        })
    }
}

/// Decodes the six calendar bytes (year offset from 2000) as a UTC instant.
pub fn decode_fix_time(raw: &[u8]) -> std::result::Result<NaiveDateTime, Error> {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&raw[..6]);
    NaiveDate::from_ymd_opt(2000 + bytes[0] as i32, bytes[1] as u32, bytes[2] as u32)
        .and_then(|date| date.and_hms_opt(bytes[3] as u32, bytes[4] as u32, bytes[5] as u32))
        .ok_or(Error::InvalidTimestamp(bytes))
}

/// Converts a raw coordinate (units of 1/30000 minute) to degrees.
///
/// The raw magnitude is always positive; the hemisphere comes from the course word.
pub fn decode_coordinate(raw: u32, negative: bool) -> f64 {
    let degrees = raw as f64 / 60.0 / 30000.0;
    if negative {
        -degrees
    } else {
        degrees
    }
}

/// Heading and positioning flags packed into the course word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub heading: u16,
    pub north_latitude: bool,
    pub west_longitude: bool,
    pub gps_positioned: bool,
    pub real_time: bool,
}

impl From<u16> for Course {
    fn from(word: u16) -> Self {
        Self {
            heading: word & 0x03ff,
            north_latitude: read_bit!(word, 10),
            west_longitude: read_bit!(word, 11),
            gps_positioned: read_bit!(word, 12),
            real_time: read_bit!(word, 13),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub fix_time: NaiveDateTime,
    pub gps_info_length: u8,
    pub satellites: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: u8,
    pub course: Course,
}

impl GpsFix {
    pub const SIZE: usize = 18;

    fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        let fix_time = decode_fix_time(&payload[0..6])?;
        let course = Course::from(read_u16(payload, 16));
        Ok(Self {
            fix_time,
            gps_info_length: (payload[6] & 0xf0) >> 4,
            satellites: payload[6] & 0x0f,
            latitude: decode_coordinate(read_u32(payload, 7), !course.north_latitude),
            longitude: decode_coordinate(read_u32(payload, 11), course.west_longitude),
            speed_kmh: payload[15],
            course,
        })
    }

    /// Seconds since the Unix epoch, treating the fix time as UTC.
    pub fn unix_timestamp(&self) -> i64 {
        self.fix_time.and_utc().timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellTower {
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u32,
}

impl CellTower {
    pub const SIZE: usize = 8;

    fn decode(buffer: &[u8]) -> Self {
        Self {
            mcc: read_u16(buffer, 0),
            mnc: buffer[2],
            lac: read_u16(buffer, 3),
            cell_id: read_u24(buffer, 5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub fix: GpsFix,
    pub cell: CellTower,
}

impl Location {
    pub const MIN_PAYLOAD: usize = GpsFix::SIZE + CellTower::SIZE;

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(PROTOCOL_LOCATION, payload, Self::MIN_PAYLOAD)?;
        Ok(Self {
            fix: GpsFix::decode(payload)?,
            cell: CellTower::decode(&payload[GpsFix::SIZE..]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alarm {
    Normal,
    Shock,
    PowerCut,
    LowBattery,
    Sos,
}

impl Alarm {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Alarm::Shock,
            2 => Alarm::PowerCut,
            3 => Alarm::LowBattery,
            4 => Alarm::Sos,
            _ => Alarm::Normal,
        }
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Alarm::Normal => write!(f, "normal"),
            Alarm::Shock => write!(f, "shock"),
            Alarm::PowerCut => write!(f, "power cut"),
            Alarm::LowBattery => write!(f, "low battery"),
            Alarm::Sos => write!(f, "sos"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BatteryLevel {
    NoPower,
    ExtremelyLow,
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl BatteryLevel {
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => BatteryLevel::ExtremelyLow,
            2 => BatteryLevel::VeryLow,
            3 => BatteryLevel::Low,
            4 => BatteryLevel::Medium,
            5 => BatteryLevel::High,
            6 => BatteryLevel::VeryHigh,
            _ => BatteryLevel::NoPower,
        }
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BatteryLevel::NoPower => write!(f, "no power (shutting down)"),
            BatteryLevel::ExtremelyLow => write!(f, "extremely low battery"),
            BatteryLevel::VeryLow => write!(f, "very low battery (low battery alarm)"),
            BatteryLevel::Low => write!(f, "low battery (can be used normally)"),
            BatteryLevel::Medium => write!(f, "medium"),
            BatteryLevel::High => write!(f, "high"),
            BatteryLevel::VeryHigh => write!(f, "very high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalStrength {
    NoSignal,
    ExtremelyWeak,
    VeryWeak,
    Good,
    Strong,
}

impl SignalStrength {
    pub fn from_index(index: u8) -> Self {
        match index {
            1 => SignalStrength::ExtremelyWeak,
            2 => SignalStrength::VeryWeak,
            3 => SignalStrength::Good,
            4 => SignalStrength::Strong,
            _ => SignalStrength::NoSignal,
        }
    }
}

impl fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignalStrength::NoSignal => write!(f, "no signal"),
            SignalStrength::ExtremelyWeak => write!(f, "extremely weak signal"),
            SignalStrength::VeryWeak => write!(f, "very weak signal"),
            SignalStrength::Good => write!(f, "good signal"),
            SignalStrength::Strong => write!(f, "strong signal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub powered: bool,
    pub ignition: bool,
    pub charging: bool,
    pub alarm: Alarm,
    pub gps_tracking: bool,
    pub relay_engaged: bool,
}

impl From<u8> for TerminalInfo {
    fn from(byte: u8) -> Self {
        Self {
            powered: read_bit!(byte, 0),
            ignition: read_bit!(byte, 1),
            charging: read_bit!(byte, 2),
            alarm: Alarm::from_code((byte & 0x38) >> 3),
            gps_tracking: read_bit!(byte, 6),
            relay_engaged: read_bit!(byte, 7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub terminal: TerminalInfo,
    pub battery: BatteryLevel,
    pub signal: SignalStrength,
    pub alarm_language: Option<u16>,
}

impl Status {
    pub const MIN_PAYLOAD: usize = 3;

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(PROTOCOL_STATUS, payload, Self::MIN_PAYLOAD)?;
        Ok(Self {
            terminal: TerminalInfo::from(payload[0]),
            battery: BatteryLevel::from_index(payload[1]),
            signal: SignalStrength::from_index(payload[2]),
            alarm_language: (payload.len() >= 5).then(|| read_u16(payload, 3)),
        })
    }
}

/// Status bytes carried by the combined GPS/LBS/status message, kept unclassified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatus {
    pub terminal_info: u8,
    pub voltage_level: u8,
    pub signal_strength: u8,
    pub alarm_language: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedLocationStatus {
    pub fix: GpsFix,
    pub lbs_length: u8,
    pub cell: CellTower,
    pub status: RawStatus,
}

impl ExtendedLocationStatus {
    pub const MIN_PAYLOAD: usize = GpsFix::SIZE + 1 + CellTower::SIZE + 5;

    /// Layout: `<fix:18> <lbs length:1> <mcc:2> <mnc:1> <lac:2> <cell id:3> <terminal:1>
    /// <voltage:1> <signal:1> <alarm/language:2>`.
    ///
    /// The LBS length byte in front of the MCC is part of the device format.
    /// Reading the MCC at offset 18 shifts every later field by one byte.
    pub fn decode(payload: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(PROTOCOL_EXTENDED_LOCATION_STATUS, payload, Self::MIN_PAYLOAD)?;
        let status = GpsFix::SIZE + 1 + CellTower::SIZE;
        Ok(Self {
            fix: GpsFix::decode(payload)?,
            lbs_length: payload[GpsFix::SIZE],
            cell: CellTower::decode(&payload[GpsFix::SIZE + 1..]),
            status: RawStatus {
                terminal_info: payload[status],
                voltage_level: payload[status + 1],
                signal_strength: payload[status + 2],
                alarm_language: read_u16(payload, status + 3),
            },
        })
    }
}

/// Cell-tower (LBS) report. The layout varies between firmware revisions, so
/// the payload is kept as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInfo {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecodedMessage {
    Login(Login),
    Location(Location),
    Status(Status),
    ExtendedLocationStatus(ExtendedLocationStatus),
    CellInfo(CellInfo),
    Unknown { protocol: u8, payload: Vec<u8> },
}

impl DecodedMessage {
    /// Dispatches `payload` to the decoder for `protocol`.
    ///
    /// Unsupported protocol numbers never fail; they come back as [`DecodedMessage::Unknown`].
    pub fn decode(protocol: u8, payload: &[u8]) -> std::result::Result<Self, Error> {
        let message = match protocol {
            PROTOCOL_LOGIN => DecodedMessage::Login(Login::decode(payload)?),
            PROTOCOL_LOCATION => DecodedMessage::Location(Location::decode(payload)?),
            PROTOCOL_STATUS => DecodedMessage::Status(Status::decode(payload)?),
            PROTOCOL_EXTENDED_LOCATION_STATUS => {
                DecodedMessage::ExtendedLocationStatus(ExtendedLocationStatus::decode(payload)?)
            }
            PROTOCOL_CELL_INFO => DecodedMessage::CellInfo(CellInfo {
                payload: payload.to_vec(),
            }),
            _ => {
                log::debug!(
                    "Unsupported protocol {:#04X} payload={:02X?}",
                    protocol,
                    payload
                );
                DecodedMessage::Unknown {
                    protocol,
                    payload: payload.to_vec(),
                }
            }
        };
        Ok(message)
    }

    pub fn protocol_number(&self) -> u8 {
        match self {
            DecodedMessage::Login(_) => PROTOCOL_LOGIN,
            DecodedMessage::Location(_) => PROTOCOL_LOCATION,
            DecodedMessage::Status(_) => PROTOCOL_STATUS,
            DecodedMessage::ExtendedLocationStatus(_) => PROTOCOL_EXTENDED_LOCATION_STATUS,
            DecodedMessage::CellInfo(_) => PROTOCOL_CELL_INFO,
            DecodedMessage::Unknown { protocol, .. } => *protocol,
        }
    }
}

impl fmt::Display for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodedMessage::Login(login) => write!(f, "login {}", login.device_id),
            DecodedMessage::Location(location) => write!(
                f,
                "location {:.6},{:.6} {}km/h",
                location.fix.latitude, location.fix.longitude, location.fix.speed_kmh
            ),
            DecodedMessage::Status(status) => write!(
                f,
                "status alarm={} battery={} signal={}",
                status.terminal.alarm, status.battery, status.signal
            ),
            DecodedMessage::ExtendedLocationStatus(extended) => write!(
                f,
                "gps/lbs/status {:.6},{:.6}",
                extended.fix.latitude, extended.fix.longitude
            ),
            DecodedMessage::CellInfo(cell) => write!(f, "lbs {} bytes", cell.payload.len()),
            DecodedMessage::Unknown { protocol, payload } => {
                write!(f, "unknown {:#04X} {} bytes", protocol, payload.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LOCATION_PAYLOAD: [u8; 26] = [
        0x0B, 0x08, 0x1D, 0x11, 0x2E, 0x10, 0xCF, 0x02, 0x7A, 0xC7, 0xEB, 0x0C, 0x46, 0x58, 0x49,
        0x00, 0x14, 0x8F, 0x01, 0xCC, 0x00, 0x28, 0x7D, 0x00, 0x1F, 0xB8,
    ];

    fn fix_payload(lat: u32, lon: u32, course: u16) -> Vec<u8> {
        let mut payload = vec![0x18, 0x03, 0x0F, 0x0A, 0x1E, 0x00, 0xC9];
        payload.extend_from_slice(&lat.to_be_bytes());
        payload.extend_from_slice(&lon.to_be_bytes());
        payload.push(42);
        payload.extend_from_slice(&course.to_be_bytes());
        payload
    }

    #[test]
    fn checksum_matches_known_frames() {
        assert_eq!(checksum(b"123456789"), 0x906E);
        assert_eq!(
            checksum(&[0x0D, 0x01, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45, 0x00, 0x01]),
            0x8CDD
        );
    }

    #[test]
    fn ack_layout() {
        let ack = encode_ack(PROTOCOL_LOGIN, 0x0001);
        assert_eq!(
            ack,
            vec![0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]
        );
        assert_eq!(ack.len(), ACK_FRAME_SIZE);
    }

    #[test]
    fn ack_echoes_serial_and_validates() {
        let ack = encode_ack(PROTOCOL_LOGIN, 0xBEEF);
        assert_eq!(&ack[4..6], &[0xBE, 0xEF]);
        let crc = u16::from_be_bytes([ack[6], ack[7]]);
        assert!(validate_checksum(&ack[2..6], crc));
    }

    #[test]
    fn login_without_timezone() {
        let login = Login::decode(&[0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45]).unwrap();
        assert_eq!(login.device_id, "0123456789012345");
        assert_eq!(login.timezone, None);
    }

    #[test]
    fn login_with_timezone() {
        let payload = [0x03, 0x55, 0x95, 0x10, 0x92, 0x33, 0x71, 0x65, 0x32, 0x01];
        let login = Login::decode(&payload).unwrap();
        assert_eq!(login.device_id, "0355951092337165");
        let timezone = login.timezone.unwrap();
        assert_eq!(timezone.offset_minutes, 480);
        assert_eq!(timezone.language, Language::Chinese);
        assert_eq!(timezone.to_string(), "GMT+08:00");
    }

    #[test]
    fn login_frame_layout() {
        let device_id = [0x03, 0x55, 0x95, 0x10, 0x92, 0x33, 0x71, 0x65];
        let frame = encode_login(&device_id, 0x002A, Some(0x3200));
        assert_eq!(frame.len(), 20);
        assert_eq!(frame[2], 0x0F);
        assert_eq!(&frame[12..16], &[0x00, 0x2A, 0x32, 0x00]);
        let crc = u16::from_be_bytes([frame[16], frame[17]]);
        assert!(validate_checksum(&frame[2..16], crc));
        assert_eq!(&frame[18..], &STOP_MARKER);
    }

    #[test]
    fn timezone_west_is_negative() {
        // 5:30 west, english
        let timezone = Timezone::decode(0x212A);
        assert_eq!(timezone.offset_minutes, -330);
        assert_eq!(timezone.language, Language::English);
        assert_eq!(timezone.to_string(), "GMT-05:30");
    }

    #[test]
    fn login_too_short() {
        let err = Login::decode(&[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadTooShort {
                protocol: PROTOCOL_LOGIN,
                expected: 8,
                actual: 3
            }
        ));
    }

    #[test]
    fn location_reference_values() {
        let location = Location::decode(&LOCATION_PAYLOAD).unwrap();
        let fix = &location.fix;
        assert_eq!(
            fix.fix_time,
            NaiveDate::from_ymd_opt(2011, 8, 29)
                .unwrap()
                .and_hms_opt(17, 46, 16)
                .unwrap()
        );
        assert_eq!(fix.unix_timestamp(), 1_314_639_976);
        assert_eq!(fix.gps_info_length, 12);
        assert_eq!(fix.satellites, 15);
        assert!((fix.latitude - 23.111668).abs() < 1e-5);
        assert!((fix.longitude - 114.409285).abs() < 1e-5);
        assert_eq!(fix.speed_kmh, 0);
        assert_eq!(fix.course.heading, 143);
        assert!(fix.course.north_latitude);
        assert!(!fix.course.west_longitude);
        assert!(fix.course.gps_positioned);
        assert!(!fix.course.real_time);
        assert_eq!(
            location.cell,
            CellTower {
                mcc: 460,
                mnc: 0,
                lac: 0x287D,
                cell_id: 0x1FB8
            }
        );
    }

    #[test]
    fn coordinate_signs_follow_course_flags() {
        let raw = 0x01D1A694;
        let mut payload = fix_payload(raw, raw, 0x0400);
        payload.extend_from_slice(&[0; CellTower::SIZE]);
        let fix = Location::decode(&payload).unwrap().fix;
        assert!(fix.latitude > 0.0 && fix.latitude <= 90.0);
        assert!(fix.longitude > 0.0 && fix.longitude <= 180.0);

        let mut payload = fix_payload(raw, raw, 0x0800);
        payload.extend_from_slice(&[0; CellTower::SIZE]);
        let flipped = Location::decode(&payload).unwrap().fix;
        assert_eq!(flipped.latitude, -fix.latitude);
        assert_eq!(flipped.longitude, -fix.longitude);
    }

    #[test]
    fn location_with_invalid_date() {
        let mut payload = LOCATION_PAYLOAD;
        payload[1] = 13;
        assert!(matches!(
            Location::decode(&payload),
            Err(Error::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn status_flags_and_classes() {
        // powered, charging, low battery alarm, gps tracking
        let status = Status::decode(&[0b0101_1101, 0x04, 0x03, 0x00, 0x02]).unwrap();
        assert_eq!(
            status.terminal,
            TerminalInfo {
                powered: true,
                ignition: false,
                charging: true,
                alarm: Alarm::LowBattery,
                gps_tracking: true,
                relay_engaged: false,
            }
        );
        assert_eq!(status.battery, BatteryLevel::Medium);
        assert_eq!(status.signal, SignalStrength::Good);
        assert_eq!(status.alarm_language, Some(0x0002));
    }

    #[test]
    fn status_out_of_range_defaults() {
        let status = Status::decode(&[0b1011_1010, 0x09, 0x07]).unwrap();
        assert_eq!(status.terminal.alarm, Alarm::Normal);
        assert!(status.terminal.ignition);
        assert!(status.terminal.relay_engaged);
        assert_eq!(status.battery, BatteryLevel::NoPower);
        assert_eq!(status.signal, SignalStrength::NoSignal);
        assert_eq!(status.alarm_language, None);
    }

    #[test]
    fn extended_location_keeps_raw_status() {
        let mut payload = LOCATION_PAYLOAD[..GpsFix::SIZE].to_vec();
        payload.push(0x09);
        payload.extend_from_slice(&LOCATION_PAYLOAD[GpsFix::SIZE..]);
        payload.extend_from_slice(&[0x46, 0x06, 0x04, 0x01, 0x02]);
        let extended = ExtendedLocationStatus::decode(&payload).unwrap();
        assert_eq!(extended.lbs_length, 9);
        assert_eq!(extended.cell.mcc, 460);
        assert_eq!(extended.cell.cell_id, 0x1FB8);
        assert_eq!(
            extended.status,
            RawStatus {
                terminal_info: 0x46,
                voltage_level: 6,
                signal_strength: 4,
                alarm_language: 0x0102,
            }
        );
    }

    #[test]
    fn cell_info_and_unknown_are_opaque() {
        let cell = DecodedMessage::decode(PROTOCOL_CELL_INFO, &[1, 2, 3]).unwrap();
        assert_eq!(
            cell,
            DecodedMessage::CellInfo(CellInfo {
                payload: vec![1, 2, 3]
            })
        );
        let unknown = DecodedMessage::decode(0x8A, &[9]).unwrap();
        assert_eq!(unknown.protocol_number(), 0x8A);
        assert!(matches!(unknown, DecodedMessage::Unknown { protocol: 0x8A, .. }));
    }

    #[test]
    fn only_login_requires_ack() {
        assert!(requires_ack(PROTOCOL_LOGIN));
        assert!(!requires_ack(PROTOCOL_LOCATION));
        assert!(!requires_ack(PROTOCOL_STATUS));
    }

    proptest! {
        #[test]
        fn prop_checksum_validates(data in prop::collection::vec(any::<u8>(), 0..256)) {
            prop_assert!(validate_checksum(&data, checksum(&data)));
        }

        #[test]
        fn prop_checksum_detects_bit_flip(
            data in prop::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let crc = checksum(&data);
            let mut corrupted = data.clone();
            let i = index.index(corrupted.len());
            corrupted[i] ^= 1 << bit;
            prop_assert!(!validate_checksum(&corrupted, crc));
        }

        #[test]
        fn prop_coordinates_in_range(
            lat in 0u32..=162_000_000,
            lon in 0u32..=324_000_000,
            flags in 0u16..4,
        ) {
            let course = flags << 10;
            let mut payload = fix_payload(lat, lon, course);
            payload.extend_from_slice(&[0; CellTower::SIZE]);
            let fix = Location::decode(&payload).unwrap().fix;
            prop_assert!(fix.latitude.abs() <= 90.0);
            prop_assert!(fix.longitude.abs() <= 180.0);
            prop_assert_eq!(fix.latitude < 0.0, lat != 0 && course & 0x0400 == 0);
            prop_assert_eq!(fix.longitude < 0.0, lon != 0 && course & 0x0800 != 0);
        }
    }
}
