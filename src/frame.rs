//! Reassembles frames from the byte stream of one connection.
//!
//! TCP delivers bytes, not frames: a single read may carry half a frame or
//! several frames back to back. [`FrameReader`] buffers everything it is fed
//! and hands out complete, length- and trailer-checked frames in order.

use crate::protocol::{
    checksum, DecodedMessage, FRAME_OVERHEAD, MIN_LENGTH, PROTOCOL_LOGIN, START_MARKER,
    STOP_MARKER,
};
use crate::Error;
use bytes::{Buf, BytesMut};

/// What to do with a complete frame whose checksum does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    /// Count and drop the frame.
    #[default]
    Enforce,
    /// Emit the frame with `checksum_valid` cleared, for diagnostics.
    Report,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub protocol: u8,
    pub payload: Vec<u8>,
    pub serial_number: u16,
    pub checksum_valid: bool,
}

impl RawFrame {
    pub fn decode(&self) -> std::result::Result<DecodedMessage, Error> {
        DecodedMessage::decode(self.protocol, &self.payload)
    }
}

/// Diagnostic counters for one reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: u64,
    pub checksum_errors: u64,
    pub resyncs: u64,
    pub discarded_bytes: u64,
}

pub struct FrameReader {
    buffer: BytesMut,
    policy: ChecksumPolicy,
    stats: FrameStats,
}

enum Step {
    Frame(RawFrame),
    Rejected,
    NeedMore,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_policy(ChecksumPolicy::Enforce)
    }

    pub fn with_policy(policy: ChecksumPolicy) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            policy,
            stats: FrameStats::default(),
        }
    }

    /// Appends `data` and returns every frame that is now complete.
    ///
    /// Incomplete trailing bytes stay buffered for the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.try_extract_one() {
                Step::Frame(frame) => frames.push(frame),
                Step::Rejected => continue,
                Step::NeedMore => break,
            }
        }
        frames
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Number of bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn discard(&mut self, count: usize) {
        self.buffer.advance(count);
        self.stats.discarded_bytes += count as u64;
    }

    fn resync(&mut self) {
        // Drop the first marker byte so the scan restarts at the next candidate.
        self.stats.resyncs += 1;
        self.discard(1);
    }

    fn try_extract_one(&mut self) -> Step {
        match find_marker(&self.buffer) {
            Some(0) => {}
            Some(offset) => {
                log::warn!("Skipping {offset} bytes before start marker");
                self.discard(offset);
            }
            None => {
                // Keep a trailing 0x78, it may be the first half of a marker.
                let keep = usize::from(self.buffer.last() == Some(&START_MARKER[0]));
                let skip = self.buffer.len() - keep;
                if skip > 0 {
                    log::warn!("Skipping {skip} bytes without start marker");
                    self.discard(skip);
                }
                return Step::NeedMore;
            }
        }

        let header_size = START_MARKER.len() + 1;
        if self.buffer.len() < header_size {
            return Step::NeedMore;
        }

        let length = self.buffer[START_MARKER.len()];
        if length < MIN_LENGTH {
            log::warn!("Invalid length byte {length}, resynchronizing");
            self.resync();
            return Step::Rejected;
        }

        let total = FRAME_OVERHEAD + length as usize;
        if self.buffer.len() < total {
            log::trace!(
                "Waiting for frame - required={} buffered={}",
                total,
                self.buffer.len()
            );
            return Step::NeedMore;
        }

        if self.buffer[total - STOP_MARKER.len()..total] != STOP_MARKER {
            log::warn!(
                "Invalid stop marker {:02X?}, resynchronizing",
                &self.buffer[total - STOP_MARKER.len()..total]
            );
            self.resync();
            return Step::Rejected;
        }

        let frame = self.buffer.split_to(total);
        log::trace!("Frame bytes: {:02X?}", &frame[..]);

        let crc_offset = total - STOP_MARKER.len() - 2;
        let received = u16::from_be_bytes([frame[crc_offset], frame[crc_offset + 1]]);
        let calculated = checksum(&frame[START_MARKER.len()..crc_offset]);
        let checksum_valid = received == calculated;
        if !checksum_valid {
            self.stats.checksum_errors += 1;
            log::warn!(
                "Invalid checksum - calculated={:04X} received={:04X} frame={:02X?}",
                calculated,
                received,
                &frame[..]
            );
            if self.policy == ChecksumPolicy::Enforce {
                return Step::Rejected;
            }
        }

        self.stats.frames += 1;
        let protocol = frame[header_size];
        let (payload, serial_number) = split_body(protocol, &frame[header_size + 1..crc_offset]);
        Step::Frame(RawFrame {
            protocol,
            payload,
            serial_number,
            checksum_valid,
        })
    }
}

/// Separates the serial number from the bytes between protocol number and checksum.
///
/// Every message ends with its serial number except a login carrying the
/// timezone word, where the serial directly follows the 8-byte identifier:
/// `<id:8> <serial:2> <timezone:2>`. The returned login payload is then
/// `<id:8> <timezone:2>`.
fn split_body(protocol: u8, body: &[u8]) -> (Vec<u8>, u16) {
    const ID_LEN: usize = 8;
    if protocol == PROTOCOL_LOGIN && body.len() >= ID_LEN + 4 {
        let serial = u16::from_be_bytes([body[ID_LEN], body[ID_LEN + 1]]);
        let mut payload = body[..ID_LEN].to_vec();
        payload.extend_from_slice(&body[ID_LEN + 2..]);
        return (payload, serial);
    }
    let serial_offset = body.len() - 2;
    (
        body[..serial_offset].to_vec(),
        u16::from_be_bytes([body[serial_offset], body[serial_offset + 1]]),
    )
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(buffer: &[u8]) -> Option<usize> {
    buffer.windows(START_MARKER.len()).position(|w| w == START_MARKER)
}
