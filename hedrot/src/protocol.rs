//! Wire protocol spoken between the receiver and the head-tracker board.
//!
//! Receiver-to-device traffic is either a single control byte or a framed
//! command (`start, payload.., stop`). Device-to-receiver traffic uses bit 7
//! as a marker: bytes with the MSB set are raw-data payload, bytes with the
//! MSB clear are control codes.

use byteorder::{ByteOrder, LittleEndian};
use strum::IntoEnumIterator;

pub const FIRMWARE_VERSION: i32 = 10;
pub const BAUD_RATE: u32 = 230_400;
pub const FRAME_LEN: usize = 21;

/// Seconds between two keep-alive pings once a device is connected.
pub const PING_PERIOD: f64 = 0.5;
/// Seconds a candidate port gets to answer `ARE_YOU_THERE`.
pub const AUTODISCOVER_TIMEOUT: f64 = 0.1;

// receiver -> device
pub const R2H_STOP_TRANSMISSION: u8 = 0;
pub const R2H_SEND_INFO: u8 = 1;
pub const R2H_TRANSMIT_SAMPLERATE: u8 = 11;
pub const R2H_START_ACC_HARD_OFFSET: u8 = 32;
pub const R2H_STOP_ACC_HARD_OFFSET: u8 = 33;
pub const R2H_ARE_YOU_THERE: u8 = 126;
pub const R2H_PING: u8 = 127;

// device -> receiver
pub const H2R_END_OF_FRAME: u8 = 0;
pub const H2R_BOARD_OVERLOAD: u8 = 1;
pub const H2R_START_TRANSMIT_INFO: u8 = 11;
pub const H2R_STOP_TRANSMIT_INFO: u8 = 12;
pub const H2R_DATA_RECEIVE_ERROR: u8 = 21;
pub const H2R_I_AM_THERE: u8 = 126;
pub const H2R_PING: u8 = 127;

pub const PAYLOAD_MARKER: u8 = 0x80;

/// One-byte sensor register settings, each sent as `[code, value]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIter)]
#[repr(u8)]
pub enum Register {
    GyroDataRate = 21,
    GyroClockSource = 22,
    GyroDlpfBandwidth = 23,
    AccRange = 31,
    AccFullResolutionBit = 34,
    AccDataRate = 35,
    MagMeasurementBias = 51,
    MagSampleAveraging = 52,
    MagDataRate = 53,
    MagGain = 54,
    MagMeasurementMode = 55,
}

impl Register {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Name used in the settings stream and in settings files.
    pub fn key(self) -> &'static str {
        match self {
            Register::GyroDataRate => "gyroDataRate",
            Register::GyroClockSource => "gyroClockSource",
            Register::GyroDlpfBandwidth => "gyroDLPFBandwidth",
            Register::AccRange => "accRange",
            Register::AccFullResolutionBit => "accFullResolutionBit",
            Register::AccDataRate => "accDataRate",
            Register::MagMeasurementBias => "magMeasurementBias",
            Register::MagSampleAveraging => "magSampleAveraging",
            Register::MagDataRate => "magDataRate",
            Register::MagGain => "magGain",
            Register::MagMeasurementMode => "magMeasurementMode",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Register::iter().find(|r| r.key() == key)
    }
}

/// Calibration vectors stored in the device EEPROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIter)]
pub enum CalibrationVector {
    AccOffset,
    AccScaling,
    MagOffset,
    MagScaling,
}

impl CalibrationVector {
    pub fn key(self) -> &'static str {
        match self {
            CalibrationVector::AccOffset => "accOffset",
            CalibrationVector::AccScaling => "accScaling",
            CalibrationVector::MagOffset => "magOffset",
            CalibrationVector::MagScaling => "magScaling",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        CalibrationVector::iter().find(|v| v.key() == key)
    }

    /// Start and stop markers bracketing the ASCII payload.
    pub fn markers(self) -> (u8, u8) {
        match self {
            CalibrationVector::AccOffset => (2, 3),
            CalibrationVector::AccScaling => (4, 5),
            CalibrationVector::MagOffset => (6, 7),
            CalibrationVector::MagScaling => (8, 9),
        }
    }
}

pub fn register_command(register: Register, value: u8) -> [u8; 2] {
    [register.code(), value]
}

/// Sample rate command, 16 bits least significant byte first.
pub fn samplerate_command(samplerate: u16) -> [u8; 3] {
    let mut message = [R2H_TRANSMIT_SAMPLERATE, 0, 0];
    LittleEndian::write_u16(&mut message[1..], samplerate);
    message
}

/// Float vector sent as space separated ASCII with two decimals.
pub fn float_array_command(target: CalibrationVector, values: &[f32]) -> Vec<u8> {
    let (start, stop) = target.markers();
    let body = values
        .iter()
        .map(|v| format!("{:.2}", v))
        .collect::<Vec<_>>()
        .join(" ");
    let mut message = Vec::with_capacity(body.len() + 2);
    message.push(start);
    message.extend_from_slice(body.as_bytes());
    message.push(stop);
    message
}

pub fn acc_hard_offset_command(values: [i8; 3]) -> [u8; 5] {
    [
        R2H_START_ACC_HARD_OFFSET,
        values[0] as u8,
        values[1] as u8,
        values[2] as u8,
        R2H_STOP_ACC_HARD_OFFSET,
    ]
}

/// One synchronized sample of the three sensors, in raw LSB units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub mag: [i16; 3],
    pub acc: [i16; 3],
    pub gyro: [i16; 3],
}

impl RawFrame {
    pub fn decode(bytes: &[u8; FRAME_LEN]) -> Self {
        RawFrame {
            mag: unpack_triple(&bytes[0..7]),
            acc: unpack_triple(&bytes[7..14]),
            gyro: unpack_triple(&bytes[14..21]),
        }
    }

    /// Inverse of [`RawFrame::decode`], as produced by the board firmware.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut out = [0u8; FRAME_LEN];
        out[0..7].copy_from_slice(&pack_triple(self.mag));
        out[7..14].copy_from_slice(&pack_triple(self.acc));
        out[14..21].copy_from_slice(&pack_triple(self.gyro));
        out
    }
}

// 7 payload bits per byte:
// 1/x15-x9  1/x8-x2  1/x1-x0,y15-y11  1/y10-y4  1/y3-y0,z15-z13  1/z12-z6  1/z5-z0,0
fn unpack_triple(b: &[u8]) -> [i16; 3] {
    let p = |i: usize| (b[i] & 0x7f) as u16;
    let x = (p(0) << 9) | (p(1) << 2) | (p(2) >> 5);
    let y = ((p(2) & 0x1f) << 11) | (p(3) << 4) | (p(4) >> 3);
    let z = ((p(4) & 0x07) << 13) | (p(5) << 6) | (p(6) >> 1);
    [x as i16, y as i16, z as i16]
}

fn pack_triple(v: [i16; 3]) -> [u8; 7] {
    let [x, y, z] = v.map(|c| c as u16);
    let bytes = [
        x >> 9,
        x >> 2,
        ((x & 0x03) << 5) | (y >> 11),
        y >> 4,
        ((y & 0x0f) << 3) | (z >> 13),
        z >> 6,
        (z & 0x3f) << 1,
    ];
    bytes.map(|b| PAYLOAD_MARKER | (b as u8 & 0x7f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Terminator seen after the wrong number of payload bytes.
    BadLength(usize),
}

/// Accumulates payload bytes between two end-of-frame markers.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    buffer: [u8; FRAME_LEN],
    byte_num: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: [0u8; FRAME_LEN],
            byte_num: 0,
        }
    }

    pub fn push(&mut self, byte: u8) {
        if self.byte_num < FRAME_LEN {
            self.buffer[self.byte_num] = byte;
        }
        self.byte_num = self.byte_num.saturating_add(1);
    }

    /// Closes the current frame. The assembler is empty afterwards either way.
    pub fn finish(&mut self) -> Result<RawFrame, FrameError> {
        let count = self.byte_num;
        self.byte_num = 0;
        if count == FRAME_LEN {
            Ok(RawFrame::decode(&self.buffer))
        } else {
            Err(FrameError::BadLength(count))
        }
    }

    pub fn reset(&mut self) {
        self.byte_num = 0;
    }

    pub fn len(&self) -> usize {
        self.byte_num
    }

    pub fn is_empty(&self) -> bool {
        self.byte_num == 0
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frames = [
            RawFrame {
                mag: [100, 0, 0],
                acc: [0, 0, 16384],
                gyro: [0, 0, 0],
            },
            RawFrame {
                mag: [i16::MIN, i16::MAX, -1],
                acc: [-16384, 12345, -32000],
                gyro: [1, -2, 3],
            },
        ];
        for frame in frames {
            let bytes = frame.encode();
            assert!(bytes.iter().all(|b| b & PAYLOAD_MARKER != 0));
            assert_eq!(RawFrame::decode(&bytes), frame);
        }
    }

    #[test]
    fn test_decode_first_axis_layout() {
        let mut bytes = [PAYLOAD_MARKER; FRAME_LEN];
        bytes[0] = 0x80 | 0x01;
        bytes[1] = 0x80 | 0x01;
        bytes[2] = 0x80 | 0x20;
        let frame = RawFrame::decode(&bytes);
        assert_eq!(frame.mag[0], (1 << 9) | (1 << 2) | 1);
    }

    #[test]
    fn test_assembler_rejects_short_frame() {
        let mut assembler = FrameAssembler::new();
        for &b in RawFrame::default().encode()[..20].iter() {
            assembler.push(b);
        }
        assert_eq!(assembler.finish(), Err(FrameError::BadLength(20)));
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_assembler_rejects_long_frame() {
        let mut assembler = FrameAssembler::new();
        for _ in 0..30 {
            assembler.push(0x81);
        }
        assert_eq!(assembler.finish(), Err(FrameError::BadLength(30)));
    }

    #[test]
    fn test_samplerate_is_lsb_first() {
        assert_eq!(samplerate_command(1000), [11, 0xe8, 0x03]);
    }

    #[test]
    fn test_float_array_two_decimals() {
        let message = float_array_command(CalibrationVector::MagOffset, &[1.0, -2.5, 3.14159]);
        assert_eq!(message[0], 6);
        assert_eq!(*message.last().unwrap(), 7);
        assert_eq!(&message[1..message.len() - 1], b"1.00 -2.50 3.14");
    }

    #[test]
    fn test_setting_keys_round_trip() {
        for register in Register::iter() {
            assert_eq!(Register::from_key(register.key()), Some(register));
        }
        assert_eq!(Register::from_key("gyroDLPFBandwidth"), Some(Register::GyroDlpfBandwidth));
        assert_eq!(CalibrationVector::from_key("magScaling"), Some(CalibrationVector::MagScaling));
        assert_eq!(Register::from_key("samplerate"), None);
    }

    #[test]
    fn test_acc_hard_offset_keeps_sign_bits() {
        assert_eq!(acc_hard_offset_command([-1, 0, 2]), [32, 0xff, 0, 2, 33]);
    }
}
