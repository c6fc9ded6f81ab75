//! Device and receiver settings, and the text format used to exchange them.
//!
//! The live handshake stream is a list of `key value[ value..]` pairs
//! separated by commas. Settings files use one `key, value[ value..];` line
//! per parameter, wrapped between `<header>` and `</header>` lines.

use serde::{Deserialize, Serialize};

use crate::calibration::realtime::RtMagStrategy;
use crate::calibration::OfflineCalibrationMethod;
use crate::protocol::{CalibrationVector, Register};

pub const HEADER_START: &str = "<header>";
pub const HEADER_END: &str = "</header>";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Invalid value {value:?} for key {key}")]
    InvalidValue { key: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Gyroscope sensitivity or bit depth missing from the settings stream")]
    MissingGyroScale,
}

/// Axis convention of the centered quaternion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum AxesReference {
    /// X right, Y back, Z down (sensor native)
    #[default]
    RightBackDown,
    /// X right, Y front, Z up
    RightFrontUp,
    /// X front, Y left, Z up
    FrontLeftUp,
}

/// Euler decomposition used for the angle outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
pub enum RotationOrder {
    /// ZYX sequence
    #[default]
    YawPitchRoll,
    /// XYZ sequence
    RollPitchYaw,
}

/// Settings held by the board and mirrored by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub firmware_version: i32,
    pub samplerate: u16,
    pub gyro_data_rate: u8,
    pub gyro_clock_source: u8,
    pub gyro_dlpf_bandwidth: u8,
    pub acc_range: u8,
    pub acc_hard_offset: [i8; 3],
    pub acc_full_resolution_bit: u8,
    pub acc_data_rate: u8,
    pub mag_measurement_bias: u8,
    pub mag_sample_averaging: u8,
    pub mag_data_rate: u8,
    pub mag_gain: u8,
    pub mag_measurement_mode: u8,
    pub acc_offset: [f32; 3],
    pub acc_scaling: [f32; 3],
    pub mag_offset: [f32; 3],
    pub mag_scaling: [f32; 3],
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            firmware_version: 0,
            samplerate: 1000,
            gyro_data_rate: 0,
            gyro_clock_source: 1,
            gyro_dlpf_bandwidth: 1,
            acc_range: 2,
            acc_hard_offset: [0; 3],
            acc_full_resolution_bit: 1,
            acc_data_rate: 13,
            mag_measurement_bias: 0,
            mag_sample_averaging: 0,
            mag_data_rate: 6,
            mag_gain: 4,
            mag_measurement_mode: 1,
            acc_offset: [0.0; 3],
            acc_scaling: [1.0; 3],
            mag_offset: [0.0; 3],
            mag_scaling: [1.0; 3],
        }
    }
}

impl DeviceSettings {
    pub fn sample_period(&self) -> f32 {
        1.0 / self.samplerate.max(1) as f32
    }

    pub fn register(&self, register: Register) -> u8 {
        match register {
            Register::GyroDataRate => self.gyro_data_rate,
            Register::GyroClockSource => self.gyro_clock_source,
            Register::GyroDlpfBandwidth => self.gyro_dlpf_bandwidth,
            Register::AccRange => self.acc_range,
            Register::AccFullResolutionBit => self.acc_full_resolution_bit,
            Register::AccDataRate => self.acc_data_rate,
            Register::MagMeasurementBias => self.mag_measurement_bias,
            Register::MagSampleAveraging => self.mag_sample_averaging,
            Register::MagDataRate => self.mag_data_rate,
            Register::MagGain => self.mag_gain,
            Register::MagMeasurementMode => self.mag_measurement_mode,
        }
    }

    pub fn register_mut(&mut self, register: Register) -> &mut u8 {
        match register {
            Register::GyroDataRate => &mut self.gyro_data_rate,
            Register::GyroClockSource => &mut self.gyro_clock_source,
            Register::GyroDlpfBandwidth => &mut self.gyro_dlpf_bandwidth,
            Register::AccRange => &mut self.acc_range,
            Register::AccFullResolutionBit => &mut self.acc_full_resolution_bit,
            Register::AccDataRate => &mut self.acc_data_rate,
            Register::MagMeasurementBias => &mut self.mag_measurement_bias,
            Register::MagSampleAveraging => &mut self.mag_sample_averaging,
            Register::MagDataRate => &mut self.mag_data_rate,
            Register::MagGain => &mut self.mag_gain,
            Register::MagMeasurementMode => &mut self.mag_measurement_mode,
        }
    }

    pub fn vector(&self, target: CalibrationVector) -> [f32; 3] {
        match target {
            CalibrationVector::AccOffset => self.acc_offset,
            CalibrationVector::AccScaling => self.acc_scaling,
            CalibrationVector::MagOffset => self.mag_offset,
            CalibrationVector::MagScaling => self.mag_scaling,
        }
    }

    pub fn vector_mut(&mut self, target: CalibrationVector) -> &mut [f32; 3] {
        match target {
            CalibrationVector::AccOffset => &mut self.acc_offset,
            CalibrationVector::AccScaling => &mut self.acc_scaling,
            CalibrationVector::MagOffset => &mut self.mag_offset,
            CalibrationVector::MagScaling => &mut self.mag_scaling,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtMagSettings {
    pub enabled: bool,
    pub strategy: RtMagStrategy,
    /// Accepted deviation of the calibrated norm from 1.
    pub max_distance_error: f32,
    /// Seconds between two refits.
    pub calibration_period: f32,
    /// Seconds of raw samples kept by the direct strategy.
    pub max_memory_duration: f32,
    /// Only every n-th magnetometer sample is fed to the calibration.
    pub acquisition_rate_factor: u32,
}

impl Default for RtMagSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: RtMagStrategy::Direct,
            max_distance_error: 0.1,
            calibration_period: 0.5,
            max_memory_duration: 10.0,
            acquisition_rate_factor: 1,
        }
    }
}

impl RtMagSettings {
    pub fn max_number_of_samples(&self, samplerate: u16) -> usize {
        let n = self.max_memory_duration * samplerate as f32 / self.acquisition_rate_factor.max(1) as f32;
        (n.round() as usize).max(1)
    }

    pub fn calibration_rate_factor(&self, samplerate: u16) -> usize {
        let n = self.calibration_period * samplerate as f32 / self.acquisition_rate_factor.max(1) as f32;
        (n.round() as usize).max(1)
    }
}

/// Parameters that only exist on the receiver side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    pub autodiscover: bool,
    pub madgwick_beta_max: f32,
    pub madgwick_beta_gain: f32,
    /// Accelerometer low-pass time constant in seconds.
    pub acc_lp_time_constant: f32,
    pub axes_reference: AxesReference,
    pub rotation_order: RotationOrder,
    pub invert_rotation: bool,
    pub gyro_offset_autocal_on: bool,
    /// Stillness window in milliseconds.
    pub gyro_offset_autocal_time: f32,
    /// Max spread of raw gyro samples (LSB) still considered still.
    pub gyro_offset_autocal_threshold: i32,
    /// Max gyro norm (rad/s) while collecting accelerometer calibration samples.
    pub acc_cal_max_gyro_norm: f32,
    pub offline_calibration_method: OfflineCalibrationMethod,
    pub max_condition_number: f64,
    pub rt_mag: RtMagSettings,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            autodiscover: false,
            madgwick_beta_max: 2.5,
            madgwick_beta_gain: 1.0,
            acc_lp_time_constant: 0.01,
            axes_reference: AxesReference::default(),
            rotation_order: RotationOrder::default(),
            invert_rotation: false,
            gyro_offset_autocal_on: true,
            gyro_offset_autocal_time: 2000.0,
            gyro_offset_autocal_threshold: 200,
            acc_cal_max_gyro_norm: 0.1,
            offline_calibration_method: OfflineCalibrationMethod::default(),
            max_condition_number: crate::calibration::MAX_CONDITION_NUMBER,
            rt_mag: RtMagSettings::default(),
        }
    }
}

/// Splits the handshake payload into key/value pairs.
///
/// The key ends at the first space, the value at the next comma (the
/// trailing comma is optional).
pub fn parse_info_stream(payload: &str) -> Result<Vec<(String, String)>, SettingsError> {
    let mut pairs = Vec::new();
    for segment in payload.split(',') {
        let segment = segment.trim_matches(|c: char| c.is_whitespace() || c.is_control());
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment
            .split_once(' ')
            .ok_or_else(|| SettingsError::Syntax(segment.to_string()))?;
        pairs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

/// Parses the contents of a settings file.
pub fn parse_settings_file(text: &str) -> Result<Vec<(String, String)>, SettingsError> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line == HEADER_START || line == HEADER_END {
            continue;
        }
        let (key, rest) = line
            .split_once(',')
            .ok_or_else(|| SettingsError::Syntax(line.to_string()))?;
        let value = rest
            .split_once(';')
            .map(|(v, _)| v)
            .ok_or_else(|| SettingsError::Syntax(line.to_string()))?;
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

/// Renders key/value entries in the settings file format.
pub fn write_settings(entries: &[(&str, String)]) -> String {
    let mut out = String::new();
    out.push_str(HEADER_START);
    out.push('\n');
    for (key, value) in entries {
        out.push_str(key);
        out.push_str(", ");
        out.push_str(value);
        out.push_str(";\n");
    }
    out.push_str(HEADER_END);
    out.push('\n');
    out
}

pub fn format_floats(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| format!("{:.6}", v))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn format_ints<T: ToString>(values: &[T]) -> String {
    values.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
}

pub fn parse_floats(key: &str, value: &str) -> Result<[f32; 3], SettingsError> {
    parse_triple(key, value)
}

pub fn parse_i8s(key: &str, value: &str) -> Result<[i8; 3], SettingsError> {
    parse_triple(key, value)
}

fn parse_triple<T: std::str::FromStr + Copy + Default>(
    key: &str,
    value: &str,
) -> Result<[T; 3], SettingsError> {
    let invalid = || SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    };
    let mut out = [T::default(); 3];
    let mut tokens = value.split_whitespace();
    for slot in out.iter_mut() {
        *slot = tokens.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
    }
    Ok(out)
}

pub fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Integer values are also accepted in float notation ("1.000000").
pub fn parse_integer(key: &str, value: &str) -> Result<i64, SettingsError> {
    let value = value.trim();
    if let Ok(v) = value.parse::<i64>() {
        return Ok(v);
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v.round() as i64),
        _ => Err(SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_stream_pairs() {
        let pairs =
            parse_info_stream("firmware_version 10,samplerate 500,magOffset 1.5 -2 3,").unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("firmware_version".into(), "10".into()));
        assert_eq!(pairs[2], ("magOffset".into(), "1.5 -2 3".into()));
    }

    #[test]
    fn test_info_stream_without_value_is_rejected() {
        assert!(matches!(
            parse_info_stream("samplerate"),
            Err(SettingsError::Syntax(_))
        ));
    }

    #[test]
    fn test_settings_file_round_trip() {
        let text = write_settings(&[
            ("samplerate", "1000".to_string()),
            ("magScaling", format_floats(&[1.0, 2.0, 0.5])),
        ]);
        assert!(text.starts_with("<header>\n"));
        assert!(text.contains("magScaling, 1.000000 2.000000 0.500000;\n"));
        assert!(text.ends_with("</header>\n"));
        let pairs = parse_settings_file(&text).unwrap();
        assert_eq!(pairs[0], ("samplerate".into(), "1000".into()));
        assert_eq!(parse_floats("magScaling", &pairs[1].1).unwrap(), [1.0, 2.0, 0.5]);
    }

    #[test]
    fn test_settings_line_without_terminator() {
        assert!(parse_settings_file("samplerate, 1000\n").is_err());
    }

    #[test]
    fn test_triples_need_three_values() {
        assert!(parse_floats("accOffset", "1 2").is_err());
        assert_eq!(parse_i8s("accHardOffset", "-1 0 4").unwrap(), [-1, 0, 4]);
        assert!(parse_i8s("accHardOffset", "-1 x 4").is_err());
    }

    #[test]
    fn test_integer_accepts_float_notation() {
        assert_eq!(parse_integer("gyroOffsetAutocalThreshold", "200").unwrap(), 200);
        assert_eq!(parse_integer("gyroOffsetAutocalOn", "1.000000").unwrap(), 1);
        assert!(parse_integer("samplerate", "fast").is_err());
    }

    #[test]
    fn test_receiver_settings_from_partial_toml() {
        let settings: ReceiverSettings = toml::from_str(
            r#"
            madgwick_beta_max = 1.5
            rotation_order = "roll_pitch_yaw"

            [rt_mag]
            enabled = true
            strategy = "iterative"
            "#,
        )
        .unwrap();
        assert_eq!(settings.madgwick_beta_max, 1.5);
        assert_eq!(settings.rotation_order, RotationOrder::RollPitchYaw);
        assert!(settings.rt_mag.enabled);
        assert_eq!(settings.rt_mag.strategy, RtMagStrategy::Iterative);
        assert_eq!(settings.madgwick_beta_gain, 1.0);
    }

    #[test]
    fn test_rt_rates_follow_samplerate() {
        let rt = RtMagSettings::default();
        assert_eq!(rt.max_number_of_samples(1000), 10_000);
        assert_eq!(rt.calibration_rate_factor(1000), 500);
        assert_eq!(rt.calibration_rate_factor(1), 1);
    }
}
