//! Connection to one head-tracker board.
//!
//! The session is driven by the host through [`Session::tick`]: discovery,
//! handshake, keep-alive and frame decoding all happen there and never block.
//! Every other public method is a setter or a calibration command that takes
//! effect immediately and, for device-bound values, is transmitted right away
//! when a device is connected.

use std::fs;
use std::path::Path;

use hedrot_traits::{ByteChannel, Clock, MonotonicClock, PortDescriptor};
use tracing::{debug, info, trace, warn};

use crate::calibration::realtime::{RtMagCalibration, RtUpdate};
use crate::calibration::{write_samples, CalibrationData, CalibrationSummary, OfflineCalibrationMethod};
use crate::fusion::{
    gyro_factor, FusionEngine, FusionOutput, FusionParams, GyroCalEvent, GyroCalState,
    SensorCalibration,
};
use crate::notification::{Notification, NotificationQueue};
use crate::protocol::{
    acc_hard_offset_command, float_array_command, register_command, samplerate_command,
    CalibrationVector, FrameAssembler, RawFrame, Register, AUTODISCOVER_TIMEOUT, BAUD_RATE,
    FIRMWARE_VERSION, H2R_BOARD_OVERLOAD, H2R_DATA_RECEIVE_ERROR, H2R_END_OF_FRAME, H2R_I_AM_THERE,
    H2R_PING, H2R_START_TRANSMIT_INFO, H2R_STOP_TRANSMIT_INFO, PAYLOAD_MARKER, PING_PERIOD,
    R2H_ARE_YOU_THERE, R2H_PING, R2H_SEND_INFO, R2H_STOP_TRANSMISSION,
};
use crate::settings::{
    format_floats, format_ints, parse_floats, parse_i8s, parse_info_stream, parse_integer,
    parse_number, parse_settings_file, write_settings, AxesReference, DeviceSettings,
    ReceiverSettings, RotationOrder, RtMagSettings, SettingsError,
};
use crate::{HedrotError, Result};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum_macros::Display,
    strum_macros::FromRepr,
)]
#[repr(u8)]
pub enum CommunicationState {
    #[default]
    Disconnected = 0,
    AutodiscoverStarted = 1,
    AutodiscoverAwaitingResponse = 2,
    AutodiscoverRejected = 3,
    AutodiscoverFound = 4,
    AwaitingInfo = 5,
    ReceivingInfo = 6,
    Transmitting = 7,
}

impl CommunicationState {
    /// A device has been identified and owns the open port.
    pub fn is_connected(self) -> bool {
        self >= CommunicationState::AutodiscoverFound
    }
}

/// Corpus selected by [`Session::dump_cal_info`] and the raw sample exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CalibrationTarget {
    Magnetometer,
    Accelerometer,
    RealTimeMagnetometer,
}

pub struct Session<C: ByteChannel, K: Clock = MonotonicClock> {
    channel: C,
    clock: K,
    state: CommunicationState,

    ports: Vec<PortDescriptor>,
    port_index: Option<usize>,
    autodiscover_deadline: f64,
    next_ping: f64,

    info_buffer: Vec<u8>,
    assembler: FrameAssembler,
    notifications: NotificationQueue,

    device: DeviceSettings,
    receiver: ReceiverSettings,
    gyro_half_scale: Option<f32>,
    gyro_bit_depth: Option<i32>,
    gyro_factor: f32,
    calibration_valid: bool,

    fusion: FusionEngine,
    frame_ready: bool,
    frames_received: u64,

    mag_cal: CalibrationData,
    mag_calibrating: bool,
    acc_cal: CalibrationData,
    acc_calibrating: bool,
    acc_cal_paused: bool,

    rt_mag: Option<RtMagCalibration>,
    rt_acquisition_counter: u32,
}

impl<C: ByteChannel> Session<C, MonotonicClock> {
    pub fn new(channel: C) -> Self {
        Self::with_clock(channel, MonotonicClock::new(), ReceiverSettings::default())
    }
}

impl<C: ByteChannel, K: Clock> Session<C, K> {
    pub fn with_clock(channel: C, clock: K, receiver: ReceiverSettings) -> Self {
        let device = DeviceSettings::default();
        let mut session = Self {
            channel,
            clock,
            state: CommunicationState::Disconnected,
            ports: Vec::new(),
            port_index: None,
            autodiscover_deadline: 0.0,
            next_ping: 0.0,
            info_buffer: Vec::new(),
            assembler: FrameAssembler::new(),
            notifications: NotificationQueue::new(),
            fusion: FusionEngine::new(FusionParams::new(&receiver, device.samplerate)),
            device,
            receiver,
            gyro_half_scale: None,
            gyro_bit_depth: None,
            gyro_factor: 0.0,
            calibration_valid: false,
            frame_ready: false,
            frames_received: 0,
            mag_cal: CalibrationData::new(),
            mag_calibrating: false,
            acc_cal: CalibrationData::new(),
            acc_calibrating: false,
            acc_cal_paused: false,
            rt_mag: None,
            rt_acquisition_counter: 0,
        };
        session.sync_fusion();
        session.rebuild_rt_mag();
        session
    }

    // --- Accessors ---

    pub fn state(&self) -> CommunicationState {
        self.state
    }

    pub fn ports(&self) -> &[PortDescriptor] {
        &self.ports
    }

    /// Port in use or being probed.
    pub fn port_index(&self) -> Option<usize> {
        self.port_index
    }

    pub fn device_settings(&self) -> &DeviceSettings {
        &self.device
    }

    pub fn receiver_settings(&self) -> &ReceiverSettings {
        &self.receiver
    }

    pub fn calibration_valid(&self) -> bool {
        self.calibration_valid
    }

    pub fn gyro_calibration_state(&self) -> GyroCalState {
        self.fusion.gyro_calibration().state()
    }

    pub fn gyro_offset(&self) -> [f32; 3] {
        self.fusion.gyro_calibration().offset()
    }

    pub fn output(&self) -> &FusionOutput {
        self.fusion.output()
    }

    /// Output of the last decoded frame, once per frame.
    pub fn take_frame(&mut self) -> Option<FusionOutput> {
        if std::mem::take(&mut self.frame_ready) {
            Some(*self.fusion.output())
        } else {
            None
        }
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn pull_notification(&mut self) -> Option<Notification> {
        self.notifications.pull()
    }

    pub fn is_mag_calibrating(&self) -> bool {
        self.mag_calibrating
    }

    pub fn is_acc_calibrating(&self) -> bool {
        self.acc_calibrating
    }

    pub fn rt_mag_calibration(&self) -> Option<&RtMagCalibration> {
        self.rt_mag.as_ref()
    }

    // --- Main loop ---

    pub fn tick(&mut self) {
        if !self.state.is_connected() {
            if self.receiver.autodiscover {
                if self.ports.is_empty() {
                    self.refresh_ports();
                }
                self.autodiscover();
            }
            return;
        }

        if !self.channel.is_open() {
            warn!("Port closed underneath the session");
            self.reinitialize();
            return;
        }

        let now = self.clock.now();
        if now >= self.next_ping {
            match self.channel.write(&[R2H_PING]) {
                Ok(1) => self.next_ping = now + PING_PERIOD,
                Ok(n) => {
                    warn!("Ping not sent ({} bytes written)", n);
                    self.reinitialize();
                    return;
                }
                Err(e) => {
                    warn!("Ping failed: {}", e);
                    self.reinitialize();
                    return;
                }
            }
        }

        // one read per tick: bytes arriving while we decode wait for the next one
        if !self.channel.readable() {
            return;
        }
        match self.channel.read() {
            Ok(bytes) => {
                for byte in bytes {
                    self.handle_byte(byte);
                }
            }
            Err(e) => warn!("Read failed: {}", e),
        }
    }

    fn handle_byte(&mut self, byte: u8) {
        if byte == H2R_DATA_RECEIVE_ERROR && self.state.is_connected() {
            warn!("Device reported a receive error");
            return;
        }

        match self.state {
            CommunicationState::AwaitingInfo => {
                if byte == H2R_START_TRANSMIT_INFO {
                    self.info_buffer.clear();
                    self.set_state(CommunicationState::ReceivingInfo);
                }
            }
            CommunicationState::ReceivingInfo => match byte {
                H2R_STOP_TRANSMIT_INFO => self.finish_info(),
                H2R_PING => self.set_state(CommunicationState::Transmitting),
                _ => self.info_buffer.push(byte),
            },
            CommunicationState::Transmitting => {
                if byte & PAYLOAD_MARKER != 0 {
                    self.assembler.push(byte);
                    return;
                }
                match byte {
                    H2R_END_OF_FRAME => match self.assembler.finish() {
                        Ok(frame) => self.process_frame(frame),
                        Err(e) => debug!("Bad stream, frame discarded: {:?}", e),
                    },
                    H2R_BOARD_OVERLOAD => {
                        warn!("Board overload");
                        self.notifications.push(Notification::BoardOverload);
                    }
                    _ => trace!("Ignored control byte {}", byte),
                }
            }
            _ => trace!("Ignored byte {} in state {}", byte, self.state),
        }
    }

    fn set_state(&mut self, state: CommunicationState) {
        debug!("Communication state: {} -> {}", self.state, state);
        self.state = state;
        self.notifications.push(Notification::StatusChanged);
        if state == CommunicationState::ReceivingInfo {
            self.fusion.reset();
            self.assembler.reset();
        }
    }

    /// Drops the connection and every piece of handshake-derived state.
    fn reinitialize(&mut self) {
        self.channel.close();
        self.ports.clear();
        self.port_index = None;
        self.next_ping = 0.0;
        self.info_buffer.clear();
        self.assembler.reset();
        self.fusion.clear_center();
        self.calibration_valid = false;
        self.gyro_half_scale = None;
        self.gyro_bit_depth = None;
        self.set_state(CommunicationState::Disconnected);
    }

    // --- Ports ---

    /// Enumerates the ports again; the probing order restarts from the first.
    pub fn refresh_ports(&mut self) -> &[PortDescriptor] {
        self.ports = self.channel.enumerate();
        self.port_index = None;
        info!("{} serial port(s) available", self.ports.len());
        for (i, port) in self.ports.iter().enumerate() {
            debug!("  {}: {}", i, port);
        }
        self.notifications.push(Notification::PortListUpdated);
        &self.ports
    }

    fn autodiscover(&mut self) {
        if !self.channel.is_open() {
            self.set_state(CommunicationState::AutodiscoverStarted);
            self.try_next_port();
            return;
        }

        let answered = if self.channel.readable() {
            match self.channel.read() {
                Ok(bytes) => bytes.contains(&H2R_I_AM_THERE),
                Err(e) => {
                    debug!("Autodiscover read failed: {}", e);
                    self.channel.close();
                    self.set_state(CommunicationState::AutodiscoverRejected);
                    return;
                }
            }
        } else {
            false
        };

        if answered {
            self.channel.close();
            self.set_state(CommunicationState::AutodiscoverFound);
            if let Some(index) = self.port_index {
                info!("Head tracker found on {}", self.ports[index]);
                if let Err(e) = self.open(index) {
                    warn!("Cannot open the discovered port: {}", e);
                }
            }
        } else if self.clock.now() > self.autodiscover_deadline {
            self.channel.close();
            self.set_state(CommunicationState::AutodiscoverRejected);
        }
    }

    fn try_next_port(&mut self) {
        let next = self.port_index.map_or(0, |i| i + 1);
        if next >= self.ports.len() {
            self.refresh_ports();
            return;
        }
        self.port_index = Some(next);
        let port = self.ports[next].clone();
        debug!("Probing {}", port);
        if let Err(e) = self.channel.open(&port, BAUD_RATE) {
            debug!("Cannot open {}: {}", port, e);
            return;
        }
        match self.channel.write(&[R2H_ARE_YOU_THERE]) {
            Ok(1) => {
                self.autodiscover_deadline = self.clock.now() + AUTODISCOVER_TIMEOUT;
                self.set_state(CommunicationState::AutodiscoverAwaitingResponse);
            }
            _ => {
                self.set_state(CommunicationState::AutodiscoverStarted);
                self.channel.close();
            }
        }
    }

    /// Opens a port from the last enumeration and requests the settings.
    pub fn open(&mut self, port_index: usize) -> Result<()> {
        if self.channel.is_open() {
            self.close();
        }
        let port = self
            .ports
            .get(port_index)
            .cloned()
            .ok_or(hedrot_traits::ChannelError::NoSuchPort(port_index))?;
        self.channel.open(&port, BAUD_RATE)?;
        info!("Opened {}", port);
        self.port_index = Some(port_index);
        self.notifications.push(Notification::PortOpened);
        self.request_settings()
    }

    pub fn close(&mut self) {
        if self.channel.is_open() {
            if let Err(e) = self.channel.write(&[R2H_STOP_TRANSMISSION]) {
                debug!("Stop transmission not sent: {}", e);
            }
        }
        self.channel.close();
        self.set_state(CommunicationState::Disconnected);
    }

    /// Asks the device to resend its settings. The calibration values already
    /// held by the receiver are kept until the new handshake overrides them.
    pub fn request_settings(&mut self) -> Result<()> {
        if !self.channel.is_open() {
            return Err(HedrotError::NotConnected);
        }
        self.set_state(CommunicationState::AwaitingInfo);
        self.send(&[R2H_SEND_INFO])
    }

    fn maybe_request_settings(&mut self, request: bool) -> Result<()> {
        if request && self.channel.is_open() && self.state.is_connected() {
            self.request_settings()?;
        }
        Ok(())
    }

    /// Writes a command to a connected device. Without a device the call is a
    /// no-op; a failed write drops the connection.
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.channel.is_open() || !self.state.is_connected() {
            return Ok(());
        }
        match self.channel.write(bytes) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => {
                warn!("Short write: {} of {} bytes", n, bytes.len());
                self.reinitialize();
                Err(HedrotError::WriteFailed)
            }
            Err(e) => {
                warn!("Write failed: {}", e);
                self.reinitialize();
                Err(HedrotError::WriteFailed)
            }
        }
    }

    // --- Handshake ---

    fn finish_info(&mut self) {
        let payload = String::from_utf8_lossy(&self.info_buffer).into_owned();
        self.info_buffer.clear();
        match self.process_info(&payload) {
            Ok(()) => {
                info!(
                    "Settings received: firmware {}, {} Hz",
                    self.device.firmware_version, self.device.samplerate
                );
                self.assembler.reset();
                self.rebuild_rt_mag();
                self.notifications.push(Notification::SettingsReady);
            }
            Err(e) => {
                warn!("Settings transmission failed: {}", e);
                self.notifications.push(Notification::SettingsTransmissionFailed);
                if let Err(e) = self.request_settings() {
                    debug!("Settings request not sent: {}", e);
                }
            }
        }
    }

    fn process_info(&mut self, payload: &str) -> Result<()> {
        self.calibration_valid = true;
        self.gyro_half_scale = None;
        self.gyro_bit_depth = None;

        for (key, value) in parse_info_stream(payload)? {
            self.apply_setting(&key, &value, false)?;
        }

        match (self.gyro_half_scale, self.gyro_bit_depth) {
            (Some(half_scale), Some(bit_depth)) => {
                self.gyro_factor = gyro_factor(half_scale, bit_depth);
            }
            _ => return Err(SettingsError::MissingGyroScale.into()),
        }
        self.sync_fusion();
        Ok(())
    }

    /// Applies one key/value pair from a handshake or a settings file. With
    /// `update_device` set, device-bound values are also transmitted.
    /// Unknown keys are skipped.
    pub fn apply_setting(&mut self, key: &str, value: &str, update_device: bool) -> Result<()> {
        match key {
            "firmware_version" => {
                let version = parse_integer(key, value)? as i32;
                self.device.firmware_version = version;
                if version != FIRMWARE_VERSION {
                    warn!(
                        "Firmware version {} does not match the expected version {}",
                        version, FIRMWARE_VERSION
                    );
                    self.notifications.push(Notification::WrongFirmwareVersion);
                }
            }
            "samplerate" => {
                let samplerate = parse_integer(key, value)?.clamp(2, u16::MAX as i64) as u16;
                if update_device {
                    self.set_samplerate(samplerate, false)?;
                } else {
                    self.store_samplerate(samplerate);
                }
            }
            "gyroHalfScaleSensitivity" => self.gyro_half_scale = Some(parse_number(key, value)?),
            "gyroBitDepth" => self.gyro_bit_depth = Some(parse_integer(key, value)? as i32),
            "accHardOffset" => {
                let offset = parse_i8s(key, value)?;
                if update_device {
                    self.set_acc_hard_offset(offset, false)?;
                } else {
                    self.device.acc_hard_offset = offset;
                }
            }
            "MadgwickBetaMax" => self.receiver.madgwick_beta_max = parse_number(key, value)?,
            "MadgwickBetaGain" => self.receiver.madgwick_beta_gain = parse_number(key, value)?,
            "gyroOffsetAutocalOn" => {
                self.receiver.gyro_offset_autocal_on = parse_integer(key, value)? != 0
            }
            "gyroOffsetAutocalTime" => {
                self.receiver.gyro_offset_autocal_time = parse_number(key, value)?
            }
            "gyroOffsetAutocalThreshold" => {
                self.receiver.gyro_offset_autocal_threshold = parse_integer(key, value)? as i32
            }
            "gyroOffset" => {
                let offset = parse_floats(key, value)?;
                self.fusion.gyro_calibration_mut().set_offset(offset);
            }
            // derived from other values
            "accLPalpha" | "firmwareVersion" => debug!("Skipping informational key {}", key),
            _ => {
                if let Some(register) = Register::from_key(key) {
                    let value = u8::try_from(parse_integer(key, value)?).map_err(|_| {
                        SettingsError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        }
                    })?;
                    if update_device {
                        self.set_register(register, value, false)?;
                    } else {
                        *self.device.register_mut(register) = value;
                    }
                } else if let Some(target) = CalibrationVector::from_key(key) {
                    let values = parse_floats(key, value)?;
                    if update_device {
                        self.set_calibration_vector(target, values, false)?;
                    } else {
                        self.store_calibration_vector(target, values);
                    }
                } else {
                    warn!("Unknown setting {} = {}", key, value);
                }
            }
        }
        self.sync_fusion();
        Ok(())
    }

    fn sync_fusion(&mut self) {
        self.fusion.params = FusionParams::new(&self.receiver, self.device.samplerate);
        self.fusion.calibration = SensorCalibration {
            acc_offset: self.device.acc_offset,
            acc_scaling: self.device.acc_scaling,
            mag_offset: self.device.mag_offset,
            mag_scaling: self.device.mag_scaling,
            gyro_factor: self.gyro_factor,
        };
    }

    // --- Frames ---

    fn process_frame(&mut self, frame: RawFrame) {
        match self.fusion.process(frame, self.calibration_valid) {
            Some(GyroCalEvent::Started) => {
                debug!("Gyro offset calibration started");
                self.notifications.push(Notification::GyroCalStarted);
            }
            Some(GyroCalEvent::Finished) => {
                info!("Gyro offset calibrated: {:?}", self.gyro_offset());
                self.notifications.push(Notification::GyroCalFinished);
            }
            None => {}
        }
        self.frame_ready = true;
        self.frames_received += 1;

        if self.mag_calibrating && !self.mag_cal.push(frame.mag) {
            trace!("Magnetometer corpus full");
        }
        if self.acc_calibrating {
            self.collect_acc_sample(&frame);
        }
        if self.rt_mag.is_some() {
            self.feed_rt_mag(frame.mag);
        }
    }

    fn collect_acc_sample(&mut self, frame: &RawFrame) {
        let offset = self.gyro_offset();
        let norm = (0..3)
            .map(|i| ((frame.gyro[i] as f32 - offset[i]) * self.gyro_factor).powi(2))
            .sum::<f32>()
            .sqrt();
        if norm < self.receiver.acc_cal_max_gyro_norm {
            if self.acc_cal_paused {
                self.acc_cal_paused = false;
                self.notifications.push(Notification::AccCalResumed);
            }
            if !self.acc_cal.push(frame.acc) {
                trace!("Accelerometer corpus full");
            }
        } else if !self.acc_cal_paused {
            self.acc_cal_paused = true;
            self.notifications.push(Notification::AccCalPaused);
        }
    }

    fn feed_rt_mag(&mut self, mag: [i16; 3]) {
        self.rt_acquisition_counter += 1;
        if self.rt_acquisition_counter < self.receiver.rt_mag.acquisition_rate_factor.max(1) {
            return;
        }
        self.rt_acquisition_counter = 0;

        let Some(rt) = self.rt_mag.as_mut() else {
            return;
        };
        match rt.update(mag) {
            RtUpdate::CalibrationSucceeded => {
                let (offset, scaling) = (rt.offset(), rt.scaling());
                debug!("Real-time mag calibration: offset {:?}, scaling {:?}", offset, scaling);
                self.device.mag_offset = offset;
                self.device.mag_scaling = scaling;
                self.sync_fusion();
                self.notifications.push(Notification::RtMagCalSucceeded);
            }
            RtUpdate::Reset => info!("Real-time mag calibration reset after too many rejections"),
            _ => {}
        }
    }

    fn rebuild_rt_mag(&mut self) {
        self.rt_acquisition_counter = 0;
        self.rt_mag = self.receiver.rt_mag.enabled.then(|| {
            RtMagCalibration::new(
                &self.receiver.rt_mag,
                self.device.samplerate,
                self.device.mag_offset,
                self.device.mag_scaling,
                self.receiver.max_condition_number,
            )
        });
    }

    /// Makes the current head orientation the new reference.
    pub fn center(&mut self) {
        self.fusion.center();
    }

    // --- Device setters ---

    fn store_samplerate(&mut self, samplerate: u16) {
        let changed = self.device.samplerate != samplerate;
        self.device.samplerate = samplerate;
        self.sync_fusion();
        if changed {
            self.rebuild_rt_mag();
        }
    }

    /// Clamped to [2, 65535] Hz. Also recomputes the accelerometer low-pass
    /// coefficient.
    pub fn set_samplerate(&mut self, samplerate: u16, request_settings: bool) -> Result<()> {
        let samplerate = samplerate.max(2);
        self.store_samplerate(samplerate);
        self.send(&samplerate_command(samplerate))?;
        self.maybe_request_settings(request_settings)
    }

    pub fn set_register(&mut self, register: Register, value: u8, request_settings: bool) -> Result<()> {
        *self.device.register_mut(register) = value;
        self.send(&register_command(register, value))?;
        self.maybe_request_settings(request_settings)
    }

    pub fn set_acc_hard_offset(&mut self, offset: [i8; 3], request_settings: bool) -> Result<()> {
        self.device.acc_hard_offset = offset;
        self.send(&acc_hard_offset_command(offset))?;
        self.maybe_request_settings(request_settings)
    }

    fn store_calibration_vector(&mut self, target: CalibrationVector, values: [f32; 3]) {
        *self.device.vector_mut(target) = values;
        let is_scaling = matches!(
            target,
            CalibrationVector::AccScaling | CalibrationVector::MagScaling
        );
        if is_scaling && values.iter().any(|&s| s <= 0.0) {
            warn!("{} {:?} is not a valid scaling", target, values);
            self.calibration_valid = false;
            self.notifications.push(Notification::CalibrationNotValid);
        }
        self.sync_fusion();
    }

    pub fn set_calibration_vector(
        &mut self,
        target: CalibrationVector,
        values: [f32; 3],
        request_settings: bool,
    ) -> Result<()> {
        self.store_calibration_vector(target, values);
        self.send(&float_array_command(target, &values))?;
        self.maybe_request_settings(request_settings)
    }

    // --- Receiver setters ---

    pub fn set_receiver_settings(&mut self, receiver: ReceiverSettings) {
        let rt_changed = receiver.rt_mag != self.receiver.rt_mag;
        self.receiver = receiver;
        self.sync_fusion();
        if rt_changed {
            self.rebuild_rt_mag();
        }
    }

    pub fn set_autodiscover(&mut self, autodiscover: bool) {
        self.receiver.autodiscover = autodiscover;
    }

    pub fn set_madgwick_beta_max(&mut self, beta_max: f32) {
        self.receiver.madgwick_beta_max = beta_max;
        self.sync_fusion();
    }

    pub fn set_madgwick_beta_gain(&mut self, beta_gain: f32) {
        self.receiver.madgwick_beta_gain = beta_gain;
        self.sync_fusion();
    }

    /// Seconds. Recomputes the low-pass coefficient.
    pub fn set_acc_lp_time_constant(&mut self, time_constant: f32) {
        self.receiver.acc_lp_time_constant = time_constant;
        self.sync_fusion();
    }

    pub fn set_axes_reference(&mut self, axes_reference: AxesReference) {
        self.receiver.axes_reference = axes_reference;
        self.sync_fusion();
    }

    pub fn set_rotation_order(&mut self, rotation_order: RotationOrder) {
        self.receiver.rotation_order = rotation_order;
        self.sync_fusion();
    }

    pub fn set_invert_rotation(&mut self, invert: bool) {
        self.receiver.invert_rotation = invert;
        self.sync_fusion();
    }

    /// Turning the autocalibration on restarts it from scratch.
    pub fn set_gyro_offset_autocal_on(&mut self, on: bool) {
        self.receiver.gyro_offset_autocal_on = on;
        if on {
            self.fusion.gyro_calibration_mut().restart();
        }
        self.sync_fusion();
    }

    pub fn set_gyro_offset_autocal_time(&mut self, time_ms: f32) {
        self.receiver.gyro_offset_autocal_time = time_ms;
        self.sync_fusion();
    }

    pub fn set_gyro_offset_autocal_threshold(&mut self, threshold: i32) {
        self.receiver.gyro_offset_autocal_threshold = threshold;
        self.sync_fusion();
    }

    pub fn set_gyro_offset(&mut self, offset: [f32; 3]) {
        self.fusion.gyro_calibration_mut().set_offset(offset);
    }

    pub fn set_acc_cal_max_gyro_norm(&mut self, max_norm: f32) {
        self.receiver.acc_cal_max_gyro_norm = max_norm;
    }

    pub fn set_offline_calibration_method(&mut self, method: OfflineCalibrationMethod) {
        self.receiver.offline_calibration_method = method;
    }

    pub fn set_max_condition_number(&mut self, max_condition_number: f64) {
        self.receiver.max_condition_number = max_condition_number;
        self.rebuild_rt_mag();
    }

    /// Replaces the real-time parameters; the real-time state restarts.
    pub fn set_rt_mag_settings(&mut self, settings: RtMagSettings) {
        self.receiver.rt_mag = settings;
        self.rebuild_rt_mag();
    }

    pub fn set_rt_mag_calibration(&mut self, enabled: bool) {
        self.receiver.rt_mag.enabled = enabled;
        self.rebuild_rt_mag();
    }

    // --- Calibration lifecycle ---

    pub fn start_mag_calibration(&mut self) {
        self.mag_cal.clear();
        self.mag_calibrating = true;
        info!("Magnetometer calibration started");
        self.notifications.push(Notification::MagCalStarted);
    }

    pub fn stop_mag_calibration(&mut self) -> Result<()> {
        self.mag_calibrating = false;
        self.redo_mag_calibration()
    }

    /// Fits the collected magnetometer corpus again, with the current method.
    pub fn redo_mag_calibration(&mut self) -> Result<()> {
        let method = self.receiver.offline_calibration_method;
        match self.mag_cal.calibrate(method, self.receiver.max_condition_number) {
            Ok(result) => {
                self.device.mag_offset = result.offset;
                self.device.mag_scaling = result.scaling;
                self.sync_fusion();
                self.rebuild_rt_mag();
                self.notifications.push(Notification::MagCalSucceeded);
                Ok(())
            }
            Err(e) => {
                self.notifications.push(Notification::MagCalFailed);
                Err(e.into())
            }
        }
    }

    /// Writes the live magnetometer calibration to the device.
    pub fn save_mag_calibration(&mut self) -> Result<()> {
        if !self.state.is_connected() {
            return Err(HedrotError::NotConnected);
        }
        let (scaling, offset) = (self.device.mag_scaling, self.device.mag_offset);
        self.send(&float_array_command(CalibrationVector::MagScaling, &scaling))?;
        self.send(&float_array_command(CalibrationVector::MagOffset, &offset))?;
        self.request_settings()
    }

    pub fn start_acc_calibration(&mut self) {
        self.acc_cal.clear();
        self.acc_calibrating = true;
        self.acc_cal_paused = false;
        info!("Accelerometer calibration started");
        self.notifications.push(Notification::AccCalStarted);
    }

    pub fn stop_acc_calibration(&mut self) -> Result<()> {
        self.acc_calibrating = false;
        self.acc_cal_paused = false;
        self.redo_acc_calibration()
    }

    pub fn redo_acc_calibration(&mut self) -> Result<()> {
        let method = self.receiver.offline_calibration_method;
        match self.acc_cal.calibrate(method, self.receiver.max_condition_number) {
            Ok(result) => {
                self.device.acc_offset = result.offset;
                self.device.acc_scaling = result.scaling;
                self.sync_fusion();
                self.notifications.push(Notification::AccCalSucceeded);
                Ok(())
            }
            Err(e) => {
                self.notifications.push(Notification::AccCalFailed);
                Err(e.into())
            }
        }
    }

    pub fn save_acc_calibration(&mut self) -> Result<()> {
        if !self.state.is_connected() {
            return Err(HedrotError::NotConnected);
        }
        let (scaling, offset) = (self.device.acc_scaling, self.device.acc_offset);
        self.send(&float_array_command(CalibrationVector::AccScaling, &scaling))?;
        self.send(&float_array_command(CalibrationVector::AccOffset, &offset))?;
        self.request_settings()
    }

    pub fn dump_cal_info(&self, target: CalibrationTarget) -> CalibrationSummary {
        match target {
            CalibrationTarget::Magnetometer => self.mag_cal.summary(),
            CalibrationTarget::Accelerometer => self.acc_cal.summary(),
            CalibrationTarget::RealTimeMagnetometer => self
                .rt_mag
                .as_ref()
                .map(RtMagCalibration::summary)
                .unwrap_or_default(),
        }
    }

    /// Writes the raw samples of a corpus, one `x y z` line each.
    pub fn export_raw_samples(&mut self, target: CalibrationTarget, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let written = match target {
            CalibrationTarget::Magnetometer => self.mag_cal.export_raw(path),
            CalibrationTarget::Accelerometer => self.acc_cal.export_raw(path),
            CalibrationTarget::RealTimeMagnetometer => match &self.rt_mag {
                Some(rt) => rt.export_raw(path),
                None => write_samples(path, std::iter::empty()),
            },
        };
        written.map_err(|e| {
            warn!("Cannot export {} samples to {}: {}", target, path.display(), e);
            self.notifications.push(match target {
                CalibrationTarget::Magnetometer => Notification::ExportMagCalRawSamplesFailed,
                CalibrationTarget::Accelerometer => Notification::ExportAccCalRawSamplesFailed,
                CalibrationTarget::RealTimeMagnetometer => {
                    Notification::ExportRtMagCalRawSamplesFailed
                }
            });
            HedrotError::Io(e)
        })
    }

    // --- Settings files ---

    fn settings_entries(&self) -> Vec<(&'static str, String)> {
        let d = &self.device;
        let r = &self.receiver;
        let mut entries = vec![
            ("MadgwickBetaMax", format_floats(&[r.madgwick_beta_max])),
            ("MadgwickBetaGain", format_floats(&[r.madgwick_beta_gain])),
            ("accLPalpha", format_floats(&[self.fusion.params.acc_lp_alpha])),
            ("firmwareVersion", d.firmware_version.to_string()),
            ("samplerate", d.samplerate.to_string()),
        ];
        for register in [
            Register::GyroDataRate,
            Register::GyroClockSource,
            Register::GyroDlpfBandwidth,
        ] {
            entries.push((register.key(), d.register(register).to_string()));
        }
        entries.push((
            "gyroOffsetAutocalOn",
            u8::from(r.gyro_offset_autocal_on).to_string(),
        ));
        entries.push((Register::AccRange.key(), d.acc_range.to_string()));
        entries.push(("accHardOffset", format_ints(&d.acc_hard_offset)));
        for register in [
            Register::AccFullResolutionBit,
            Register::AccDataRate,
            Register::MagMeasurementBias,
            Register::MagSampleAveraging,
            Register::MagDataRate,
            Register::MagGain,
            Register::MagMeasurementMode,
        ] {
            entries.push((register.key(), d.register(register).to_string()));
        }
        entries.push(("gyroOffset", format_floats(&self.gyro_offset())));
        entries.push((
            "gyroOffsetAutocalTime",
            format_floats(&[r.gyro_offset_autocal_time]),
        ));
        entries.push((
            "gyroOffsetAutocalThreshold",
            r.gyro_offset_autocal_threshold.to_string(),
        ));
        for target in [
            CalibrationVector::AccOffset,
            CalibrationVector::AccScaling,
            CalibrationVector::MagOffset,
            CalibrationVector::MagScaling,
        ] {
            entries.push((target.key(), format_floats(&d.vector(target))));
        }
        entries
    }

    pub fn export_settings(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = write_settings(&self.settings_entries());
        fs::write(path, text).map_err(|e| {
            warn!("Cannot export settings to {}: {}", path.display(), e);
            self.notifications.push(Notification::ExportFailed);
            HedrotError::Io(e)
        })?;
        info!("Settings exported to {}", path.display());
        Ok(())
    }

    /// Applies a settings file and transmits the device-bound values. Stops at
    /// the first invalid entry.
    pub fn import_settings(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match self.import_settings_inner(path) {
            Ok(()) => {
                info!("Settings imported from {}", path.display());
                Ok(())
            }
            Err(e) => {
                warn!("Cannot import settings from {}: {}", path.display(), e);
                self.notifications.push(Notification::ImportFailed);
                Err(e)
            }
        }
    }

    fn import_settings_inner(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(SettingsError::from)?;
        for (key, value) in parse_settings_file(&text)? {
            self.apply_setting(&key, &value, true)?;
        }
        self.maybe_request_settings(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ManualClock, MockChannel};

    fn session() -> Session<MockChannel, ManualClock> {
        Session::with_clock(
            MockChannel::new(&["a"]),
            ManualClock::new(),
            ReceiverSettings::default(),
        )
    }

    fn drain(session: &mut Session<MockChannel, ManualClock>) -> Vec<Notification> {
        std::iter::from_fn(|| session.pull_notification()).collect()
    }

    #[test]
    fn test_state_ordering() {
        assert!(!CommunicationState::AutodiscoverRejected.is_connected());
        assert!(CommunicationState::AutodiscoverFound.is_connected());
        assert!(CommunicationState::Transmitting.is_connected());
        assert_eq!(CommunicationState::from_repr(5), Some(CommunicationState::AwaitingInfo));
    }

    #[test]
    fn test_handshake_computes_gyro_factor() {
        let mut s = session();
        s.process_info("firmware_version 10,samplerate 500,gyroHalfScaleSensitivity 2000,gyroBitDepth 16,")
            .unwrap();
        assert_eq!(s.device_settings().samplerate, 500);
        let expected = gyro_factor(2000.0, 16);
        assert_eq!(s.fusion.calibration.gyro_factor, expected);
        assert!((s.fusion.params.sample_period - 0.002).abs() < 1e-9);
        assert!(s.calibration_valid());
    }

    #[test]
    fn test_handshake_without_gyro_scale_fails() {
        let mut s = session();
        let err = s.process_info("firmware_version 10,gyroBitDepth 16").unwrap_err();
        assert!(matches!(err, HedrotError::Settings(SettingsError::MissingGyroScale)));
    }

    #[test]
    fn test_wrong_firmware_is_reported() {
        let mut s = session();
        s.apply_setting("firmware_version", "9", false).unwrap();
        assert_eq!(drain(&mut s), vec![Notification::WrongFirmwareVersion]);
        assert_eq!(s.device_settings().firmware_version, 9);
    }

    #[test]
    fn test_negative_scaling_invalidates_calibration() {
        let mut s = session();
        s.process_info("gyroHalfScaleSensitivity 2000,gyroBitDepth 16,magScaling 1.0 -1.0 1.0")
            .unwrap();
        assert!(!s.calibration_valid());
        assert_eq!(drain(&mut s), vec![Notification::CalibrationNotValid]);
    }

    #[test]
    fn test_register_keys_update_device_settings() {
        let mut s = session();
        s.apply_setting("magGain", "3", false).unwrap();
        s.apply_setting("gyroDLPFBandwidth", "5", false).unwrap();
        s.apply_setting("accHardOffset", "-1 0 2", false).unwrap();
        assert_eq!(s.device_settings().mag_gain, 3);
        assert_eq!(s.device_settings().gyro_dlpf_bandwidth, 5);
        assert_eq!(s.device_settings().acc_hard_offset, [-1, 0, 2]);
        assert!(s.apply_setting("magGain", "300", false).is_err());
        // unknown keys are skipped
        s.apply_setting("someFutureKey", "1", false).unwrap();
    }

    #[test]
    fn test_setters_without_device_store_only() {
        let mut s = session();
        let channel = s.channel.clone();
        s.set_samplerate(1, true).unwrap();
        assert_eq!(s.device_settings().samplerate, 2);
        s.set_register(Register::MagDataRate, 4, true).unwrap();
        assert_eq!(s.device_settings().mag_data_rate, 4);
        assert!(channel.take_written().is_empty());
        assert_eq!(s.state(), CommunicationState::Disconnected);
    }

    #[test]
    fn test_lp_time_constant_recomputes_alpha() {
        let mut s = session();
        let before = s.fusion.params.acc_lp_alpha;
        s.set_acc_lp_time_constant(0.1);
        assert!(s.fusion.params.acc_lp_alpha < before);
    }

    #[test]
    fn test_autocal_switch_restarts_estimation() {
        let mut s = session();
        s.set_gyro_offset([1.0, 2.0, 3.0]);
        s.set_gyro_offset_autocal_on(true);
        assert_eq!(s.gyro_offset(), [0.0; 3]);
        assert_eq!(s.gyro_calibration_state(), GyroCalState::Idle);
    }

    #[test]
    fn test_dump_without_rt_calibration_is_empty() {
        let s = session();
        let summary = s.dump_cal_info(CalibrationTarget::RealTimeMagnetometer);
        assert_eq!(summary.number_of_samples, 0);
    }
}
