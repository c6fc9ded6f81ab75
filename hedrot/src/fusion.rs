//! Orientation estimation from the raw sensor triples.
//!
//! A modified Madgwick MARG filter: the accelerometer goes through a one-pole
//! low-pass before the gradient step, and the feedback gain shrinks as the
//! head moves faster.

use hedrot_traits::{EulerAngles, Quaternion, Vector3};
use tracing::debug;

use crate::math::{compose, inv_sqrt, normalize, roll_pitch_yaw, yaw_pitch_roll};
use crate::protocol::RawFrame;
use crate::settings::{AxesReference, ReceiverSettings, RotationOrder};

/// Receiver-side filter parameters, derived from [`ReceiverSettings`] and the
/// device sample rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub beta_max: f32,
    pub beta_gain: f32,
    pub sample_period: f32,
    pub samplerate: f32,
    pub acc_lp_alpha: f32,
    pub axes_reference: AxesReference,
    pub rotation_order: RotationOrder,
    pub invert_rotation: bool,
    pub autocal_on: bool,
    /// Milliseconds of stillness needed to estimate the gyro offset.
    pub autocal_time: f32,
    pub autocal_threshold: i32,
}

impl FusionParams {
    pub fn new(settings: &ReceiverSettings, samplerate: u16) -> Self {
        let samplerate = samplerate.max(1) as f32;
        let sample_period = 1.0 / samplerate;
        Self {
            beta_max: settings.madgwick_beta_max,
            beta_gain: settings.madgwick_beta_gain,
            sample_period,
            samplerate,
            acc_lp_alpha: lowpass_alpha(sample_period, settings.acc_lp_time_constant),
            axes_reference: settings.axes_reference,
            rotation_order: settings.rotation_order,
            invert_rotation: settings.invert_rotation,
            autocal_on: settings.gyro_offset_autocal_on,
            autocal_time: settings.gyro_offset_autocal_time,
            autocal_threshold: settings.gyro_offset_autocal_threshold,
        }
    }
}

impl Default for FusionParams {
    fn default() -> Self {
        Self::new(&ReceiverSettings::default(), 1000)
    }
}

/// `1 - exp(-T/tau)`; a non-positive time constant disables the filter.
pub fn lowpass_alpha(sample_period: f32, time_constant: f32) -> f32 {
    if time_constant <= 0.0 {
        return 1.0;
    }
    1.0 - (-sample_period / time_constant).exp()
}

/// Offsets and scalings applied to raw samples: `cal = (raw - offset) / scaling`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorCalibration {
    pub acc_offset: [f32; 3],
    pub acc_scaling: [f32; 3],
    pub mag_offset: [f32; 3],
    pub mag_scaling: [f32; 3],
    /// rad/s per LSB
    pub gyro_factor: f32,
}

impl Default for SensorCalibration {
    fn default() -> Self {
        Self {
            acc_offset: [0.0; 3],
            acc_scaling: [1.0; 3],
            mag_offset: [0.0; 3],
            mag_scaling: [1.0; 3],
            gyro_factor: 0.0,
        }
    }
}

impl SensorCalibration {
    /// All scaling axes must be strictly positive.
    pub fn is_valid(&self) -> bool {
        self.acc_scaling.iter().chain(self.mag_scaling.iter()).all(|&s| s > 0.0)
    }
}

/// Gyroscope conversion factor in rad/s per LSB.
pub fn gyro_factor(half_scale_sensitivity: f32, bit_depth: i32) -> f32 {
    half_scale_sensitivity * std::f32::consts::PI / 180.0 / 2f32.powi(bit_depth - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum GyroCalState {
    #[default]
    Idle,
    Running,
    Finished,
    Done,
}

/// Progress reported by [`GyroAutoCalibration::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GyroCalEvent {
    Started,
    Finished,
}

/// Estimates the gyro zero by averaging raw samples over a still window.
#[derive(Debug, Clone, PartialEq)]
pub struct GyroAutoCalibration {
    state: GyroCalState,
    counter: u32,
    min: [i32; 3],
    max: [i32; 3],
    sum: [i64; 3],
    offset: [f32; 3],
}

impl Default for GyroAutoCalibration {
    fn default() -> Self {
        Self::new()
    }
}

impl GyroAutoCalibration {
    pub fn new() -> Self {
        Self {
            state: GyroCalState::Idle,
            counter: 0,
            min: [i32::MAX; 3],
            max: [i32::MIN; 3],
            sum: [0; 3],
            offset: [0.0; 3],
        }
    }

    pub fn state(&self) -> GyroCalState {
        self.state
    }

    pub fn offset(&self) -> [f32; 3] {
        self.offset
    }

    pub fn set_offset(&mut self, offset: [f32; 3]) {
        self.offset = offset;
    }

    /// Back to `Idle` with cleared statistics and a zero offset.
    pub fn restart(&mut self) {
        *self = Self::new();
    }

    fn reset_window(&mut self) {
        self.counter = 0;
        self.min = [i32::MAX; 3];
        self.max = [i32::MIN; 3];
        self.sum = [0; 3];
        self.offset = [0.0; 3];
    }

    pub fn update(
        &mut self,
        gyro: [i16; 3],
        threshold: i32,
        time_ms: f32,
        samplerate: f32,
    ) -> Option<GyroCalEvent> {
        match self.state {
            GyroCalState::Idle => {
                self.state = GyroCalState::Running;
                self.accumulate(gyro, threshold, time_ms, samplerate);
                Some(GyroCalEvent::Started)
            }
            GyroCalState::Running => {
                self.accumulate(gyro, threshold, time_ms, samplerate);
                None
            }
            GyroCalState::Finished => {
                self.state = GyroCalState::Done;
                Some(GyroCalEvent::Finished)
            }
            GyroCalState::Done => None,
        }
    }

    fn accumulate(&mut self, gyro: [i16; 3], threshold: i32, time_ms: f32, samplerate: f32) {
        for (i, &g) in gyro.iter().enumerate() {
            let g = g as i32;
            self.max[i] = self.max[i].max(g);
            self.min[i] = self.min[i].min(g);
            self.sum[i] += g as i64;
        }
        self.counter += 1;

        if (0..3).any(|i| self.max[i] - self.min[i] > threshold) {
            self.reset_window();
        }

        if self.counter as f32 >= time_ms / 1000.0 * samplerate {
            let n = self.counter.max(1) as f32;
            self.offset = self.sum.map(|s| s as f32 / n);
            self.state = GyroCalState::Finished;
            debug!("Gyro offset estimated: {:?}", self.offset);
        }
    }
}

/// Per-frame results.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FusionOutput {
    pub raw: RawFrame,
    pub acc: Vector3,
    pub acc_lp: Vector3,
    pub mag: Vector3,
    pub gyro: Vector3,
    /// Filter orientation, in the sensor frame.
    pub q: Quaternion,
    /// Centered, remapped and optionally inverted orientation.
    pub q_centered: Quaternion,
    pub angles: EulerAngles,
    pub beta: f32,
}

#[derive(Debug, Clone)]
pub struct FusionEngine {
    pub params: FusionParams,
    pub calibration: SensorCalibration,
    q: Quaternion,
    q_ref: Quaternion,
    acc_lp_state: [f32; 3],
    gyro_cal: GyroAutoCalibration,
    output: FusionOutput,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(FusionParams::default())
    }
}

impl FusionEngine {
    pub fn new(params: FusionParams) -> Self {
        Self {
            params,
            calibration: SensorCalibration::default(),
            q: Quaternion::IDENTITY,
            q_ref: Quaternion::IDENTITY,
            acc_lp_state: [0.0; 3],
            gyro_cal: GyroAutoCalibration::new(),
            output: FusionOutput::default(),
        }
    }

    /// Clears the filter state before a new stream starts. The centering
    /// reference is kept.
    pub fn reset(&mut self) {
        self.q = Quaternion::IDENTITY;
        self.acc_lp_state = [0.0; 3];
        self.gyro_cal.restart();
    }

    pub fn center(&mut self) {
        self.q_ref = self.q.conjugate();
    }

    pub fn clear_center(&mut self) {
        self.q_ref = Quaternion::IDENTITY;
    }

    pub fn quaternion(&self) -> Quaternion {
        self.q
    }

    pub fn output(&self) -> &FusionOutput {
        &self.output
    }

    pub fn gyro_calibration(&self) -> &GyroAutoCalibration {
        &self.gyro_cal
    }

    pub fn gyro_calibration_mut(&mut self) -> &mut GyroAutoCalibration {
        &mut self.gyro_cal
    }

    /// Runs one frame through the pipeline. `calibration_valid` gates both
    /// the filter update and the gyro autocalibration.
    pub fn process(&mut self, raw: RawFrame, calibration_valid: bool) -> Option<GyroCalEvent> {
        self.output.raw = raw;

        if calibration_valid {
            self.madgwick_update(&raw);
        }

        let mut event = None;
        if self.params.autocal_on && calibration_valid {
            event = self.gyro_cal.update(
                raw.gyro,
                self.params.autocal_threshold,
                self.params.autocal_time,
                self.params.samplerate,
            );
        }

        let mut qc = compose(&self.q_ref, &self.q);
        match self.params.axes_reference {
            AxesReference::RightBackDown => {}
            AxesReference::RightFrontUp => {
                qc.y = -qc.y;
                qc.z = -qc.z;
            }
            AxesReference::FrontLeftUp => {
                let x = qc.x;
                qc.x = -qc.y;
                qc.y = -x;
                qc.z = -qc.z;
            }
        }
        if self.params.invert_rotation {
            qc = qc.conjugate();
        }

        self.output.q = self.q;
        self.output.q_centered = qc;
        self.output.angles = match self.params.rotation_order {
            RotationOrder::YawPitchRoll => yaw_pitch_roll(&qc),
            RotationOrder::RollPitchYaw => roll_pitch_yaw(&qc),
        };
        event
    }

    fn madgwick_update(&mut self, raw: &RawFrame) {
        let cal = &self.calibration;
        let gyro_offset = self.gyro_cal.offset();
        let mut g = [0f32; 3];
        let mut m = [0f32; 3];
        let mut a = [0f32; 3];
        for i in 0..3 {
            g[i] = (raw.gyro[i] as f32 - gyro_offset[i]) * cal.gyro_factor;
            m[i] = (raw.mag[i] as f32 - cal.mag_offset[i]) / cal.mag_scaling[i];
            a[i] = (raw.acc[i] as f32 - cal.acc_offset[i]) / cal.acc_scaling[i];
        }
        let gyro_norm2 = g[0] * g[0] + g[1] * g[1] + g[2] * g[2];

        let alpha = self.params.acc_lp_alpha;
        let mut a_lp = [0f32; 3];
        for i in 0..3 {
            a_lp[i] = alpha * a[i] + (1.0 - alpha) * self.acc_lp_state[i];
        }
        self.acc_lp_state = a_lp;

        self.output.gyro = g.into();
        self.output.mag = m.into();
        self.output.acc = a.into();
        self.output.acc_lp = a_lp.into();

        let m_norm2 = m[0] * m[0] + m[1] * m[1] + m[2] * m[2];
        let a_norm2 = a_lp[0] * a_lp[0] + a_lp[1] * a_lp[1] + a_lp[2] * a_lp[2];
        if m_norm2 == 0.0 || a_norm2 == 0.0 {
            return;
        }

        let r = inv_sqrt(a_norm2);
        let (ax, ay, az) = (a_lp[0] * r, a_lp[1] * r, a_lp[2] * r);
        let r = inv_sqrt(m_norm2);
        let (mx, my, mz) = (m[0] * r, m[1] * r, m[2] * r);

        let Quaternion {
            w: q1,
            x: q2,
            y: q3,
            z: q4,
        } = self.q;

        let _2q1mx = 2.0 * q1 * mx;
        let _2q1my = 2.0 * q1 * my;
        let _2q1mz = 2.0 * q1 * mz;
        let _2q2mx = 2.0 * q2 * mx;
        let _2q1 = 2.0 * q1;
        let _2q2 = 2.0 * q2;
        let _2q3 = 2.0 * q3;
        let _2q4 = 2.0 * q4;
        let _2q1q3 = 2.0 * q1 * q3;
        let _2q3q4 = 2.0 * q3 * q4;
        let q1q1 = q1 * q1;
        let q1q2 = q1 * q2;
        let q1q3 = q1 * q3;
        let q1q4 = q1 * q4;
        let q2q2 = q2 * q2;
        let q2q3 = q2 * q3;
        let q2q4 = q2 * q4;
        let q3q3 = q3 * q3;
        let q3q4 = q3 * q4;
        let q4q4 = q4 * q4;

        // earth magnetic field direction
        let hx = mx * q1q1 - _2q1my * q4 + _2q1mz * q3 + mx * q2q2 + _2q2 * my * q3 + _2q2 * mz * q4
            - mx * q3q3
            - mx * q4q4;
        let hy = _2q1mx * q4 + my * q1q1 - _2q1mz * q2 + _2q2mx * q3 - my * q2q2 + my * q3q3
            + _2q3 * mz * q4
            - my * q4q4;
        let _2bx = (hx * hx + hy * hy).sqrt();
        let _2bz = -_2q1mx * q3 + _2q1my * q2 + mz * q1q1 + _2q2mx * q4 - mz * q2q2 + _2q3 * my * q4
            - mz * q3q3
            + mz * q4q4;
        let _4bx = 2.0 * _2bx;
        let _4bz = 2.0 * _2bz;

        let fa_x = 2.0 * q2q4 - _2q1q3 - ax;
        let fa_y = 2.0 * q1q2 + _2q3q4 - ay;
        let fa_z = 1.0 - 2.0 * q2q2 - 2.0 * q3q3 - az;
        let fm_x = _2bx * (0.5 - q3q3 - q4q4) + _2bz * (q2q4 - q1q3) - mx;
        let fm_y = _2bx * (q2q3 - q1q4) + _2bz * (q1q2 + q3q4) - my;
        let fm_z = _2bx * (q1q3 + q2q4) + _2bz * (0.5 - q2q2 - q3q3) - mz;

        // gradient step
        let mut s1 = -_2q3 * fa_x + _2q2 * fa_y - _2bz * q3 * fm_x
            + (-_2bx * q4 + _2bz * q2) * fm_y
            + _2bx * q3 * fm_z;
        let mut s2 = _2q4 * fa_x + _2q1 * fa_y - 4.0 * q2 * fa_z
            + _2bz * q4 * fm_x
            + (_2bx * q3 + _2bz * q1) * fm_y
            + (_2bx * q4 - _4bz * q2) * fm_z;
        let mut s3 = -_2q1 * fa_x + _2q4 * fa_y - 4.0 * q3 * fa_z
            + (-_4bx * q3 - _2bz * q1) * fm_x
            + (_2bx * q2 + _2bz * q4) * fm_y
            + (_2bx * q1 - _4bz * q3) * fm_z;
        let mut s4 = _2q2 * fa_x + _2q3 * fa_y
            + (-_4bx * q4 + _2bz * q2) * fm_x
            + (-_2bx * q1 + _2bz * q3) * fm_y
            + _2bx * q2 * fm_z;
        let r = inv_sqrt(s1 * s1 + s2 * s2 + s3 * s3 + s4 * s4);
        s1 *= r;
        s2 *= r;
        s3 *= r;
        s4 *= r;

        let mut q_dot1 = 0.5 * (-q2 * g[0] - q3 * g[1] - q4 * g[2]);
        let mut q_dot2 = 0.5 * (q1 * g[0] + q3 * g[2] - q4 * g[1]);
        let mut q_dot3 = 0.5 * (q1 * g[1] - q2 * g[2] + q4 * g[0]);
        let mut q_dot4 = 0.5 * (q1 * g[2] + q2 * g[1] - q3 * g[0]);

        // still head: full correction, fast head: trust the gyro
        let beta = self.params.beta_max
            * (1.0 - (self.params.beta_gain * gyro_norm2).clamp(0.0, 1.0));
        self.output.beta = beta;
        q_dot1 -= beta * s1;
        q_dot2 -= beta * s2;
        q_dot3 -= beta * s3;
        q_dot4 -= beta * s4;

        let dt = self.params.sample_period;
        self.q = normalize(&Quaternion::new(
            q1 + q_dot1 * dt,
            q2 + q_dot2 * dt,
            q3 + q_dot3 * dt,
            q4 + q_dot4 * dt,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-4;

    fn calibrated_engine() -> FusionEngine {
        let mut engine = FusionEngine::default();
        engine.calibration.gyro_factor = gyro_factor(2000.0, 16);
        engine
    }

    fn rest_frame() -> RawFrame {
        RawFrame {
            mag: [100, 0, 0],
            acc: [0, 0, 16384],
            gyro: [0, 0, 0],
        }
    }

    #[test]
    fn test_gyro_factor() {
        let f = gyro_factor(2000.0, 16);
        assert!((f * 32768.0 - 2000f32.to_radians()).abs() < EPSILON);
    }

    #[test]
    fn test_lowpass_alpha() {
        let alpha = lowpass_alpha(0.001, 0.01);
        assert!((alpha - (1.0 - (-0.1f32).exp())).abs() < 1e-6);
        assert_eq!(lowpass_alpha(0.001, 0.0), 1.0);
    }

    #[test]
    fn test_aligned_at_rest_stays_identity() {
        let mut engine = calibrated_engine();
        for _ in 0..200 {
            engine.process(rest_frame(), true);
        }
        let q = engine.quaternion();
        assert!((q.norm_squared() - 1.0).abs() < EPSILON);
        assert!((q.w - 1.0).abs() < EPSILON);
        let out = engine.output();
        assert!(out.angles.yaw.abs() < 0.1 && out.angles.pitch.abs() < 0.1);
    }

    #[test]
    fn test_quaternion_stays_unit_norm_under_rotation() {
        let mut engine = calibrated_engine();
        for i in 0..500 {
            let frame = RawFrame {
                mag: [100, (i % 37) as i16 - 18, 20],
                acc: [300, -200, 16000],
                gyro: [150, -80, 400],
            };
            engine.process(frame, true);
            assert!((engine.quaternion().norm_squared() - 1.0).abs() < EPSILON);
        }
    }

    #[test]
    fn test_center_gives_identity() {
        let mut engine = calibrated_engine();
        for _ in 0..50 {
            engine.process(
                RawFrame {
                    mag: [80, 40, 10],
                    acc: [1000, 2000, 15000],
                    gyro: [300, 100, -200],
                },
                true,
            );
        }
        engine.center();
        let frozen = FusionParams {
            beta_max: 0.0,
            ..engine.params
        };
        engine.params = frozen;
        engine.process(
            RawFrame {
                gyro: [0, 0, 0],
                ..rest_frame()
            },
            true,
        );
        let qc = engine.output().q_centered;
        assert!((qc.w.abs() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_invalid_calibration_skips_update() {
        let mut engine = calibrated_engine();
        engine.process(
            RawFrame {
                gyro: [1000, 0, 0],
                ..rest_frame()
            },
            false,
        );
        assert_eq!(engine.quaternion(), Quaternion::IDENTITY);
        assert_eq!(engine.gyro_calibration().state(), GyroCalState::Idle);
    }

    #[test]
    fn test_axes_remap_and_invert() {
        let mut engine = calibrated_engine();
        engine.params.beta_max = 0.0;
        engine.params.axes_reference = AxesReference::FrontLeftUp;
        engine.params.invert_rotation = true;
        engine.q_ref = Quaternion::new(0.5, 0.5, 0.5, 0.5);
        engine.params.autocal_on = false;
        engine.process(RawFrame::default(), false);
        let qc = engine.output().q_centered;
        assert_eq!(qc, Quaternion::new(0.5, 0.5, 0.5, 0.5));

        engine.params.axes_reference = AxesReference::RightFrontUp;
        engine.params.invert_rotation = false;
        engine.process(RawFrame::default(), false);
        assert_eq!(engine.output().q_centered, Quaternion::new(0.5, 0.5, -0.5, -0.5));
    }

    #[test]
    fn test_gyro_autocal_estimates_offset() {
        let mut cal = GyroAutoCalibration::new();
        let needed = (2000.0 / 1000.0 * 100.0) as usize;
        assert_eq!(cal.update([10, -5, 3], 200, 2000.0, 100.0), Some(GyroCalEvent::Started));
        for _ in 1..needed {
            assert_eq!(cal.update([10, -5, 3], 200, 2000.0, 100.0), None);
        }
        assert_eq!(cal.state(), GyroCalState::Finished);
        assert_eq!(cal.offset(), [10.0, -5.0, 3.0]);
        assert_eq!(cal.update([0, 0, 0], 200, 2000.0, 100.0), Some(GyroCalEvent::Finished));
        assert_eq!(cal.state(), GyroCalState::Done);
        assert_eq!(cal.update([0, 0, 0], 200, 2000.0, 100.0), None);
    }

    #[test]
    fn test_gyro_autocal_resets_on_motion() {
        let mut cal = GyroAutoCalibration::new();
        cal.update([0, 0, 0], 200, 2000.0, 100.0);
        for _ in 0..150 {
            cal.update([0, 0, 0], 200, 2000.0, 100.0);
        }
        cal.update([0, 500, 0], 200, 2000.0, 100.0);
        assert_eq!(cal.state(), GyroCalState::Running);
        assert_eq!(cal.counter, 0);
        assert_eq!(cal.offset(), [0.0; 3]);
    }
}
