//! Magnetometer calibration refined while the tracker is running.
//!
//! Both strategies start by fitting a ring buffer of recent raw samples.
//! Once a fit has been accepted, points too far from the unit sphere are
//! rejected, and a sustained rejection rate restarts everything (the
//! magnetic environment changed). The iterative strategy then switches to
//! binning points into zones spread over the sphere and fits the zone
//! averages, which keeps the fit input small and evenly distributed.

use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    cook_calibration_data, ellipsoid_fit, filter_cal_data, write_samples, CalibrationError,
    CalibrationSummary, CookedSamples, EllipsoidFit,
};
use crate::math::{mean, modulo};
use crate::settings::RtMagSettings;

pub const NUMBER_OF_ZONES: usize = 100;
pub const POINTS_PER_ZONE: usize = 100;
pub const MIN_FILLED_ZONES: usize = 20;

const INV_GOLDEN_RATIO: f64 = 0.618_033_988_749_894_8;
const REJECTION_TIME_CONSTANT: f32 = 1600.0;
const MAX_REJECTED_PROPORTION: f32 = 0.5;
/// Accepted `norm_std_dev / norm_average` of a fit.
const MAX_NORMALIZED_STD_DEV: f64 = 0.1;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum RtMagStrategy {
    #[default]
    Direct,
    Iterative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum RtPhase {
    /// Fitting the ring buffer of raw samples.
    Bootstrap,
    /// Fitting the zone averages (iterative strategy only).
    Zoned,
}

/// What happened to a sample passed to [`RtMagCalibration::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtUpdate {
    Rejected,
    Added,
    CalibrationFailed,
    CalibrationSucceeded,
    /// Too many rejections, the state was cleared.
    Reset,
}

/// Near-uniform points on the unit sphere (Fibonacci lattice).
pub fn fibonacci_points() -> Vec<[f64; 3]> {
    (0..NUMBER_OF_ZONES)
        .map(|i| {
            let theta = 2.0 * std::f64::consts::PI * modulo(INV_GOLDEN_RATIO * i as f64, 1.0);
            let z = 1.0 - (2.0 * i as f64 + 1.0) / NUMBER_OF_ZONES as f64;
            let r = (1.0 - z * z).sqrt();
            [theta.cos() * r, theta.sin() * r, z]
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
struct Zone {
    points: Vec<[i16; 3]>,
    next: usize,
    average: [f64; 3],
}

impl Zone {
    fn push(&mut self, point: [i16; 3]) {
        if self.points.len() < POINTS_PER_ZONE {
            self.points.push(point);
        } else {
            self.points[self.next] = point;
        }
        self.next = (self.next + 1) % POINTS_PER_ZONE;

        let n = self.points.len() as f64;
        let mut sum = [0.0; 3];
        for p in &self.points {
            for i in 0..3 {
                sum[i] += p[i] as f64;
            }
        }
        self.average = sum.map(|s| s / n);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Baseline {
    condition_number: f64,
    norm_std_dev: f64,
}

#[derive(Debug, Clone)]
pub struct RtMagCalibration {
    strategy: RtMagStrategy,
    phase: RtPhase,
    max_condition_number: f64,

    accept_band: (f32, f32),
    sanity_band: (f32, f32),
    calibration_rate_factor: usize,
    countdown: usize,

    max_samples: usize,
    samples: VecDeque<[i16; 3]>,

    fibonacci: Vec<[f64; 3]>,
    zones: Vec<Zone>,
    filled_zones: usize,

    initial_offset: [f32; 3],
    initial_scaling: [f32; 3],
    offset: [f32; 3],
    scaling: [f32; 3],

    baseline: Option<Baseline>,
    rejection_rate: f32,
    last_fit: Option<(EllipsoidFit, CookedSamples)>,
}

impl RtMagCalibration {
    /// Starts from the given magnetometer calibration.
    pub fn new(
        settings: &RtMagSettings,
        samplerate: u16,
        offset: [f32; 3],
        scaling: [f32; 3],
        max_condition_number: f64,
    ) -> Self {
        let e = settings.max_distance_error;
        let sanity_low = (1.0 - 2.0 * e).max(0.0);
        let calibration_rate_factor = settings.calibration_rate_factor(samplerate);
        Self {
            strategy: settings.strategy,
            phase: RtPhase::Bootstrap,
            max_condition_number,
            accept_band: ((1.0 - e) * (1.0 - e), (1.0 + e) * (1.0 + e)),
            sanity_band: (sanity_low * sanity_low, (1.0 + 2.0 * e) * (1.0 + 2.0 * e)),
            calibration_rate_factor,
            countdown: calibration_rate_factor,
            max_samples: settings.max_number_of_samples(samplerate),
            samples: VecDeque::new(),
            fibonacci: fibonacci_points(),
            zones: vec![Zone::default(); NUMBER_OF_ZONES],
            filled_zones: 0,
            initial_offset: offset,
            initial_scaling: scaling,
            offset,
            scaling,
            baseline: None,
            rejection_rate: 0.0,
            last_fit: None,
        }
    }

    pub fn strategy(&self) -> RtMagStrategy {
        self.strategy
    }

    pub fn phase(&self) -> RtPhase {
        self.phase
    }

    pub fn offset(&self) -> [f32; 3] {
        self.offset
    }

    pub fn scaling(&self) -> [f32; 3] {
        self.scaling
    }

    /// True once a fit has been accepted since the last reset.
    pub fn is_calibrated(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn filled_zones(&self) -> usize {
        self.filled_zones
    }

    pub fn rejection_rate(&self) -> f32 {
        self.rejection_rate
    }

    pub fn number_of_samples(&self) -> usize {
        match self.phase {
            RtPhase::Bootstrap => self.samples.len(),
            RtPhase::Zoned => self.zones.iter().map(|z| z.points.len()).sum(),
        }
    }

    /// Clears the corpus and goes back to the starting calibration.
    pub fn reset(&mut self) {
        self.phase = RtPhase::Bootstrap;
        self.countdown = self.calibration_rate_factor;
        self.samples.clear();
        self.zones = vec![Zone::default(); NUMBER_OF_ZONES];
        self.filled_zones = 0;
        self.offset = self.initial_offset;
        self.scaling = self.initial_scaling;
        self.baseline = None;
        self.rejection_rate = 0.0;
        self.last_fit = None;
    }

    fn scale(&self, raw: [i16; 3]) -> [f32; 3] {
        [0, 1, 2].map(|i| (raw[i] as f32 - self.offset[i]) / self.scaling[i])
    }

    pub fn update(&mut self, raw: [i16; 3]) -> RtUpdate {
        let cal = self.scale(raw);
        let norm2 = cal[0] * cal[0] + cal[1] * cal[1] + cal[2] * cal[2];

        if self.baseline.is_some() {
            let band = match self.phase {
                RtPhase::Bootstrap => self.accept_band,
                RtPhase::Zoned => self.sanity_band,
            };
            let rejected = norm2 < band.0 || norm2 > band.1;
            let sample = if rejected { 1.0 } else { 0.0 };
            self.rejection_rate += (sample - self.rejection_rate) / REJECTION_TIME_CONSTANT;
            if self.rejection_rate > MAX_REJECTED_PROPORTION {
                warn!(
                    "Real-time mag calibration: rejection rate {:.2}, restarting",
                    self.rejection_rate
                );
                self.reset();
                return RtUpdate::Reset;
            }
            if rejected {
                return RtUpdate::Rejected;
            }
        }

        match self.phase {
            RtPhase::Bootstrap => {
                if self.samples.len() >= self.max_samples {
                    self.samples.pop_front();
                }
                self.samples.push_back(raw);
            }
            RtPhase::Zoned => self.add_to_zone(raw, cal),
        }

        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return RtUpdate::Added;
        }
        self.countdown = self.calibration_rate_factor;

        match self.phase {
            RtPhase::Bootstrap => self.fit_samples(),
            RtPhase::Zoned => self.fit_zones(),
        }
    }

    fn nearest_zone(&self, cal: [f32; 3]) -> usize {
        let norm = (cal[0] * cal[0] + cal[1] * cal[1] + cal[2] * cal[2]).sqrt();
        let p = if norm > 0.0 { cal.map(|v| (v / norm) as f64) } else { cal.map(f64::from) };
        let mut best = 0;
        let mut best_d2 = f64::INFINITY;
        for (i, f) in self.fibonacci.iter().enumerate() {
            let d2 = (p[0] - f[0]).powi(2) + (p[1] - f[1]).powi(2) + (p[2] - f[2]).powi(2);
            if d2 < best_d2 {
                best_d2 = d2;
                best = i;
            }
        }
        best
    }

    fn add_to_zone(&mut self, raw: [i16; 3], cal: [f32; 3]) {
        let zone = self.nearest_zone(cal);
        if self.zones[zone].points.is_empty() {
            self.filled_zones += 1;
        }
        self.zones[zone].push(raw);
    }

    /// Fits `samples` and adopts the result if it qualifies. `Ok(false)`
    /// means the fit worked but did not beat the current baseline.
    fn evaluate(&mut self, samples: &[[f64; 3]]) -> Result<bool, CalibrationError> {
        let fit = ellipsoid_fit(samples, self.max_condition_number)?;
        let cooked = cook_calibration_data(samples, fit.offset, fit.scaling);
        let stats = cooked.stats;
        let normalized = stats.norm_std_dev / stats.norm_average;
        if !(normalized <= MAX_NORMALIZED_STD_DEV) {
            return Err(CalibrationError::StdDevTooHigh(normalized));
        }

        // the zoned phase tracks drift, the ring buffer phase only takes improvements
        if self.phase == RtPhase::Bootstrap {
            if let Some(previous) = self.baseline {
                if fit.condition_number >= previous.condition_number
                    || stats.norm_std_dev >= previous.norm_std_dev
                {
                    debug!(
                        "Real-time mag fit not better than baseline (cond {:.1}, std {:.5})",
                        fit.condition_number, stats.norm_std_dev
                    );
                    return Ok(false);
                }
            }
        }

        self.offset = fit.offset.map(|v| v as f32);
        self.scaling = fit.scaling.map(|v| v as f32);
        self.baseline = Some(Baseline {
            condition_number: fit.condition_number,
            norm_std_dev: stats.norm_std_dev,
        });
        self.last_fit = Some((fit, cooked));
        Ok(true)
    }

    fn fit_samples(&mut self) -> RtUpdate {
        let samples: Vec<[f64; 3]> = self.samples.iter().map(|p| p.map(f64::from)).collect();
        if samples.is_empty() {
            return RtUpdate::Added;
        }
        let center = [0, 1, 2].map(|i| mean(&samples.iter().map(|p| p[i]).collect::<Vec<_>>()));
        let filtered = filter_cal_data(&samples, center);

        match self.evaluate(&filtered) {
            Ok(true) => {
                info!(
                    "Real-time mag calibration: offset {:?}, scaling {:?}",
                    self.offset, self.scaling
                );
                if self.strategy == RtMagStrategy::Iterative {
                    self.enter_zoned_phase();
                }
                RtUpdate::CalibrationSucceeded
            }
            Ok(false) => RtUpdate::CalibrationFailed,
            Err(e) => {
                debug!("Real-time mag calibration rejected: {}", e);
                RtUpdate::CalibrationFailed
            }
        }
    }

    fn enter_zoned_phase(&mut self) {
        let samples: Vec<[i16; 3]> = self.samples.drain(..).collect();
        self.phase = RtPhase::Zoned;
        for raw in samples {
            let cal = self.scale(raw);
            let norm2 = cal[0] * cal[0] + cal[1] * cal[1] + cal[2] * cal[2];
            if norm2 >= self.sanity_band.0 && norm2 <= self.sanity_band.1 {
                self.add_to_zone(raw, cal);
            }
        }
        debug!("Real-time mag calibration: {} zones filled", self.filled_zones);
    }

    fn fit_zones(&mut self) -> RtUpdate {
        if self.filled_zones < MIN_FILLED_ZONES {
            return RtUpdate::Added;
        }
        let averages: Vec<[f64; 3]> = self
            .zones
            .iter()
            .filter(|z| !z.points.is_empty())
            .map(|z| z.average)
            .collect();
        match self.evaluate(&averages) {
            Ok(true) => RtUpdate::CalibrationSucceeded,
            Ok(false) => RtUpdate::CalibrationFailed,
            Err(e) => {
                debug!("Real-time zone fit rejected: {}", e);
                RtUpdate::CalibrationFailed
            }
        }
    }

    pub fn summary(&self) -> CalibrationSummary {
        let mut summary = CalibrationSummary {
            number_of_samples: self.number_of_samples(),
            offset: self.offset,
            scaling: self.scaling,
            ..Default::default()
        };
        if let Some((fit, cooked)) = &self.last_fit {
            summary.condition_number = fit.condition_number;
            summary.norm_average = cooked.stats.norm_average;
            summary.norm_std_dev = cooked.stats.norm_std_dev;
            summary.max_norm_error = cooked.stats.max_norm_error;
            summary.calibrated_samples = cooked.calibrated.iter().map(|c| c.map(|v| v as f32)).collect();
            summary.norms = cooked.norms.iter().map(|n| *n as f32).collect();
        }
        summary
    }

    /// Writes the current corpus, one `x y z` line per raw sample.
    pub fn export_raw(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        match self.phase {
            RtPhase::Bootstrap => write_samples(path, self.samples.iter().map(|p| p.map(f64::from))),
            RtPhase::Zoned => write_samples(
                path,
                self.zones
                    .iter()
                    .flat_map(|z| z.points.iter())
                    .map(|p| p.map(f64::from)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::tests::{ellipsoid_points, OFFSET, RADII};

    const EPSILON: f64 = 1e-9;

    fn settings(strategy: RtMagStrategy) -> RtMagSettings {
        RtMagSettings {
            enabled: true,
            strategy,
            max_distance_error: 0.1,
            // 200 samples between fits, 1000 kept
            calibration_period: 0.2,
            max_memory_duration: 1.0,
            acquisition_rate_factor: 1,
        }
    }

    fn cycle() -> Vec<[i16; 3]> {
        ellipsoid_points(200, OFFSET, RADII)
            .into_iter()
            .map(|p| p.map(|v| v.round() as i16))
            .collect()
    }

    #[test]
    fn test_fibonacci_points_cover_the_sphere() {
        let points = fibonacci_points();
        assert_eq!(points.len(), NUMBER_OF_ZONES);
        for p in &points {
            let n = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            assert!((n - 1.0).abs() < EPSILON);
        }
        assert!(points.iter().any(|p| p[2] < -0.9));
        assert!(points.iter().any(|p| p[2] > 0.9));
    }

    #[test]
    fn test_zone_ring_buffer_average() {
        let mut zone = Zone::default();
        for _ in 0..POINTS_PER_ZONE {
            zone.push([10, 20, 30]);
        }
        zone.push([110, 20, 30]);
        assert_eq!(zone.points.len(), POINTS_PER_ZONE);
        assert!((zone.average[0] - 11.0).abs() < EPSILON);
    }

    #[test]
    fn test_direct_converges() {
        let mut rt = RtMagCalibration::new(&settings(RtMagStrategy::Direct), 1000, [0.0; 3], [1.0; 3], 1e5);
        let mut results = Vec::new();
        for p in cycle() {
            results.push(rt.update(p));
        }
        assert_eq!(results.last(), Some(&RtUpdate::CalibrationSucceeded));
        assert!(results[..199].iter().all(|r| *r == RtUpdate::Added));
        assert!(rt.is_calibrated());
        for i in 0..3 {
            assert!((rt.offset()[i] as f64 - OFFSET[i]).abs() < 1.0);
            assert!((rt.scaling()[i] as f64 - RADII[i]).abs() / RADII[i] < 0.01);
        }
        let summary = rt.summary();
        assert_eq!(summary.number_of_samples, 200);
        assert!(summary.max_norm_error < 0.02);
    }

    /// Same directions as `cycle`, radius modulated by `1 + amplitude * sin(1.7 i)`.
    fn shell(amplitude: f64) -> Vec<[i16; 3]> {
        ellipsoid_points(200, OFFSET, RADII)
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let f = 1.0 + amplitude * (1.7 * i as f64).sin();
                [0, 1, 2].map(|k| (OFFSET[k] + (p[k] - OFFSET[k]) * f).round() as i16)
            })
            .collect()
    }

    #[test]
    fn test_direct_keeps_baseline_on_worse_fit() {
        let mut rt = RtMagCalibration::new(&settings(RtMagStrategy::Direct), 1000, [0.0; 3], [1.0; 3], 1e5);
        for p in cycle() {
            rt.update(p);
        }
        assert!(rt.is_calibrated());
        let offset = rt.offset();
        let scaling = rt.scaling();

        let results: Vec<RtUpdate> = shell(0.03).into_iter().map(|p| rt.update(p)).collect();
        assert!(!results.contains(&RtUpdate::Rejected));
        assert_eq!(results.last(), Some(&RtUpdate::CalibrationFailed));
        assert_eq!(rt.number_of_samples(), 400);
        assert_eq!(rt.offset(), offset);
        assert_eq!(rt.scaling(), scaling);
    }

    #[test]
    fn test_scattered_cloud_is_rejected() {
        let mut rt = RtMagCalibration::new(&settings(RtMagStrategy::Direct), 1000, [0.0; 3], [1.0; 3], 1e5);
        let cloud = shell(0.4);

        let samples: Vec<[f64; 3]> = cloud.iter().map(|p| p.map(f64::from)).collect();
        match rt.evaluate(&samples) {
            Err(CalibrationError::StdDevTooHigh(v)) => assert!(v > MAX_NORMALIZED_STD_DEV),
            other => panic!("unexpected fit outcome: {:?}", other),
        }

        let mut last = RtUpdate::Added;
        for p in cloud {
            last = rt.update(p);
        }
        assert_eq!(last, RtUpdate::CalibrationFailed);
        assert!(!rt.is_calibrated());
        assert_eq!(rt.offset(), [0.0; 3]);
        assert_eq!(rt.scaling(), [1.0; 3]);
        assert!(rt.summary().norms.is_empty());
    }

    #[test]
    fn test_direct_rejects_far_points_then_resets() {
        let mut rt = RtMagCalibration::new(&settings(RtMagStrategy::Direct), 1000, [0.0; 3], [1.0; 3], 1e5);
        for p in cycle() {
            rt.update(p);
        }
        assert!(rt.is_calibrated());
        assert_eq!(rt.update([3000, 3000, 3000]), RtUpdate::Rejected);
        assert_eq!(rt.number_of_samples(), 200);

        let mut reset = false;
        for _ in 0..2000 {
            if rt.update([3000, 3000, 3000]) == RtUpdate::Reset {
                reset = true;
                break;
            }
        }
        assert!(reset);
        assert!(!rt.is_calibrated());
        assert_eq!(rt.offset(), [0.0; 3]);
        assert_eq!(rt.rejection_rate(), 0.0);
    }

    #[test]
    fn test_iterative_moves_to_zones() {
        let mut rt =
            RtMagCalibration::new(&settings(RtMagStrategy::Iterative), 1000, [0.0; 3], [1.0; 3], 1e5);
        for p in cycle() {
            rt.update(p);
        }
        assert_eq!(rt.phase(), RtPhase::Zoned);
        assert!(rt.filled_zones() >= MIN_FILLED_ZONES);

        let mut last = RtUpdate::Added;
        for p in cycle() {
            last = rt.update(p);
        }
        assert_eq!(last, RtUpdate::CalibrationSucceeded);
        for i in 0..3 {
            assert!((rt.offset()[i] as f64 - OFFSET[i]).abs() < 0.05 * RADII[i]);
        }
    }

    #[test]
    fn test_export_corpus() {
        let mut rt = RtMagCalibration::new(&settings(RtMagStrategy::Direct), 1000, [0.0; 3], [1.0; 3], 1e5);
        rt.update([1, 2, 3]);
        let path = std::env::temp_dir().join(format!("hedrot_rt_{}.txt", std::process::id()));
        rt.export_raw(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1 2 3\n");
        let _ = std::fs::remove_file(&path);
    }
}
