//! Offline accelerometer and magnetometer calibration.
//!
//! Raw samples of a sensor that is turned in every direction lie on an axis
//! aligned ellipsoid. The fit recovers its center (offset) and radii
//! (scaling) from the linearized problem
//!
//! ```text
//! a x² + b y² + c z² + 2d x + 2e y + 2f z = 1
//! offset  = (-d/a, -e/b, -f/c)
//! scaling = (sqrt(g/a), sqrt(g/b), sqrt(g/c)),  g = 1 + d²/a + e²/b + f²/c
//! ```

pub mod realtime;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::math::{mean, std_dev};

pub const MAX_CONDITION_NUMBER: f64 = 100_000.0;
pub const MAX_CALIBRATION_SAMPLES: usize = 100_000;

/// Allowed relative mismatch between the rotated and axis aligned fits.
const ROTATION_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("Not enough samples: need {needed}, got {got}")]
    TooFewSamples { needed: usize, got: usize },

    #[error("Design matrix is rank deficient ({rank} < {expected})")]
    RankDeficient { rank: usize, expected: usize },

    #[error("Condition number {value} exceeds the allowed maximum {max}")]
    ConditionNumber { value: f64, max: f64 },

    #[error("Fitted quadric is not an ellipsoid")]
    NotEllipsoid,

    #[error("Calibrated norm spread too high ({0})")]
    StdDevTooHigh(f64),

    #[error("Cross products are not negligible, sensor axes look rotated")]
    RotatedEllipsoid,

    #[error("No calibration data")]
    NoData,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum OfflineCalibrationMethod {
    /// Ellipsoid fit, 3σ filter around the fitted center, second fit.
    #[default]
    TwoPassEllipsoid,
    /// 3σ filter around the mean, then a rotated quadric fit is used to
    /// check that the axis aligned fit is trustworthy.
    AlignedQuadric,
}

/// Result of the 6-coefficient fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipsoidFit {
    pub offset: [f64; 3],
    pub scaling: [f64; 3],
    pub condition_number: f64,
    pub coefficients: [f64; 6],
}

/// Statistics of the calibrated norm over a sample set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormStats {
    pub max_norm_error: f64,
    pub norm_average: f64,
    pub norm_std_dev: f64,
}

/// Calibrated samples and their norms for a given offset/scaling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookedSamples {
    pub calibrated: Vec<[f64; 3]>,
    pub norms: Vec<f64>,
    pub stats: NormStats,
}

/// Solves `A x = 1` in the least squares sense, one row of `A` per sample.
///
/// Returns the coefficients and the condition number of `A`.
fn least_squares<const N: usize>(
    samples: &[[f64; 3]],
    max_condition_number: f64,
    row: impl Fn(&[f64; 3]) -> [f64; N],
) -> Result<([f64; N], f64), CalibrationError> {
    if samples.len() < N {
        return Err(CalibrationError::TooFewSamples {
            needed: N,
            got: samples.len(),
        });
    }

    let rows: Vec<[f64; N]> = samples.iter().map(row).collect();
    let design = DMatrix::from_fn(samples.len(), N, |i, j| rows[i][j]);
    let ones = DVector::from_element(samples.len(), 1.0);

    let svd = design.svd(true, true);
    let s_max = svd.singular_values.iter().cloned().fold(0.0, f64::max);
    let s_min = svd
        .singular_values
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);

    let tolerance = s_max * f64::EPSILON * samples.len() as f64;
    let rank = svd.rank(tolerance);
    if rank < N || s_min <= 0.0 {
        return Err(CalibrationError::RankDeficient { rank, expected: N });
    }

    let condition_number = s_max / s_min;
    if condition_number >= max_condition_number {
        return Err(CalibrationError::ConditionNumber {
            value: condition_number,
            max: max_condition_number,
        });
    }

    let solution = svd
        .solve(&ones, tolerance)
        .map_err(|_| CalibrationError::RankDeficient { rank, expected: N })?;

    let mut coefficients = [0.0; N];
    for (c, v) in coefficients.iter_mut().zip(solution.iter()) {
        *c = *v;
    }
    Ok((coefficients, condition_number))
}

fn sign(v: f64) -> i32 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// The three quadratic coefficients must share a sign.
fn check_quadratic_signs(c: &[f64]) -> Result<(), CalibrationError> {
    if (sign(c[0]) + sign(c[1]) + sign(c[2])).abs() != 3 {
        debug!("Quadric coefficients {:?} do not describe an ellipsoid", c);
        return Err(CalibrationError::NotEllipsoid);
    }
    Ok(())
}

pub fn ellipsoid_fit(
    samples: &[[f64; 3]],
    max_condition_number: f64,
) -> Result<EllipsoidFit, CalibrationError> {
    let (c, condition_number) = least_squares(samples, max_condition_number, |p| {
        [p[0] * p[0], p[1] * p[1], p[2] * p[2], 2.0 * p[0], 2.0 * p[1], 2.0 * p[2]]
    })?;
    check_quadratic_signs(&c)?;

    let offset = [-c[3] / c[0], -c[4] / c[1], -c[5] / c[2]];
    let gamma = 1.0 + c[3] * c[3] / c[0] + c[4] * c[4] / c[1] + c[5] * c[5] / c[2];
    let scaling = [
        (gamma / c[0]).sqrt(),
        (gamma / c[1]).sqrt(),
        (gamma / c[2]).sqrt(),
    ];
    if scaling.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(CalibrationError::NotEllipsoid);
    }

    Ok(EllipsoidFit {
        offset,
        scaling,
        condition_number,
        coefficients: c,
    })
}

/// 9-coefficient fit of a general (rotated) quadric:
/// `a x² + b y² + c z² + d xy + e xz + f yz + 2g x + 2h y + 2i z = 1`.
pub fn quadric_fit(
    samples: &[[f64; 3]],
    max_condition_number: f64,
) -> Result<[f64; 9], CalibrationError> {
    let (c, _) = least_squares(samples, max_condition_number, |p| {
        [
            p[0] * p[0],
            p[1] * p[1],
            p[2] * p[2],
            p[0] * p[1],
            p[0] * p[2],
            p[1] * p[2],
            2.0 * p[0],
            2.0 * p[1],
            2.0 * p[2],
        ]
    })?;
    check_quadratic_signs(&c)?;
    Ok(c)
}

fn distance(p: &[f64; 3], center: &[f64; 3]) -> f64 {
    ((p[0] - center[0]).powi(2) + (p[1] - center[1]).powi(2) + (p[2] - center[2]).powi(2)).sqrt()
}

/// Keeps the samples whose distance to `center` is within 3σ of the mean
/// distance.
pub fn filter_cal_data(samples: &[[f64; 3]], center: [f64; 3]) -> Vec<[f64; 3]> {
    let distances: Vec<f64> = samples.iter().map(|p| distance(p, &center)).collect();
    let m = mean(&distances);
    let sd = std_dev(&distances, m);
    if sd == 0.0 {
        return samples.to_vec();
    }
    samples
        .iter()
        .zip(distances.iter())
        .filter(|(_, d)| (*d - m).abs() < 3.0 * sd)
        .map(|(p, _)| *p)
        .collect()
}

pub fn cook_calibration_data(
    samples: &[[f64; 3]],
    offset: [f64; 3],
    scaling: [f64; 3],
) -> CookedSamples {
    let inv = scaling.map(|s| 1.0 / s);
    let calibrated: Vec<[f64; 3]> = samples
        .iter()
        .map(|p| {
            [
                (p[0] - offset[0]) * inv[0],
                (p[1] - offset[1]) * inv[1],
                (p[2] - offset[2]) * inv[2],
            ]
        })
        .collect();
    let norms: Vec<f64> = calibrated
        .iter()
        .map(|c| (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt())
        .collect();
    let max_norm_error = norms.iter().map(|n| (n - 1.0).abs()).fold(0.0, f64::max);
    let norm_average = mean(&norms);
    let norm_std_dev = std_dev(&norms, norm_average);
    CookedSamples {
        calibrated,
        norms,
        stats: NormStats {
            max_norm_error,
            norm_average,
            norm_std_dev,
        },
    }
}

/// Outcome of an offline calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub offset: [f32; 3],
    pub scaling: [f32; 3],
    pub condition_number: f64,
    /// Stats over the samples kept by the outlier filter.
    pub stats: NormStats,
    /// Per-sample diagnostics over the whole, unfiltered corpus.
    pub cooked: CookedSamples,
}

fn two_pass_ellipsoid(
    samples: &[[f64; 3]],
    max_condition_number: f64,
) -> Result<CalibrationResult, CalibrationError> {
    let first = ellipsoid_fit(samples, max_condition_number)?;
    debug!(
        "First pass: offset {:?}, radii {:?}, condition number {}",
        first.offset, first.scaling, first.condition_number
    );

    let filtered = filter_cal_data(samples, first.offset);
    debug!("Outlier filter kept {}/{} samples", filtered.len(), samples.len());

    let second = ellipsoid_fit(&filtered, max_condition_number)?;
    let stats = cook_calibration_data(&filtered, second.offset, second.scaling).stats;
    Ok(CalibrationResult {
        offset: second.offset.map(|v| v as f32),
        scaling: second.scaling.map(|v| v as f32),
        condition_number: second.condition_number,
        stats,
        cooked: cook_calibration_data(samples, second.offset, second.scaling),
    })
}

fn aligned_quadric(
    samples: &[[f64; 3]],
    max_condition_number: f64,
) -> Result<CalibrationResult, CalibrationError> {
    let x0 = [0, 1, 2].map(|i| mean(&samples.iter().map(|p| p[i]).collect::<Vec<_>>()));
    let filtered = filter_cal_data(samples, x0);

    let q9 = quadric_fit(&filtered, max_condition_number)?;
    let fit = ellipsoid_fit(&filtered, max_condition_number)?;
    let q6 = fit.coefficients;

    // coefficients are brought to comparable magnitudes: quadratic terms
    // times nf², linear terms times nf
    let nf = x0.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let nf2 = nf * nf;

    let cross = q9[3..6].iter().fold(0.0f64, |m, c| m.max((c * nf2).abs()));
    let all = q9[..6]
        .iter()
        .map(|c| (c * nf2).abs())
        .chain(q9[6..].iter().map(|c| (c * nf).abs()))
        .fold(0.0f64, f64::max);
    if cross >= ROTATION_TOLERANCE * all {
        debug!("Cross product check failed: {} >= 0.1 * {}", cross, all);
        return Err(CalibrationError::RotatedEllipsoid);
    }

    let mut diff = 0.0f64;
    let mut reference = 0.0f64;
    for i in 0..3 {
        diff = diff.max((q6[i] - q9[i]).abs() * nf2);
        reference = reference.max(q6[i].abs() * nf2);
        diff = diff.max((q6[i + 3] - q9[i + 6]).abs() * nf);
        reference = reference.max(q6[i + 3].abs() * nf);
    }
    if diff >= ROTATION_TOLERANCE * reference {
        debug!("Aligned fit check failed: {} >= 0.1 * {}", diff, reference);
        return Err(CalibrationError::RotatedEllipsoid);
    }

    let stats = cook_calibration_data(&filtered, fit.offset, fit.scaling).stats;
    Ok(CalibrationResult {
        offset: fit.offset.map(|v| v as f32),
        scaling: fit.scaling.map(|v| v as f32),
        condition_number: fit.condition_number,
        stats,
        cooked: cook_calibration_data(samples, fit.offset, fit.scaling),
    })
}

pub fn calibrate_samples(
    samples: &[[f64; 3]],
    method: OfflineCalibrationMethod,
    max_condition_number: f64,
) -> Result<CalibrationResult, CalibrationError> {
    if samples.is_empty() {
        return Err(CalibrationError::NoData);
    }
    match method {
        OfflineCalibrationMethod::TwoPassEllipsoid => {
            two_pass_ellipsoid(samples, max_condition_number)
        }
        OfflineCalibrationMethod::AlignedQuadric => aligned_quadric(samples, max_condition_number),
    }
}

/// Snapshot of a calibration corpus and its last fit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSummary {
    pub number_of_samples: usize,
    pub offset: [f32; 3],
    pub scaling: [f32; 3],
    pub condition_number: f64,
    pub norm_average: f64,
    pub norm_std_dev: f64,
    pub max_norm_error: f64,
    pub calibrated_samples: Vec<[f32; 3]>,
    pub norms: Vec<f32>,
}

/// Raw samples collected during a calibration session, plus the last fit.
#[derive(Debug, Clone)]
pub struct CalibrationData {
    raw: Vec<[i16; 3]>,
    capacity: usize,
    result: Option<CalibrationResult>,
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationData {
    pub fn new() -> Self {
        Self::with_capacity(MAX_CALIBRATION_SAMPLES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::new(),
            capacity,
            result: None,
        }
    }

    /// Appends a sample; returns `false` once the corpus is full.
    pub fn push(&mut self, sample: [i16; 3]) -> bool {
        if self.raw.len() >= self.capacity {
            return false;
        }
        self.raw.push(sample);
        true
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.result = None;
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn raw_samples(&self) -> &[[i16; 3]] {
        &self.raw
    }

    pub fn result(&self) -> Option<&CalibrationResult> {
        self.result.as_ref()
    }

    pub fn calibrate(
        &mut self,
        method: OfflineCalibrationMethod,
        max_condition_number: f64,
    ) -> Result<&CalibrationResult, CalibrationError> {
        let samples: Vec<[f64; 3]> = self.raw.iter().map(|p| p.map(f64::from)).collect();
        match calibrate_samples(&samples, method, max_condition_number) {
            Ok(result) => {
                info!(
                    "{} calibration succeeded: offset {:?}, scaling {:?}, condition number {:.1}, max norm error {:.4}",
                    method, result.offset, result.scaling, result.condition_number, result.stats.max_norm_error
                );
                Ok(self.result.insert(result))
            }
            Err(e) => {
                warn!("{} calibration failed on {} samples: {}", method, samples.len(), e);
                self.result = None;
                Err(e)
            }
        }
    }

    pub fn summary(&self) -> CalibrationSummary {
        let mut summary = CalibrationSummary {
            number_of_samples: self.raw.len(),
            ..Default::default()
        };
        if let Some(result) = &self.result {
            summary.offset = result.offset;
            summary.scaling = result.scaling;
            summary.condition_number = result.condition_number;
            summary.norm_average = result.stats.norm_average;
            summary.norm_std_dev = result.stats.norm_std_dev;
            summary.max_norm_error = result.stats.max_norm_error;
            summary.calibrated_samples = result
                .cooked
                .calibrated
                .iter()
                .map(|c| c.map(|v| v as f32))
                .collect();
            summary.norms = result.cooked.norms.iter().map(|n| *n as f32).collect();
        }
        summary
    }

    /// Writes one `x y z` line per raw sample.
    pub fn export_raw(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        write_samples(path, self.raw.iter().map(|p| p.map(f64::from)))
    }
}

pub(crate) fn write_samples(
    path: impl AsRef<Path>,
    samples: impl Iterator<Item = [f64; 3]>,
) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for p in samples {
        writeln!(out, "{} {} {}", p[0], p[1], p[2])?;
    }
    out.flush()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const EPSILON: f64 = 1e-6;

    pub(crate) const OFFSET: [f64; 3] = [100.0, -50.0, 30.0];
    pub(crate) const RADII: [f64; 3] = [300.0, 250.0, 200.0];

    /// Points on the axis aligned ellipsoid, spread with a golden angle spiral.
    pub(crate) fn ellipsoid_points(n: usize, offset: [f64; 3], radii: [f64; 3]) -> Vec<[f64; 3]> {
        (0..n)
            .map(|i| {
                let z = 1.0 - (2.0 * i as f64 + 1.0) / n as f64;
                let r = (1.0 - z * z).sqrt();
                let theta = std::f64::consts::PI * (3.0 - 5f64.sqrt()) * i as f64;
                [
                    offset[0] + radii[0] * r * theta.cos(),
                    offset[1] + radii[1] * r * theta.sin(),
                    offset[2] + radii[2] * z,
                ]
            })
            .collect()
    }

    fn assert_close(a: [f32; 3], b: [f64; 3], tol: f64) {
        for i in 0..3 {
            assert!(
                (a[i] as f64 - b[i]).abs() <= tol * b[i].abs().max(1.0),
                "{:?} vs {:?}",
                a,
                b
            );
        }
    }

    #[test]
    fn test_ellipsoid_fit_exact() {
        let points = ellipsoid_points(200, OFFSET, RADII);
        let fit = ellipsoid_fit(&points, MAX_CONDITION_NUMBER).unwrap();
        for i in 0..3 {
            assert!((fit.offset[i] - OFFSET[i]).abs() < 1e-6);
            assert!((fit.scaling[i] - RADII[i]).abs() < 1e-6);
        }
        assert!(fit.condition_number > 1.0);
        let cooked = cook_calibration_data(&points, fit.offset, fit.scaling);
        assert!(cooked.stats.max_norm_error < EPSILON);
        assert!((cooked.stats.norm_average - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_too_few_samples() {
        let points = ellipsoid_points(5, OFFSET, RADII);
        assert_eq!(
            ellipsoid_fit(&points, MAX_CONDITION_NUMBER),
            Err(CalibrationError::TooFewSamples { needed: 6, got: 5 })
        );
    }

    #[test]
    fn test_coplanar_samples_are_rejected() {
        let points: Vec<[f64; 3]> = (0..50)
            .map(|i| {
                let a = i as f64 * 0.3;
                [100.0 * a.cos(), 100.0 * a.sin(), 0.0]
            })
            .collect();
        assert!(matches!(
            ellipsoid_fit(&points, MAX_CONDITION_NUMBER),
            Err(CalibrationError::RankDeficient { .. }) | Err(CalibrationError::ConditionNumber { .. })
        ));
    }

    #[test]
    fn test_condition_number_limit() {
        let points = ellipsoid_points(100, OFFSET, RADII);
        assert!(matches!(
            ellipsoid_fit(&points, 1.0),
            Err(CalibrationError::ConditionNumber { .. })
        ));
    }

    #[test]
    fn test_hyperboloid_is_not_an_ellipsoid() {
        // x² + y² - z² = 1 scaled
        let points: Vec<[f64; 3]> = (0..200)
            .map(|i| {
                let t = i as f64 * 0.37;
                let h = (i % 20) as f64 / 10.0 - 1.0;
                let r = (1.0 + h * h).sqrt();
                [10.0 * r * t.cos(), 10.0 * r * t.sin(), 10.0 * h]
            })
            .collect();
        assert_eq!(
            ellipsoid_fit(&points, MAX_CONDITION_NUMBER),
            Err(CalibrationError::NotEllipsoid)
        );
    }

    #[test]
    fn test_filter_drops_far_points() {
        let mut points = ellipsoid_points(500, [0.0; 3], [100.0; 3]);
        points.push([1000.0, 0.0, 0.0]);
        let filtered = filter_cal_data(&points, [0.0; 3]);
        assert_eq!(filtered.len(), 500);
    }

    #[test]
    fn test_two_pass_rejects_outliers() {
        let mut points = ellipsoid_points(500, OFFSET, RADII);
        let clean = ellipsoid_fit(&points, MAX_CONDITION_NUMBER).unwrap();
        for (i, dir) in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0], [-0.6, 0.8, 0.0], [0.0, -0.6, 0.8]]
            .iter()
            .enumerate()
        {
            let k = 2.0 + 0.1 * i as f64;
            points.push([
                OFFSET[0] + k * RADII[0] * dir[0],
                OFFSET[1] + k * RADII[1] * dir[1],
                OFFSET[2] + k * RADII[2] * dir[2],
            ]);
        }
        let result = calibrate_samples(
            &points,
            OfflineCalibrationMethod::TwoPassEllipsoid,
            MAX_CONDITION_NUMBER,
        )
        .unwrap();
        assert_close(result.offset, clean.offset, 0.01);
        assert_close(result.scaling, clean.scaling, 0.01);
        assert!(result.stats.max_norm_error < 1e-3);
        assert_eq!(result.cooked.norms.len(), 505);
    }

    #[test]
    fn test_aligned_quadric_accepts_aligned_ellipsoid() {
        let offset = [10.0, -5.0, 3.0];
        let radii = [30.0, 25.0, 20.0];
        let points = ellipsoid_points(400, offset, radii);
        let result = calibrate_samples(
            &points,
            OfflineCalibrationMethod::AlignedQuadric,
            MAX_CONDITION_NUMBER,
        )
        .unwrap();
        assert_close(result.offset, offset, 1e-4);
        assert_close(result.scaling, radii, 1e-4);
    }

    #[test]
    fn test_aligned_quadric_rejects_rotated_ellipsoid() {
        // rotate the ellipsoid by 45° around z
        let (s, c) = std::f64::consts::FRAC_PI_4.sin_cos();
        let points: Vec<[f64; 3]> = ellipsoid_points(400, [0.0; 3], [400.0, 100.0, 200.0])
            .into_iter()
            .map(|p| {
                [
                    500.0 + c * p[0] - s * p[1],
                    200.0 + s * p[0] + c * p[1],
                    -100.0 + p[2],
                ]
            })
            .collect();
        let result = calibrate_samples(
            &points,
            OfflineCalibrationMethod::AlignedQuadric,
            MAX_CONDITION_NUMBER,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_corpus_is_capped() {
        let mut data = CalibrationData::with_capacity(3);
        assert!(data.push([1, 2, 3]));
        assert!(data.push([1, 2, 3]));
        assert!(data.push([1, 2, 3]));
        assert!(!data.push([1, 2, 3]));
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_calibrate_empty_corpus() {
        let mut data = CalibrationData::new();
        assert_eq!(
            data.calibrate(OfflineCalibrationMethod::TwoPassEllipsoid, MAX_CONDITION_NUMBER)
                .unwrap_err(),
            CalibrationError::NoData
        );
        assert_eq!(data.summary().number_of_samples, 0);
    }

    #[test]
    fn test_corpus_calibration_summary() {
        let mut data = CalibrationData::new();
        for p in ellipsoid_points(300, OFFSET, RADII) {
            data.push(p.map(|v| v.round() as i16));
        }
        let result = data
            .calibrate(OfflineCalibrationMethod::TwoPassEllipsoid, MAX_CONDITION_NUMBER)
            .unwrap();
        assert_close(result.offset, OFFSET, 0.01);
        let summary = data.summary();
        assert_eq!(summary.number_of_samples, 300);
        assert_eq!(summary.norms.len(), 300);
        assert!(summary.max_norm_error < 0.02);
    }

    #[test]
    fn test_export_raw_samples() {
        let mut data = CalibrationData::new();
        data.push([1, -2, 3]);
        data.push([4, 5, -6]);
        let path = std::env::temp_dir().join(format!("hedrot_raw_{}.txt", std::process::id()));
        data.export_raw(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "1 -2 3\n4 5 -6\n");
        let _ = std::fs::remove_file(&path);
    }
}
