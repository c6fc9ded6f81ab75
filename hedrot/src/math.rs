//! Small numeric helpers shared by fusion and calibration.

use hedrot_traits::{EulerAngles, Quaternion};

/// Fast inverse square root, one Newton step.
///
/// Stays finite for `x == 0`, which the gradient normalization relies on.
pub fn inv_sqrt(x: f32) -> f32 {
    let half_x = 0.5 * x;
    let y = f32::from_bits(0x5f37_59df_u32.wrapping_sub(x.to_bits() >> 1));
    y * (1.5 - half_x * y * y)
}

/// Hamilton product `a ⊗ b`: `b` expressed in the frame of reference `a`.
pub fn compose(a: &Quaternion, b: &Quaternion) -> Quaternion {
    Quaternion::new(
        a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
        a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
        a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
        a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
    )
}

pub fn normalize(q: &Quaternion) -> Quaternion {
    let n = q.norm_squared().sqrt();
    if n == 0.0 {
        return Quaternion::IDENTITY;
    }
    Quaternion::new(q.w / n, q.x / n, q.y / n, q.z / n)
}

/// ZYX Tait-Bryan decomposition (yaw, then pitch, then roll).
pub fn yaw_pitch_roll(q: &Quaternion) -> EulerAngles {
    let (w, x, y, z) = (q.w, q.x, q.y, q.z);
    EulerAngles {
        yaw: (2.0 * (w * z + x * y))
            .atan2(1.0 - 2.0 * (y * y + z * z))
            .to_degrees(),
        pitch: (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin().to_degrees(),
        roll: (2.0 * (w * x + y * z))
            .atan2(1.0 - 2.0 * (x * x + y * y))
            .to_degrees(),
    }
}

/// XYZ Tait-Bryan decomposition (roll, then pitch, then yaw).
pub fn roll_pitch_yaw(q: &Quaternion) -> EulerAngles {
    let (w, x, y, z) = (q.w, q.x, q.y, q.z);
    EulerAngles {
        roll: (2.0 * (w * x - y * z))
            .atan2(1.0 - 2.0 * (x * x + y * y))
            .to_degrees(),
        pitch: (2.0 * (w * y + z * x)).clamp(-1.0, 1.0).asin().to_degrees(),
        yaw: (2.0 * (w * z - x * y))
            .atan2(1.0 - 2.0 * (y * y + z * z))
            .to_degrees(),
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation around a precomputed mean.
pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Floating point modulo in `[0, n)`.
pub fn modulo(a: f64, n: f64) -> f64 {
    a - n * (a / n).floor()
}
