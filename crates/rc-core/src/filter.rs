//! Per-axis calibration (bias + scale) followed by a rate-dependent
//! first-order IIR low-pass filter.

use nalgebra::{Matrix3, Vector3};
use std::f64::consts::PI;

/// Bias/scale/noise calibration for one sensor group (gyro, accel, or mag).
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub scale: Matrix3<f64>,
    pub bias: Vector3<f64>,
    pub stddev: Vector3<f64>,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            scale: Matrix3::identity(),
            bias: Vector3::zeros(),
            stddev: Vector3::repeat(1.0),
        }
    }
}

impl Calibration {
    /// Calibrates a raw sample: bias is added *before* scale, per the
    /// board's wire convention.
    pub fn apply(&self, raw: Vector3<f64>) -> Vector3<f64> {
        self.scale * (raw + self.bias)
    }

    /// Diagonal measurement covariance derived from calibration stddev;
    /// cross terms are zero.
    pub fn covariance_diag(&self) -> Vector3<f64> {
        self.stddev.component_mul(&self.stddev)
    }
}

/// All three calibrated sensor groups plus the temperature this calibration
/// was taken at.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuCalibration {
    pub gyro: Calibration,
    pub accel: Calibration,
    pub mag: Calibration,
    pub reference_temp: f64,
}

/// First-order IIR low-pass state for one sensor group.
#[derive(Debug, Clone, Copy)]
pub struct FilterState {
    alpha: f64,
    out: Option<Vector3<f64>>,
}

impl Default for FilterState {
    fn default() -> Self {
        FilterState { alpha: 1.0, out: None }
    }
}

impl FilterState {
    pub fn new(alpha: f64) -> Self {
        FilterState { alpha, out: None }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }

    /// Filters one already-calibrated sample.
    pub fn step(&mut self, calibrated: Vector3<f64>) -> Vector3<f64> {
        let out = match self.out {
            Some(prev) => prev + self.alpha * (calibrated - prev),
            None => calibrated,
        };
        self.out = Some(out);
        out
    }
}

/// Computes the IIR coefficient for a user-facing cutoff frequency `fc`
/// (Hz) at sample rate `r` (Hz). `fc <= 0.0` disables the filter (passthrough,
/// `alpha = 1`).
pub fn alpha_of(fc: f64, r: f64) -> f64 {
    if fc > 0.0 && r > 0.0 {
        let wc = 2.0 * PI / r;
        (wc * fc) / (wc * fc + 1.0)
    } else {
        1.0
    }
}

/// Inverse of [`alpha_of`]: recovers the cutoff frequency that produced
/// `alpha` at sample rate `r`.
pub fn fc_of(alpha: f64, r: f64) -> f64 {
    if alpha < 1.0 {
        (r / (2.0 * PI)) * (alpha / (1.0 - alpha))
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_alpha_is_one() {
        let calib = Calibration::default();
        let mut filt = FilterState::new(1.0);
        let raw = Vector3::new(1.0, -2.0, 3.5);
        let calibrated = calib.apply(raw);
        let out1 = filt.step(calibrated);
        assert_eq!(out1, calibrated);
        let raw2 = Vector3::new(10.0, 20.0, -5.0);
        let calibrated2 = calib.apply(raw2);
        let out2 = filt.step(calibrated2);
        assert_eq!(out2, calibrated2);
    }

    #[test]
    fn rate_to_alpha_round_trips() {
        for r in [50.0, 200.0, 1000.0] {
            for fc in [0.0, 1.0, 5.0, 42.0] {
                let a = alpha_of(fc, r);
                let back = fc_of(a, r);
                assert!((back - fc).abs() < 1e-6, "fc={fc} r={r} back={back}");
            }
        }
    }

    #[test]
    fn zero_cutoff_disables_filter() {
        assert_eq!(alpha_of(0.0, 1000.0), 1.0);
    }

    #[test]
    fn unit_alpha_has_zero_cutoff() {
        assert_eq!(fc_of(1.0, 1000.0), 0.0);
    }

    #[test]
    fn bias_is_added_before_scale() {
        let mut calib = Calibration::default();
        calib.scale = Matrix3::from_diagonal_element(2.0);
        calib.bias = Vector3::new(1.0, 1.0, 1.0);
        let raw = Vector3::new(0.0, 0.0, 0.0);
        // (raw + bias) * scale = (1,1,1) * 2 = (2,2,2), not raw*scale + bias
        assert_eq!(calib.apply(raw), Vector3::new(2.0, 2.0, 2.0));
    }
}
