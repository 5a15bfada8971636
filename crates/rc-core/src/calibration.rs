//! IMU static-pose calibration: an interface only. The solver that turns
//! held orientations into scale/bias/stddev is an external collaborator;
//! this module defines the contract the `calibrate_imu`, `calibrate_mag`,
//! and `set_zero*` activities drive it through.

use nalgebra::{Matrix3, Vector3};

use crate::types::{ImuSample, MagSample};

/// Outcome of feeding one sample into an in-progress calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollectOutcome {
    /// Sample accepted, pose complete, move to `still_count` poses collected.
    Ok,
    /// Motion detected or pose not yet held long enough; `still_count` poses
    /// are confirmed so far.
    Again { still_count: u32 },
    /// Acquisition cannot continue (e.g. motion exceeded tolerance on a
    /// pose that had already started).
    Error,
}

/// Final result of a gyro/accel/mag solve: scale, bias, and per-axis
/// stddev, plus ancillary stats surfaced to the caller for logging.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationResult {
    pub scale: Matrix3<f64>,
    pub bias: Vector3<f64>,
    pub stddev: Vector3<f64>,
}

/// Stats reported once at `fini`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationStats {
    pub max_accel: f64,
    pub max_gyro: f64,
    pub temp: f64,
    pub avg_accel: Vector3<f64>,
    pub avg_gyro: Vector3<f64>,
}

/// The contract an IMU calibration solver must satisfy. A concrete
/// implementation (the 6-pose static solver) lives outside the core and is
/// injected by the supervisor.
pub trait ImuCalibrator {
    /// Begins a session: `samples_per_pose` readings held per orientation,
    /// `n_poses` orientations required, `sps` the sample rate the solver
    /// should expect, and `motion_tolerance` the per-axis gyro threshold
    /// (rad/s) below which a pose counts as "still".
    fn init(&mut self, samples_per_pose: u32, n_poses: u32, sps: f64, motion_tolerance: f64);

    /// Feeds one synchronized (temperature, IMU, magnetometer) reading.
    fn collect(&mut self, temp: f64, imu: &ImuSample, mag: &MagSample) -> CollectOutcome;

    /// Solves for the gyroscope calibration collected so far.
    fn gyro(&self) -> CalibrationResult;

    /// Solves for the accelerometer calibration collected so far.
    fn accel(&self) -> CalibrationResult;

    /// Solves for the magnetometer calibration collected so far.
    fn mag(&self) -> CalibrationResult;

    /// Finalizes the session, releasing any solver-internal state and
    /// reporting summary statistics across all poses collected.
    fn fini(&mut self) -> CalibrationStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stub solver used to exercise the activity state machines without a
    /// real 6-pose solve; always reports the identity calibration.
    struct NullCalibrator {
        poses_seen: u32,
        target_poses: u32,
    }

    impl ImuCalibrator for NullCalibrator {
        fn init(&mut self, _samples_per_pose: u32, n_poses: u32, _sps: f64, _motion_tolerance: f64) {
            self.target_poses = n_poses;
            self.poses_seen = 0;
        }

        fn collect(&mut self, _temp: f64, _imu: &ImuSample, _mag: &MagSample) -> CollectOutcome {
            if self.poses_seen >= self.target_poses {
                CollectOutcome::Error
            } else {
                self.poses_seen += 1;
                if self.poses_seen == self.target_poses {
                    CollectOutcome::Ok
                } else {
                    CollectOutcome::Again { still_count: self.poses_seen }
                }
            }
        }

        fn gyro(&self) -> CalibrationResult {
            CalibrationResult { scale: Matrix3::identity(), bias: Vector3::zeros(), stddev: Vector3::repeat(1.0) }
        }
        fn accel(&self) -> CalibrationResult {
            self.gyro()
        }
        fn mag(&self) -> CalibrationResult {
            self.gyro()
        }

        fn fini(&mut self) -> CalibrationStats {
            CalibrationStats::default()
        }
    }

    #[test]
    fn null_calibrator_completes_after_n_poses() {
        let mut cal = NullCalibrator { poses_seen: 0, target_poses: 3 };
        cal.init(50, 3, 200.0, 0.01);
        let imu = ImuSample::default();
        let mag = MagSample::default();
        assert_eq!(cal.collect(25.0, &imu, &mag), CollectOutcome::Again { still_count: 1 });
        assert_eq!(cal.collect(25.0, &imu, &mag), CollectOutcome::Again { still_count: 2 });
        assert_eq!(cal.collect(25.0, &imu, &mag), CollectOutcome::Ok);
    }
}
