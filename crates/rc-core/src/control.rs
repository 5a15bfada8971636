//! Rotor lifecycle (enable/disable, start, set-velocity, set-throttle,
//! set-pid) and emergency detection.

use rc_link::{Connection, DeviceKind};
use rc_proto::Outbound;

use crate::error::Error;
use crate::pipeline::SensorPipeline;
use crate::types::SensorRates;

/// Stateless namespace for the control operations; all state lives in
/// [`Connection`] and [`SensorPipeline`], passed explicitly.
pub struct ControlPlane;

fn period_us(rate_hz: f64) -> u32 {
    if rate_hz > 0.0 {
        (1.0e6 / rate_hz).round() as u32
    } else {
        0
    }
}

/// Converts an angular rate (rad/s, or the board's native rpm-equivalent)
/// into the signed 16-bit half-period the wire format expects.
fn velocity_to_half_period(omega: f64) -> i16 {
    const STALL_THRESHOLD: f64 = 1.0e6 / 65535.0;
    if omega.abs() < STALL_THRESHOLD {
        32767.0_f64.copysign(omega) as i16
    } else {
        (1.0e6 / 2.0 / omega) as i16
    }
}

fn throttle_to_i16(percent: f64) -> i16 {
    if percent.is_nan() {
        0
    } else {
        (percent.clamp(-100.0, 100.0) * 1023.0 / 100.0) as i16
    }
}

impl ControlPlane {
    /// Validates and applies new per-channel sensor rates, resending the
    /// rate configuration to every link carrying that capability.
    pub fn set_sensor_rate(
        conn: &mut Connection,
        pipeline: &mut SensorPipeline,
        rates: SensorRates,
    ) -> Result<(), Error> {
        for r in [rates.imu, rates.mag, rates.motor, rates.battery] {
            if !(0.0..=2000.0).contains(&r) {
                return Err(Error::Range(format!("sensor rate {r} Hz out of [0, 2000]")));
            }
        }

        conn.broadcast(&Outbound::BatteryPeriodUs(period_us(rates.battery)));
        conn.send_where(&Outbound::MotorPeriodUs(period_us(rates.motor)), |l| l.motor);
        conn.send_where(&Outbound::ImuPeriodUs(period_us(rates.imu)), |l| l.imu);
        conn.send_where(&Outbound::MagPeriodUs(period_us(rates.mag)), |l| l.mag);

        pipeline.on_rate_changed(rates);
        Ok(())
    }

    pub fn set_battery_limits(pipeline: &mut SensorPipeline, min: f64, max: f64) -> Result<(), Error> {
        if min < 0.0 || min >= max - 0.01 {
            return Err(Error::Range(format!("battery limits min={min} max={max}")));
        }
        pipeline.battery.min = min;
        pipeline.battery.max = max;
        Ok(())
    }

    pub fn disable_motor(conn: &mut Connection, pipeline: &mut SensorPipeline, id: u8) -> Result<(), Error> {
        if !(1..=rc_proto::MAX_ROTORS as u8).contains(&id) {
            return Err(Error::Range(format!("motor id {id} out of [1, {}]", rc_proto::MAX_ROTORS)));
        }
        let rotor = &mut pipeline.motors[(id - 1) as usize];
        rotor.disabled = true;
        rotor.emerg = false;
        rotor.spinning = false;
        rotor.starting = false;
        rotor.velocity = f64::NAN;
        rotor.throttle = f64::NAN;
        rotor.consumption = f64::NAN;
        conn.send_where(&Outbound::EmergencyStopOne(id), |l| {
            l.motor_range.is_some_and(|(min, max)| id >= min && id <= max)
        });
        Ok(())
    }

    pub fn enable_motor(conn: &mut Connection, pipeline: &mut SensorPipeline, id: u8) -> Result<(), Error> {
        if !(1..=rc_proto::MAX_ROTORS as u8).contains(&id) {
            return Err(Error::Range(format!("motor id {id} out of [1, {}]", rc_proto::MAX_ROTORS)));
        }
        let any_spinning = pipeline.motors.iter().any(|r| r.spinning);
        let rotor = &mut pipeline.motors[(id - 1) as usize];
        rotor.disabled = false;
        rotor.emerg = false;
        rotor.spinning = false;
        rotor.starting = false;
        if any_spinning {
            conn.send_where(&Outbound::StartMotor(id), |l| {
                l.motor_range.is_some_and(|(min, max)| id >= min && id <= max)
            });
        }
        Ok(())
    }

    pub fn set_pid(
        conn: &mut Connection,
        motor: u8,
        kp: f64,
        ki: f64,
        kd: f64,
        f: f64,
    ) -> Result<(), Error> {
        let supported = conn.links().iter().any(|l| {
            l.motor_range.is_some_and(|(min, max)| motor >= min && motor <= max)
                && l.device.is_some_and(|(kind, _)| kind == DeviceKind::Teensy)
        });
        if !supported {
            return Err(Error::BadDevice(format!(
                "motor {motor} is not on a link that supports set_pid (teensy only)"
            )));
        }
        let scale = |g: f64| (g * 10_000.0).round().clamp(0.0, u16::MAX as f64) as u16;
        conn.send_where(
            &Outbound::SetPid { motor, kp: scale(kp), ki: scale(ki), kd: scale(kd), f: scale(f) },
            |l| l.motor_range.is_some_and(|(min, max)| motor >= min && motor <= max),
        );
        Ok(())
    }

    /// Converts a desired-velocity command list (trailing `NaN`s trimmed)
    /// into per-link velocity frames and dispatches them.
    pub fn set_velocity(
        conn: &mut Connection,
        pipeline: &SensorPipeline,
        desired: &[f64],
    ) -> Result<(), Error> {
        if pipeline.motors.iter().any(|r| !r.disabled && r.emerg) {
            return Err(Error::RotorFailure(
                pipeline
                    .motors
                    .iter()
                    .position(|r| !r.disabled && r.emerg)
                    .map(|i| i as u8 + 1)
                    .unwrap_or(0),
            ));
        }

        let mut trimmed = desired;
        while trimmed.last().is_some_and(|v| v.is_nan()) {
            trimmed = &trimmed[..trimmed.len() - 1];
        }

        let commands: Vec<i16> = (0..rc_proto::MAX_ROTORS)
            .map(|i| {
                if pipeline.motors[i].disabled {
                    velocity_to_half_period(0.0)
                } else {
                    trimmed.get(i).copied().map(velocity_to_half_period).unwrap_or(0)
                }
            })
            .collect();

        dispatch_per_link(conn, &commands, |slice| Outbound::Velocity(slice.to_vec()));
        Ok(())
    }

    pub fn set_throttle(conn: &mut Connection, pipeline: &SensorPipeline, desired: &[f64]) -> Result<(), Error> {
        let commands: Vec<i16> = (0..rc_proto::MAX_ROTORS)
            .map(|i| {
                if pipeline.motors[i].disabled {
                    0
                } else {
                    desired.get(i).copied().map(throttle_to_i16).unwrap_or(0)
                }
            })
            .collect();
        dispatch_per_link(conn, &commands, |slice| Outbound::Throttle(slice.to_vec()));
        Ok(())
    }

    /// Broadcasts an emergency stop and reports whether any non-disabled
    /// rotor is still spinning (caller should keep calling `stop` until this
    /// returns `false`, honoring a 500ms watchdog of its own).
    pub fn stop(conn: &mut Connection, pipeline: &SensorPipeline) -> bool {
        conn.broadcast(&Outbound::EmergencyStopAll);
        pipeline.motors.iter().any(|r| !r.disabled && r.spinning)
    }
}

/// Slices `commands` (one entry per global rotor id `1..=MAX_ROTORS`) into
/// each link's assigned `[minid-1, maxid-1]` window and sends it.
fn dispatch_per_link(conn: &mut Connection, commands: &[i16], make: impl Fn(&[i16]) -> Outbound) {
    for link in conn.links_mut() {
        let Some((minid, maxid)) = link.motor_range else { continue };
        let lo = (minid - 1) as usize;
        let hi = (maxid as usize).min(commands.len());
        if lo >= hi {
            continue;
        }
        let _ = link.send(&make(&commands[lo..hi]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_encoding_matches_known_points() {
        assert_eq!(velocity_to_half_period(100.0), 5000);
        assert_eq!(velocity_to_half_period(0.001), 32767);
        assert_eq!(velocity_to_half_period(-0.001), -32767);
    }

    #[test]
    fn velocity_encoding_zero_is_stall_sentinel_not_zero() {
        // omega = 0 must emit the stall half-period, matching the board's
        // "stopped" signal -- a wire value of 0 would instead read as a
        // division-by-zero / max-speed command.
        assert_eq!(velocity_to_half_period(0.0), 32767);
    }

    #[test]
    fn throttle_encoding_matches_known_points() {
        assert_eq!(throttle_to_i16(100.0), 1023);
        assert_eq!(throttle_to_i16(-100.0), -1023);
        assert_eq!(throttle_to_i16(f64::NAN), 0);
    }
}
