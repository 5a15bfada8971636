//! Periodic control loop: command watchdog, sensor-rate watchdog,
//! per-rotor fault checks, ramp, and startup sequencing.

use std::time::Duration;

use tracing::warn;

use crate::control::ControlPlane;
use crate::error::Error;
use crate::pipeline::SensorPipeline;
use crate::types::ServoMode;
use rc_link::Connection;
use rc_proto::MAX_ROTORS;

/// Tick period the control loop and startup sequencer run at.
pub const CONTROL_PERIOD_MS: u64 = 1;

pub const DEFAULT_RAMP_S: f64 = 3.0;
pub const DEFAULT_SERVO_TIMEOUT_S: f64 = 30.0;

/// Fraction of nominal rate below which a sensor channel counts as
/// undersampled.
const RATE_WATCHDOG_FRACTION: f64 = 0.8;

/// The latest commanded rotor values, handed to [`ServoLoop::tick`] once per
/// cycle. `values` is one entry per rotor, trailing `NaN`s allowed.
#[derive(Debug, Clone)]
pub struct ControlInput {
    pub mode: ServoMode,
    pub values: Vec<f64>,
    /// Age of this command, seconds, as observed at the start of the tick.
    pub age_s: f64,
}

/// Result of one [`ServoLoop::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServoOutcome {
    /// Ramp and dispatch completed normally; loop should keep running.
    Running,
    /// Terminal: caller returns this error to the activity that started the
    /// servo.
    Faulted(ServoFault),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServoFault {
    Input,
    Rate(&'static str),
    RotorFailure(u8),
    RotorStopped(u8),
    RotorNotDisabled(u8),
}

impl From<ServoFault> for Error {
    fn from(f: ServoFault) -> Self {
        match f {
            ServoFault::Input => Error::Input,
            ServoFault::Rate(ch) => Error::Rate(ch.to_string()),
            ServoFault::RotorFailure(id) => Error::RotorFailure(id),
            ServoFault::RotorStopped(id) => Error::RotorStopped(id),
            ServoFault::RotorNotDisabled(id) => Error::RotorNotDisabled(id),
        }
    }
}

/// Periodic servo task state: just the ramp scale, everything else is read
/// fresh from [`SensorPipeline`] and the caller-supplied [`ControlInput`]
/// each tick.
#[derive(Debug, Clone, Copy)]
pub struct ServoLoop {
    pub scale: f64,
    pub ramp_s: f64,
}

impl Default for ServoLoop {
    fn default() -> Self {
        ServoLoop { scale: 0.0, ramp_s: DEFAULT_RAMP_S }
    }
}

impl ServoLoop {
    pub fn new(ramp_s: f64) -> Self {
        ServoLoop { scale: 0.0, ramp_s }
    }

    fn decay_step(&self) -> f64 {
        2.0 * CONTROL_PERIOD_MS as f64 / (1000.0 * self.ramp_s)
    }

    fn ramp_step(&self) -> f64 {
        CONTROL_PERIOD_MS as f64 / (1000.0 * self.ramp_s)
    }

    /// Runs one cycle. `input` is `None` when no command has ever arrived.
    pub fn tick(
        &mut self,
        conn: &mut Connection,
        pipeline: &mut SensorPipeline,
        input: Option<&ControlInput>,
    ) -> ServoOutcome {
        // 1. Input watchdog.
        let stale = match input {
            None => true,
            Some(cmd) => cmd.age_s > 0.5,
        };
        if stale {
            self.scale -= self.decay_step();
            if self.scale < 0.0 {
                ControlPlane::stop(conn, pipeline);
                return ServoOutcome::Faulted(ServoFault::Input);
            }
        }

        // 2. Rate watchdog.
        if let Some(channel) = self.undersampled_channel(pipeline) {
            self.scale -= self.decay_step();
            if self.scale < 0.0 {
                ControlPlane::stop(conn, pipeline);
                return ServoOutcome::Faulted(ServoFault::Rate(channel));
            }
        }

        // 3. Per-rotor checks.
        for (i, rotor) in pipeline.motors.iter().enumerate() {
            if rotor.disabled {
                continue;
            }
            if rotor.emerg {
                ControlPlane::stop(conn, pipeline);
                return ServoOutcome::Faulted(ServoFault::RotorFailure(i as u8 + 1));
            }
            if !(rotor.starting || rotor.spinning) {
                ControlPlane::stop(conn, pipeline);
                return ServoOutcome::Faulted(ServoFault::RotorStopped(i as u8 + 1));
            }
        }

        // 4. Ramp.
        let all_spinning = pipeline
            .motors
            .iter()
            .filter(|r| !r.disabled)
            .all(|r| r.spinning);
        if all_spinning {
            self.scale = (self.scale + self.ramp_step()).min(1.0);
        }

        // 5. Dispatch, scaled.
        if let Some(cmd) = input {
            let scaled: Vec<f64> = cmd
                .values
                .iter()
                .map(|v| if v.is_nan() { *v } else { v * self.scale.clamp(0.0, 1.0) })
                .collect();
            let dispatched = match cmd.mode {
                ServoMode::Velocity => ControlPlane::set_velocity(conn, pipeline, &scaled),
                ServoMode::Throttle => ControlPlane::set_throttle(conn, pipeline, &scaled),
            };
            if let Err(e) = dispatched {
                warn!(error = %e, "servo dispatch failed");
            }
        }

        ServoOutcome::Running
    }

    fn undersampled_channel(&self, pipeline: &SensorPipeline) -> Option<&'static str> {
        let check = |nominal: f64, measured: f64| nominal >= 0.1 && measured < RATE_WATCHDOG_FRACTION * nominal;
        if check(pipeline.rates.imu, pipeline.measured_rate_imu()) {
            return Some("imu");
        }
        if check(pipeline.rates.mag, pipeline.measured_rate_mag()) {
            return Some("mag");
        }
        for i in 1..=MAX_ROTORS as u8 {
            if check(pipeline.rates.motor, pipeline.measured_rate_motor(i)) {
                return Some("motor");
            }
        }
        None
    }
}

/// Per-rotor startup outcome reported out of [`StartupSequencer::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartupOutcome {
    Pending,
    Success,
    TimedOut,
    Error(ServoFault),
}

/// Drives the rotor-start handshake: `g%1` to every enabled rotor, then
/// waits for all of them to report `spinning` and all three sensor rates to
/// clear the watchdog threshold.
pub struct StartupSequencer {
    ticks_remaining: u64,
    seen_starting: [bool; MAX_ROTORS],
}

impl StartupSequencer {
    /// `timeout_s` converted to ticks of [`CONTROL_PERIOD_MS`].
    pub fn start(conn: &mut Connection, pipeline: &SensorPipeline, timeout_s: f64) -> Result<StartupSequencer, Error> {
        if pipeline.motors.iter().any(|r| !r.disabled && r.spinning) {
            return Err(Error::Started);
        }
        for (i, rotor) in pipeline.motors.iter().enumerate() {
            if rotor.disabled {
                continue;
            }
            let id = i as u8 + 1;
            conn.send_where(&rc_proto::Outbound::StartMotor(id), |l| {
                l.motor_range.is_some_and(|(min, max)| id >= min && id <= max)
            });
        }
        let ticks = (timeout_s * 1000.0 / CONTROL_PERIOD_MS as f64).ceil() as u64;
        Ok(StartupSequencer { ticks_remaining: ticks, seen_starting: [false; MAX_ROTORS] })
    }

    pub fn tick(&mut self, conn: &mut Connection, pipeline: &SensorPipeline) -> StartupOutcome {
        if self.ticks_remaining == 0 {
            ControlPlane::stop(&mut *conn, pipeline);
            return StartupOutcome::TimedOut;
        }
        self.ticks_remaining -= 1;

        for (i, rotor) in pipeline.motors.iter().enumerate() {
            if rotor.disabled {
                if rotor.starting || rotor.spinning {
                    ControlPlane::stop(conn, pipeline);
                    return StartupOutcome::Error(ServoFault::RotorNotDisabled(i as u8 + 1));
                }
                continue;
            }
            if rotor.emerg {
                ControlPlane::stop(conn, pipeline);
                return StartupOutcome::Error(ServoFault::RotorFailure(i as u8 + 1));
            }
            if rotor.starting {
                self.seen_starting[i] = true;
            } else if self.seen_starting[i] && !rotor.spinning {
                ControlPlane::stop(conn, pipeline);
                return StartupOutcome::Error(ServoFault::RotorStopped(i as u8 + 1));
            }
        }

        if self.ticks_remaining % 100 == 0 {
            for (i, rotor) in pipeline.motors.iter().enumerate() {
                if !rotor.disabled && !rotor.starting {
                    let _ = conn.send_where(&rc_proto::Outbound::StartMotor(i as u8 + 1), |l| {
                        l.motor_range.is_some_and(|(min, max)| {
                            let id = i as u8 + 1;
                            id >= min && id <= max
                        })
                    });
                }
            }
        }

        let all_spinning = pipeline.motors.iter().filter(|r| !r.disabled).all(|r| r.spinning);
        if !all_spinning {
            return StartupOutcome::Pending;
        }

        let rates_ok = [
            (pipeline.rates.imu, pipeline.measured_rate_imu()),
            (pipeline.rates.mag, pipeline.measured_rate_mag()),
        ]
        .iter()
        .all(|(nominal, measured)| *nominal < 0.1 || *measured >= RATE_WATCHDOG_FRACTION * nominal)
            && (1..=MAX_ROTORS as u8).all(|id| {
                pipeline.rates.motor < 0.1
                    || pipeline.measured_rate_motor(id) >= RATE_WATCHDOG_FRACTION * pipeline.rates.motor
            });

        if rates_ok {
            StartupOutcome::Success
        } else {
            StartupOutcome::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RotorRecord;

    fn running_pipeline(n_enabled: usize, spinning: bool) -> SensorPipeline {
        let mut p = SensorPipeline::new();
        for r in p.motors.iter_mut().take(n_enabled) {
            *r = RotorRecord { disabled: false, spinning, starting: spinning, ..RotorRecord::default() };
        }
        p
    }

    #[test]
    fn ramp_reaches_one_in_expected_ticks() {
        let mut conn = Connection::new();
        let mut pipeline = running_pipeline(MAX_ROTORS, true);
        let mut servo = ServoLoop::new(3.0);
        let expected_ticks = (3.0 * 1000.0 / CONTROL_PERIOD_MS as f64).ceil() as u64;
        let input = ControlInput { mode: ServoMode::Velocity, values: vec![0.0; MAX_ROTORS], age_s: 0.0 };
        for _ in 0..expected_ticks {
            let outcome = servo.tick(&mut conn, &mut pipeline, Some(&input));
            assert_eq!(outcome, ServoOutcome::Running);
        }
        assert!((servo.scale - 1.0).abs() < 1e-9, "scale={}", servo.scale);
    }

    #[test]
    fn stale_input_faults_after_enough_ticks() {
        let mut conn = Connection::new();
        let mut pipeline = running_pipeline(MAX_ROTORS, true);
        let mut servo = ServoLoop::new(3.0);
        let stale = ControlInput { mode: ServoMode::Velocity, values: vec![0.0; MAX_ROTORS], age_s: 1.0 };
        let mut last = ServoOutcome::Running;
        for _ in 0..2000 {
            last = servo.tick(&mut conn, &mut pipeline, Some(&stale));
            if last != ServoOutcome::Running {
                break;
            }
        }
        assert_eq!(last, ServoOutcome::Faulted(ServoFault::Input));
    }

    #[test]
    fn emergency_rotor_faults_immediately() {
        let mut conn = Connection::new();
        let mut pipeline = running_pipeline(1, true);
        pipeline.motors[0].emerg = true;
        let mut servo = ServoLoop::new(3.0);
        let input = ControlInput { mode: ServoMode::Velocity, values: vec![0.0; MAX_ROTORS], age_s: 0.0 };
        let outcome = servo.tick(&mut conn, &mut pipeline, Some(&input));
        assert_eq!(outcome, ServoOutcome::Faulted(ServoFault::RotorFailure(1)));
    }

    #[test]
    fn rate_watchdog_trips_on_undersampled_imu() {
        let mut conn = Connection::new();
        let mut pipeline = running_pipeline(MAX_ROTORS, true);
        pipeline.rates.imu = 1000.0;
        // measured rate left at 0 (default), well under 80% of nominal.
        let mut servo = ServoLoop::new(3.0);
        let input = ControlInput { mode: ServoMode::Velocity, values: vec![0.0; MAX_ROTORS], age_s: 0.0 };
        let mut last = ServoOutcome::Running;
        for _ in 0..5000 {
            last = servo.tick(&mut conn, &mut pipeline, Some(&input));
            if last != ServoOutcome::Running {
                break;
            }
        }
        assert_eq!(last, ServoOutcome::Faulted(ServoFault::Rate("imu")));
    }

    #[test]
    fn startup_faults_when_disabled_rotor_reports_spinning() {
        let mut conn = Connection::new();
        let mut pipeline = SensorPipeline::new();
        pipeline.motors[0] =
            RotorRecord { disabled: true, spinning: true, ..RotorRecord::default() };
        let mut seq = StartupSequencer { ticks_remaining: 10, seen_starting: [false; MAX_ROTORS] };
        let outcome = seq.tick(&mut conn, &pipeline);
        assert_eq!(outcome, StartupOutcome::Error(ServoFault::RotorNotDisabled(1)));
    }
}
