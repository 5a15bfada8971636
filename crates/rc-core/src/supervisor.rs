//! Owns all shared state and runs the two cooperative periodic tasks plus
//! the one-shot activities that make up the bridge's command surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nalgebra::Vector3;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::calibration::{CalibrationStats, CollectOutcome, ImuCalibrator};
use crate::control::ControlPlane;
use crate::error::Error;
use crate::logger::{format_log_line, FileLogWriter, LogRecord, LogWriter};
use crate::pipeline::SensorPipeline;
use crate::servo::{ControlInput, ServoLoop, ServoOutcome, StartupSequencer, StartupOutcome, CONTROL_PERIOD_MS};
use crate::types::{Battery, ImuSample, MagSample, SensorRates, ServoMode};
use rc_link::Connection;
use rc_proto::MAX_ROTORS;

/// Every this many `main` ticks, a low-battery alarm re-sounds the beeper
/// (one beep per 500ms at the default 1ms tick).
const BATTERY_ALARM_PERIOD_TICKS: u64 = 500;
const BATTERY_ALARM_HZ: u16 = 440;

/// Whether tick `main_tick` should re-sound the low-battery alarm beep.
fn should_sound_battery_alarm(main_tick: u64, battery: &Battery) -> bool {
    main_tick % BATTERY_ALARM_PERIOD_TICKS == 0 && battery.is_alarmed()
}

fn now_wall() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Everything the `comm`/`main` tasks and the activity surface touch,
/// behind one lock. Critical sections are kept to a single poll/dispatch
/// cycle, one `main` tick, or one activity step — never held across a
/// suspend point that waits on external I/O.
pub struct SystemState {
    pub connection: Connection,
    pub pipeline: SensorPipeline,
    pub servo: ServoLoop,
    pub control_input: Option<ControlInput>,
    pub servo_active: bool,
    logger: Option<Arc<dyn LogWriter>>,
    log_decimation: u32,
    log_tick: u64,
    main_tick: u64,
}

impl SystemState {
    fn new() -> Self {
        SystemState {
            connection: Connection::new(),
            pipeline: SensorPipeline::new(),
            servo: ServoLoop::default(),
            control_input: None,
            servo_active: false,
            logger: None,
            log_decimation: 1,
            log_tick: 0,
            main_tick: 0,
        }
    }

    /// Assembles one log line from current state. Channels whose timestamp
    /// hasn't moved are rendered as placeholders by the caller via
    /// `format_log_line`; here we only decide whether each channel counts
    /// as "present this cycle".
    fn build_log_record(&self) -> LogRecord {
        let imu = &self.pipeline.imu;
        let mag = &self.pipeline.mag;
        let mut wd = [None; MAX_ROTORS];
        let mut vel = [None; MAX_ROTORS];
        let mut clkrate = [None; MAX_ROTORS];
        for (i, rotor) in self.pipeline.motors.iter().enumerate() {
            if !rotor.disabled {
                wd[i] = Some(rotor.wd);
                vel[i] = Some(rotor.velocity);
                clkrate[i] = Some(rotor.clkrate);
            }
        }
        LogRecord {
            ts: Some(imu.ts),
            rate_imu: self.pipeline.measured_rate_imu(),
            rate_mag: self.pipeline.measured_rate_mag(),
            rate_motor: self.pipeline.measured_rate_motor(1),
            battery: self.pipeline.battery.level.is_finite().then_some(self.pipeline.battery.level),
            temp: imu.temp.is_finite().then_some(imu.temp),
            gyro_raw: None,
            gyro_filt: imu.present.then_some(imu.gyro),
            accel_raw: None,
            accel_filt: imu.present.then_some(imu.accel),
            mag_raw: None,
            mag_filt: mag.present.then_some(mag.mag),
            wd,
            vel,
            clkrate,
        }
    }
}

/// Orchestrates the bridge: owns `SystemState` and drives the `comm` and
/// `main` tasks for the process lifetime.
pub struct Supervisor {
    state: Arc<Mutex<SystemState>>,
    stop: Arc<AtomicBool>,
    comm_task: Mutex<Option<JoinHandle<()>>>,
    main_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            state: Arc::new(Mutex::new(SystemState::new())),
            stop: Arc::new(AtomicBool::new(false)),
            comm_task: Mutex::new(None),
            main_task: Mutex::new(None),
        }
    }

    /// Starts the `comm` and `main` periodic tasks. Idempotent: a second
    /// call is a no-op while the tasks are already running.
    pub async fn spawn_tasks(&self) {
        let mut comm_guard = self.comm_task.lock().await;
        if comm_guard.is_none() {
            *comm_guard = Some(tokio::spawn(Self::comm_loop(self.state.clone(), self.stop.clone())));
        }
        let mut main_guard = self.main_task.lock().await;
        if main_guard.is_none() {
            *main_guard = Some(tokio::spawn(Self::main_loop(self.state.clone(), self.stop.clone())));
        }
    }

    /// Signals both tasks to exit and waits for them to finish.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.comm_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.main_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// `comm` task: `poll (<=500ms) -> nodata | recv -> dispatch all -> poll`.
    /// `Connection::poll` is a blocking OS call: we snapshot the open fds
    /// under the lock, release it, then block on `spawn_blocking` — the
    /// lock is never held across the wait, so `main` and any in-flight
    /// activity keep making progress while `comm` is parked in `poll(2)`.
    #[instrument(skip_all, name = "comm")]
    async fn comm_loop(state: Arc<Mutex<SystemState>>, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Acquire) {
            let fds = {
                let guard = state.lock().await;
                guard.connection.open_fds()
            };
            if fds.is_empty() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }

            let outcome =
                tokio::task::spawn_blocking(move || rc_link::poll_fds(&fds, Duration::from_millis(500))).await;

            let outcome = match outcome {
                Ok(Ok(o)) => o,
                Ok(Err(e)) => {
                    warn!(error = %e, "comm poll failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "comm poll task panicked");
                    continue;
                }
            };

            let arrival = now_wall();
            let mut guard = state.lock().await;
            match outcome {
                rc_link::PollOutcome::NoData => {
                    guard.pipeline.republish_nodata();
                    let rates = guard.pipeline.rates;
                    let SystemState { connection, pipeline, .. } = &mut *guard;
                    if let Err(e) = ControlPlane::set_sensor_rate(connection, pipeline, rates) {
                        warn!(error = %e, "failed to re-send sensor rates after no-data timeout");
                    }
                }
                rc_link::PollOutcome::Ready(ready) => {
                    let frames = guard.connection.recv(&ready);
                    for (idx, msg) in frames {
                        let meta = guard.connection.link(idx).map(|l| l.meta()).unwrap_or_default();
                        guard.pipeline.dispatch(&meta, msg, arrival);
                    }
                }
            }
        }
    }

    /// `main` task: once per `CONTROL_PERIOD_MS`, ages measured rates,
    /// steps the servo loop if active, and hands one decimated line to the
    /// logger.
    #[instrument(skip_all, name = "main")]
    async fn main_loop(state: Arc<Mutex<SystemState>>, stop: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(CONTROL_PERIOD_MS));
        while !stop.load(Ordering::Acquire) {
            ticker.tick().await;
            let mut guard = state.lock().await;
            let now = now_wall() - crate::timestamp::TIME_EPOCH_OFFSET;
            guard.pipeline.age_rates(now);

            if guard.servo_active {
                let input = guard.control_input.clone();
                let SystemState { connection, pipeline, servo, .. } = &mut *guard;
                match servo.tick(connection, pipeline, input.as_ref()) {
                    ServoOutcome::Running => {}
                    ServoOutcome::Faulted(fault) => {
                        warn!(?fault, "servo faulted, deactivating");
                        guard.servo_active = false;
                    }
                }
            }

            guard.main_tick += 1;
            if should_sound_battery_alarm(guard.main_tick, &guard.pipeline.battery) {
                guard.connection.broadcast(&rc_proto::Outbound::Beep { freq_hz: BATTERY_ALARM_HZ });
            }

            guard.log_tick += 1;
            if let Some(logger) = guard.logger.clone() {
                if guard.log_tick % guard.log_decimation as u64 == 0 {
                    let record = guard.build_log_record();
                    logger.submit(format_log_line(&record));
                }
            }
        }
    }

    /// Opens one link and adds it to the connection.
    pub async fn connect(&self, path: &str, baud: u32, imu: bool, mag: bool, motor_range: Option<(u8, u8)>) -> Result<usize, Error> {
        let path = path.to_string();
        let link = tokio::task::spawn_blocking(move || rc_link::Link::open(&path, baud, imu, mag, motor_range))
            .await
            .map_err(|e| Error::Sys { context: "connect".into(), source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()) })??;
        let mut guard = self.state.lock().await;
        Ok(guard.connection.add_link(link)?)
    }

    /// Opens several links in one batch. Each link is validated against
    /// the connection invariants as it is added; because `Connection`
    /// grows its backing storage before committing any single link (see
    /// `Connection::add_link`), a failure partway through never leaves the
    /// vector in a state where a previously reserved slot silently
    /// vanishes — it simply stops adding and reports which spec failed.
    pub async fn pconnect(&self, specs: &[(String, u32, bool, bool, Option<(u8, u8)>)]) -> Result<Vec<usize>, Error> {
        let mut opened = Vec::with_capacity(specs.len());
        for (path, baud, imu, mag, motor_range) in specs {
            opened.push(self.connect(path, *baud, *imu, *mag, *motor_range).await?);
        }
        Ok(opened)
    }

    pub async fn disconnect(&self, idx: usize) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        guard.connection.remove_link(idx).ok_or(Error::Connection)?;
        Ok(())
    }

    /// Runs the startup sequencer to completion, ticking at
    /// `CONTROL_PERIOD_MS`.
    pub async fn start(&self, timeout_s: f64) -> Result<(), Error> {
        let mut sequencer = {
            let mut guard = self.state.lock().await;
            StartupSequencer::start(&mut guard.connection, &guard.pipeline, timeout_s)?
        };
        loop {
            tokio::time::sleep(Duration::from_millis(CONTROL_PERIOD_MS)).await;
            let mut guard = self.state.lock().await;
            let SystemState { connection, pipeline, .. } = &mut *guard;
            match sequencer.tick(connection, pipeline) {
                StartupOutcome::Pending => continue,
                StartupOutcome::Success => return Ok(()),
                StartupOutcome::TimedOut => return Err(Error::Sys { context: "start".into(), source: std::io::Error::new(std::io::ErrorKind::TimedOut, "startup watchdog expired") }),
                StartupOutcome::Error(fault) => return Err(fault.into()),
            }
        }
    }

    /// Arms the servo loop with a fresh command; `main` picks it up on its
    /// next tick.
    pub async fn servo(&self, mode: ServoMode, values: Vec<f64>) {
        let mut guard = self.state.lock().await;
        guard.control_input = Some(ControlInput { mode, values, age_s: 0.0 });
        guard.servo_active = true;
    }

    /// Broadcasts emergency stop and waits up to 500ms for every
    /// non-disabled rotor to report not-spinning.
    pub async fn stop(&self) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        loop {
            let mut guard = self.state.lock().await;
            guard.servo_active = false;
            let still_spinning = ControlPlane::stop(&mut guard.connection, &guard.pipeline);
            if !still_spinning {
                return Ok(());
            }
            drop(guard);
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Sys { context: "stop".into(), source: std::io::Error::new(std::io::ErrorKind::TimedOut, "rotors still spinning after 500ms") });
            }
            tokio::time::sleep(Duration::from_millis(CONTROL_PERIOD_MS)).await;
        }
    }

    pub async fn set_sensor_rate(&self, rates: SensorRates) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let SystemState { connection, pipeline, .. } = &mut *guard;
        ControlPlane::set_sensor_rate(connection, pipeline, rates)
    }

    pub async fn set_battery_limits(&self, min: f64, max: f64) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        ControlPlane::set_battery_limits(&mut guard.pipeline, min, max)
    }

    pub async fn disable_motor(&self, id: u8) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let SystemState { connection, pipeline, .. } = &mut *guard;
        ControlPlane::disable_motor(connection, pipeline, id)
    }

    pub async fn enable_motor(&self, id: u8) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let SystemState { connection, pipeline, .. } = &mut *guard;
        ControlPlane::enable_motor(connection, pipeline, id)
    }

    pub async fn set_pid(&self, motor: u8, kp: f64, ki: f64, kd: f64, f: f64) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        ControlPlane::set_pid(&mut guard.connection, motor, kp, ki, kd, f)
    }

    pub async fn set_velocity(&self, desired: Vec<f64>) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let SystemState { connection, pipeline, .. } = &mut *guard;
        ControlPlane::set_velocity(connection, pipeline, &desired)
    }

    pub async fn set_throttle(&self, desired: Vec<f64>) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let SystemState { connection, pipeline, .. } = &mut *guard;
        ControlPlane::set_throttle(connection, pipeline, &desired)
    }

    pub async fn set_imu_filter(&self, gfc: f64, afc: f64, mfc: f64) {
        let mut guard = self.state.lock().await;
        guard.pipeline.set_imu_filter(gfc, afc, mfc);
    }

    pub async fn get_imu_filter(&self) -> (f64, f64, f64) {
        let guard = self.state.lock().await;
        (guard.pipeline.gyro_fc, guard.pipeline.accel_fc, guard.pipeline.mag_fc)
    }

    pub async fn set_imu_calibration(&self, calibration: crate::filter::ImuCalibration) {
        let mut guard = self.state.lock().await;
        guard.pipeline.calibration = calibration;
    }

    /// Runs a calibration session against an injected solver, feeding it
    /// live IMU/Mag samples once per `CONTROL_PERIOD_MS` until it reports
    /// completion or the caller's `max_ticks` budget expires.
    pub async fn calibrate_imu<C: ImuCalibrator>(
        &self,
        calibrator: &mut C,
        samples_per_pose: u32,
        n_poses: u32,
        sps: f64,
        motion_tolerance: f64,
        max_ticks: u64,
    ) -> Result<CalibrationStats, Error> {
        calibrator.init(samples_per_pose, n_poses, sps, motion_tolerance);
        for _ in 0..max_ticks {
            tokio::time::sleep(Duration::from_millis(CONTROL_PERIOD_MS)).await;
            let (temp, imu, mag) = {
                let guard = self.state.lock().await;
                (guard.pipeline.imu.temp, guard.pipeline.imu, guard.pipeline.mag)
            };
            match calibrator.collect(temp, &imu, &mag) {
                CollectOutcome::Ok => {
                    let stats = calibrator.fini();
                    let mut guard = self.state.lock().await;
                    guard.pipeline.calibration.gyro = to_calibration(calibrator.gyro());
                    guard.pipeline.calibration.accel = to_calibration(calibrator.accel());
                    guard.pipeline.calibration.mag = to_calibration(calibrator.mag());
                    guard.pipeline.calibration.reference_temp = stats.temp;
                    return Ok(stats);
                }
                CollectOutcome::Again { still_count } => {
                    info!(still_count, "calibration pose pending");
                }
                CollectOutcome::Error => {
                    calibrator.fini();
                    return Err(Error::Sys { context: "calibrate_imu".into(), source: std::io::Error::new(std::io::ErrorKind::Other, "motion exceeded tolerance") });
                }
            }
        }
        calibrator.fini();
        Err(Error::Sys { context: "calibrate_imu".into(), source: std::io::Error::new(std::io::ErrorKind::TimedOut, "calibration did not complete") })
    }

    /// Zeroes gyro/accel bias from the current averaged sample and derives
    /// a level-pose rotation, post-multiplied into both scale matrices.
    /// Per the documented deviation (see `DESIGN.md`), this compares the
    /// `nsec` field of the last IMU timestamp against the `nsec` field
    /// recorded at the start of the hold, not `nsec` against `sec`.
    pub async fn set_zero(&self, hold_start_nsec: u32) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        if guard.pipeline.imu.ts.nsec == hold_start_nsec {
            return Err(Error::Sys { context: "set_zero".into(), source: std::io::Error::new(std::io::ErrorKind::WouldBlock, "no new IMU sample since hold started") });
        }
        let accel = Vector3::new(guard.pipeline.imu.accel[0], guard.pipeline.imu.accel[1], guard.pipeline.imu.accel[2]);
        let gyro_bias = Vector3::new(guard.pipeline.imu.gyro[0], guard.pipeline.imu.gyro[1], guard.pipeline.imu.gyro[2]);
        guard.pipeline.calibration.gyro.bias -= gyro_bias;

        let gravity = Vector3::new(0.0, 0.0, accel.norm());
        let rotation = nalgebra::Rotation3::rotation_between(&accel, &gravity)
            .unwrap_or_else(nalgebra::Rotation3::identity);
        guard.pipeline.calibration.accel.scale = rotation.matrix() * guard.pipeline.calibration.accel.scale;
        guard.pipeline.calibration.gyro.scale = rotation.matrix() * guard.pipeline.calibration.gyro.scale;
        Ok(())
    }

    /// Updates gyro bias only, from the current sample, leaving scale
    /// untouched (used while the vehicle is known to be at rest but not
    /// necessarily level).
    pub async fn set_zero_velocity(&self) {
        let mut guard = self.state.lock().await;
        let gyro = Vector3::new(guard.pipeline.imu.gyro[0], guard.pipeline.imu.gyro[1], guard.pipeline.imu.gyro[2]);
        guard.pipeline.calibration.gyro.bias -= gyro;
    }

    /// Averages IMU/Mag/Battery samples for `duration`, sampling once per
    /// `CONTROL_PERIOD_MS`.
    pub async fn get_sensor_average(&self, duration: Duration) -> (ImuSample, MagSample, Battery) {
        let ticks = (duration.as_secs_f64() * 1000.0 / CONTROL_PERIOD_MS as f64).round().max(1.0) as u64;
        let mut accel = Vector3::zeros();
        let mut gyro = Vector3::zeros();
        let mut mag = Vector3::zeros();
        let mut battery_sum = 0.0;
        let mut n = 0u64;
        for _ in 0..ticks {
            tokio::time::sleep(Duration::from_millis(CONTROL_PERIOD_MS)).await;
            let guard = self.state.lock().await;
            if guard.pipeline.imu.present {
                accel += Vector3::from(guard.pipeline.imu.accel);
                gyro += Vector3::from(guard.pipeline.imu.gyro);
            }
            if guard.pipeline.mag.present {
                mag += Vector3::from(guard.pipeline.mag.mag);
            }
            if guard.pipeline.battery.level.is_finite() {
                battery_sum += guard.pipeline.battery.level;
            }
            n += 1;
        }
        let n = n.max(1) as f64;
        let guard = self.state.lock().await;
        let mut imu = guard.pipeline.imu;
        imu.accel = (accel / n).into();
        imu.gyro = (gyro / n).into();
        let mut mag_sample = guard.pipeline.mag;
        mag_sample.mag = (mag / n).into();
        let mut battery = guard.pipeline.battery;
        battery.level = battery_sum / n;
        (imu, mag_sample, battery)
    }

    /// Opens `path`, writes a header (calibration/filter/rates/wall-clock
    /// start, `#`-prefixed per the log file format), and starts logging
    /// one decimated line per `main` tick.
    pub async fn log(&self, path: &str, decimation: u32) -> Result<(), Error> {
        let mut guard = self.state.lock().await;
        let header = vec![
            format!("# rc-bridged log start_wall={:.6}", now_wall()),
            format!(
                "# filter gyro_fc={} accel_fc={} mag_fc={}",
                guard.pipeline.gyro_fc, guard.pipeline.accel_fc, guard.pipeline.mag_fc
            ),
            format!(
                "# rates imu={} mag={} motor={} battery={}",
                guard.pipeline.rates.imu, guard.pipeline.rates.mag, guard.pipeline.rates.motor, guard.pipeline.rates.battery
            ),
        ];
        let writer = FileLogWriter::create(path, &header)
            .await
            .map_err(|e| Error::Sys { context: format!("log({path})"), source: e })?;
        guard.logger = Some(Arc::new(writer));
        guard.log_decimation = decimation.max(1);
        guard.log_tick = 0;
        Ok(())
    }

    pub async fn log_stop(&self) {
        let mut guard = self.state.lock().await;
        guard.logger = None;
    }

    pub async fn log_info(&self) -> Option<crate::logger::LogStats> {
        let guard = self.state.lock().await;
        guard.logger.as_ref().map(|l| l.stats())
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn to_calibration(r: crate::calibration::CalibrationResult) -> crate::filter::Calibration {
    crate::filter::Calibration { scale: r.scale, bias: r.bias, stddev: r.stddev }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_beep_fires_every_500th_tick_while_low() {
        let battery = Battery { min: 14.0, max: 16.8, level: 13.5, ..Battery::default() };
        assert!(!should_sound_battery_alarm(1, &battery));
        assert!(!should_sound_battery_alarm(499, &battery));
        assert!(should_sound_battery_alarm(500, &battery));
        assert!(should_sound_battery_alarm(1000, &battery));
    }

    #[test]
    fn alarm_beep_silent_once_battery_recovers() {
        let battery = Battery { min: 14.0, max: 16.8, level: 15.5, ..Battery::default() };
        assert!(!should_sound_battery_alarm(500, &battery));
    }
}
