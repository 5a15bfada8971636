//! Dispatches decoded frames into IMU/Mag/Motor/Battery state, driving the
//! timestamper and filter along the way.

use nalgebra::Vector3;
use rc_link::LinkMeta;
use rc_proto::{Inbound, MAX_ROTORS};
use tracing::trace;

use crate::filter::{alpha_of, Calibration, FilterState, ImuCalibration};
use crate::timestamp::{reduce, ChannelTimer, Timestamp};
use crate::types::{default_rotor_bank, Battery, ImuSample, MagSample, RotorBank, SensorRates};

/// Per-channel synchronization + dedup + staleness state.
#[derive(Default)]
struct Timestamper {
    imu: ChannelTimer,
    mag: ChannelTimer,
    battery: ChannelTimer,
    motor: [ChannelTimer; MAX_ROTORS],
    last_seq_imu: Option<u8>,
    last_seq_mag: Option<u8>,
    last_seq_battery: Option<u8>,
    last_seq_motor: [Option<u8>; MAX_ROTORS],
    last_seen_imu: f64,
    last_seen_mag: f64,
    last_seen_battery: f64,
    last_seen_motor: [f64; MAX_ROTORS],
}

impl Timestamper {
    fn reset_offsets(&mut self) {
        self.imu.reset_offset();
        self.mag.reset_offset();
        self.battery.reset_offset();
        for t in &mut self.motor {
            t.reset_offset();
        }
    }
}

/// IMU/Mag/Motor/Battery state plus everything needed to process incoming
/// frames into it.
pub struct SensorPipeline {
    timestamper: Timestamper,
    pub calibration: ImuCalibration,
    filter_gyro: FilterState,
    filter_accel: FilterState,
    filter_mag: FilterState,
    /// Raw magnetometer bias, applied both to the sample *and* as the
    /// filter's bias argument. This double application is a known quirk of
    /// the original hardware and is preserved intentionally.
    pub mag_bias: Vector3<f64>,
    pub rates: SensorRates,
    pub imu: ImuSample,
    pub mag: MagSample,
    pub motors: RotorBank,
    pub battery: Battery,
    pub gyro_fc: f64,
    pub accel_fc: f64,
    pub mag_fc: f64,
}

impl SensorPipeline {
    pub fn new() -> Self {
        SensorPipeline {
            timestamper: Timestamper::default(),
            calibration: ImuCalibration::default(),
            filter_gyro: FilterState::default(),
            filter_accel: FilterState::default(),
            filter_mag: FilterState::default(),
            mag_bias: Vector3::zeros(),
            rates: SensorRates::default(),
            imu: ImuSample::default(),
            mag: MagSample::default(),
            motors: default_rotor_bank(),
            battery: Battery::default(),
            gyro_fc: 0.0,
            accel_fc: 0.0,
            mag_fc: 0.0,
        }
    }

    /// Re-derives filter coefficients for a new sample rate while keeping
    /// the user-facing cutoff frequencies unchanged, and resets every
    /// channel's offset estimator to force a cold re-sync.
    pub fn on_rate_changed(&mut self, rates: SensorRates) {
        self.rates = rates;
        self.filter_gyro.set_alpha(alpha_of(self.gyro_fc, rates.imu));
        self.filter_accel.set_alpha(alpha_of(self.accel_fc, rates.imu));
        self.filter_mag.set_alpha(alpha_of(self.mag_fc, rates.mag));
        self.timestamper.reset_offsets();
    }

    pub fn set_imu_filter(&mut self, gfc: f64, afc: f64, mfc: f64) {
        self.gyro_fc = gfc;
        self.accel_fc = afc;
        self.mag_fc = mfc;
        self.filter_gyro.set_alpha(alpha_of(gfc, self.rates.imu));
        self.filter_accel.set_alpha(alpha_of(afc, self.rates.imu));
        self.filter_mag.set_alpha(alpha_of(mfc, self.rates.mag));
    }

    pub fn measured_rate_imu(&self) -> f64 {
        self.timestamper.imu.measured_rate()
    }
    pub fn measured_rate_mag(&self) -> f64 {
        self.timestamper.mag.measured_rate()
    }
    pub fn measured_rate_motor(&self, id: u8) -> f64 {
        self.timestamper.motor[(id - 1) as usize].measured_rate()
    }

    /// Decays measured rates for channels that have gone quiet for more
    /// than 10x their nominal period. `now` is a reduced wall-clock time.
    pub fn age_rates(&mut self, now: f64) {
        let stale = |last_seen: f64, rate: f64| rate > 0.1 && now - last_seen > 10.0 / rate;
        if stale(self.timestamper.last_seen_imu, self.rates.imu) {
            self.timestamper.imu.decay_rate();
        }
        if stale(self.timestamper.last_seen_mag, self.rates.mag) {
            self.timestamper.mag.decay_rate();
        }
        for i in 0..MAX_ROTORS {
            if stale(self.timestamper.last_seen_motor[i], self.rates.motor) {
                self.timestamper.motor[i].decay_rate();
            }
        }
    }

    /// Republishes every channel with NaN values and `present = false`,
    /// called after a 500ms poll timeout with no data on any link.
    pub fn republish_nodata(&mut self) {
        self.imu.present = false;
        self.imu.accel = [f64::NAN; 3];
        self.imu.gyro = [f64::NAN; 3];
        self.mag.present = false;
        self.mag.mag = [f64::NAN; 3];
        self.battery.level = f64::NAN;
    }

    /// Processes one decoded frame arriving on `link` at wall-clock
    /// `arrival_wall` (seconds since `UNIX_EPOCH`).
    pub fn dispatch(&mut self, link: &LinkMeta, msg: Inbound, arrival_wall: f64) {
        let arrival = reduce(arrival_wall);
        match msg {
            Inbound::Imu { seq, accel, gyro, temp } => {
                if self.timestamper.last_seq_imu == Some(seq) {
                    return;
                }
                self.timestamper.last_seq_imu = Some(seq);
                self.timestamper.last_seen_imu = arrival;
                let ts = self.timestamper.imu.update(seq, arrival, self.rates.imu);
                self.imu.ts = Timestamp::from_reduced_seconds(ts);

                let (accel_res, gyro_res) = link
                    .device
                    .map(|(_, s)| (s.accel_res, s.gyro_res))
                    .unwrap_or((1.0, 1.0));

                let raw_accel = Vector3::new(accel[0] as f64, accel[1] as f64, accel[2] as f64) * accel_res;
                let calibrated_accel = self.calibration.accel.apply(raw_accel);
                let filtered_accel = self.filter_accel.step(calibrated_accel);

                let raw_gyro = Vector3::new(gyro[0] as f64, gyro[1] as f64, gyro[2] as f64) * gyro_res;
                let calibrated_gyro = self.calibration.gyro.apply(raw_gyro);
                let filtered_gyro = self.filter_gyro.step(calibrated_gyro);

                self.imu.accel = [filtered_accel.x, filtered_accel.y, filtered_accel.z];
                self.imu.gyro = [filtered_gyro.x, filtered_gyro.y, filtered_gyro.z];
                let cov_a = self.calibration.accel.covariance_diag();
                let cov_g = self.calibration.gyro.covariance_diag();
                self.imu.cov_accel = [cov_a.x, cov_a.y, cov_a.z];
                self.imu.cov_gyro = [cov_g.x, cov_g.y, cov_g.z];
                self.imu.present = true;

                if let Some(raw_temp) = temp {
                    if let Some((_, spec)) = link.device {
                        if let Some((tres, toff)) = spec.temp {
                            self.imu.temp = raw_temp as f64 * tres + toff;
                        }
                    }
                }
            }
            Inbound::Mag { seq, mag } => {
                if self.timestamper.last_seq_mag == Some(seq) {
                    return;
                }
                self.timestamper.last_seq_mag = Some(seq);
                self.timestamper.last_seen_mag = arrival;
                let ts = self.timestamper.mag.update(seq, arrival, self.rates.mag);
                self.mag.ts = Timestamp::from_reduced_seconds(ts);

                let mag_res = link.device.map(|(_, s)| s.mag_res).unwrap_or(1.0);
                let raw = Vector3::new(mag[0] as f64, mag[1] as f64, mag[2] as f64) * mag_res;
                // Intentionally preserved quirk: `mag_bias` is added to the
                // raw sample *and* reused as the filter's calibration bias,
                // so it is applied twice.
                let biased = raw + self.mag_bias;
                let mut calib = self.calibration.mag;
                calib.bias = self.mag_bias;
                let calibrated = calib.apply(biased);
                let filtered = self.filter_mag.step(calibrated);

                self.mag.mag = [filtered.x, filtered.y, filtered.z];
                let cov = self.calibration.mag.covariance_diag();
                self.mag.cov = [cov.x, cov.y, cov.z];
                self.mag.present = true;
            }
            Inbound::Motor { seq, state, velocity, throttle, consumption } => {
                let Some(id) = link.resolve_motor_id(state) else {
                    trace!(state, "motor frame outside this link's assigned range, dropped");
                    return;
                };
                let idx = (id - 1) as usize;
                if self.timestamper.last_seq_motor[idx] == Some(seq) {
                    return;
                }
                self.timestamper.last_seq_motor[idx] = Some(seq);
                self.timestamper.last_seen_motor[idx] = arrival;
                let ts = self.timestamper.motor[idx].update(seq, arrival, self.rates.motor);

                let rotor = &mut self.motors[idx];
                if rotor.autoconf && rotor.disabled {
                    rotor.disabled = false;
                }
                rotor.ts = Timestamp::from_reduced_seconds(ts);
                rotor.emerg = state & 0x80 != 0;
                rotor.spinning = state & 0x20 != 0;
                rotor.starting = state & 0x10 != 0;
                rotor.velocity = if rotor.spinning && velocity != 0 {
                    1.0e6 / 2.0 / velocity as f64
                } else {
                    0.0
                };
                rotor.throttle = throttle as f64 * 100.0 / 1023.0;
                rotor.consumption = consumption as f64 / 1000.0;
            }
            Inbound::Battery { seq, level_mv } => {
                if self.timestamper.last_seq_battery == Some(seq) {
                    return;
                }
                self.timestamper.last_seq_battery = Some(seq);
                self.timestamper.last_seen_battery = arrival;
                let ts = self.timestamper.battery.update(seq, arrival, self.rates.battery);
                self.battery.ts = Timestamp::from_reduced_seconds(ts);
                self.battery.level = level_mv as f64 / 1000.0;
                let energy = self.battery.energy_level();
                for rotor in &mut self.motors {
                    rotor.energy_level = energy;
                }
            }
            Inbound::Clkrate { local_id, clkrate } => {
                let Some(id) = link.resolve_motor_id(local_id) else { return };
                self.motors[(id - 1) as usize].clkrate = clkrate;
            }
            Inbound::Identity(_) => {}
        }
    }
}

impl Default for SensorPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_link::LinkMeta;

    fn imu_link() -> LinkMeta {
        LinkMeta { device: None, motor_range: None }
    }

    fn motor_link(min: u8, max: u8) -> LinkMeta {
        LinkMeta { device: None, motor_range: Some((min, max)) }
    }

    #[test]
    fn duplicate_sequence_is_dropped() {
        let mut p = SensorPipeline::new();
        p.rates.imu = 1000.0;
        let link = imu_link();
        p.dispatch(&link, Inbound::Imu { seq: 1, accel: [1, 2, 3], gyro: [4, 5, 6], temp: None }, 0.0);
        let first = p.imu;
        p.dispatch(&link, Inbound::Imu { seq: 1, accel: [100, 200, 300], gyro: [1, 1, 1], temp: None }, 0.001);
        assert_eq!(p.imu.accel, first.accel);
    }

    #[test]
    fn motor_velocity_is_zero_when_not_spinning() {
        let mut p = SensorPipeline::new();
        p.rates.motor = 100.0;
        let link = motor_link(1, 4);
        p.dispatch(
            &link,
            Inbound::Motor { seq: 1, state: 0x00, velocity: 500, throttle: 0, consumption: 0 },
            0.0,
        );
        assert_eq!(p.motors[0].velocity, 0.0);
        assert!(!p.motors[0].spinning);
    }

    #[test]
    fn motor_outside_link_range_is_dropped() {
        let mut p = SensorPipeline::new();
        p.rates.motor = 100.0;
        let link = motor_link(5, 8);
        // local id 4 -> global 9, out of [5,8]
        p.dispatch(
            &link,
            Inbound::Motor { seq: 1, state: 0x24, velocity: 500, throttle: 0, consumption: 0 },
            0.0,
        );
        assert_eq!(p.motors, default_rotor_bank());
    }

    #[test]
    fn battery_level_distributes_energy_to_all_rotors() {
        let mut p = SensorPipeline::new();
        p.rates.battery = 1.0;
        let link = LinkMeta { device: None, motor_range: None };
        p.dispatch(&link, Inbound::Battery { seq: 1, level_mv: 15_000 }, 0.0);
        assert!((p.battery.level - 15.0).abs() < 1e-9);
        let expected = 100.0 * (15.0 - 14.0) / (16.8 - 14.0);
        for rotor in &p.motors {
            assert!((rotor.energy_level - expected).abs() < 1e-9);
        }
    }
}
