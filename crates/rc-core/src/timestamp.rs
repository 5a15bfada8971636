//! Olson passive clock synchronization: turn an 8-bit sequence counter plus
//! a noisy arrival time into a monotonic, drift-compensated source
//! timestamp, with a smoothed measured rate alongside it.

/// A constant subtracted from wall-clock arrival times before any
/// arithmetic, and reintroduced when producing a public timestamp. Keeps
/// the millisecond-scale differences this algorithm cares about away from
/// the low bits of a `f64` holding a multi-billion-second Unix time.
pub const TIME_EPOCH_OFFSET: f64 = 1_700_000_000.0;

/// A public, wire-friendly timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn from_reduced_seconds(reduced: f64) -> Timestamp {
        let abs = reduced + TIME_EPOCH_OFFSET;
        let sec = abs.floor() as i64;
        let mut nsec = ((abs - sec as f64) * 1.0e9).round() as i64;
        let mut sec = sec;
        if nsec >= 1_000_000_000 {
            nsec -= 1_000_000_000;
            sec += 1;
        } else if nsec < 0 {
            nsec += 1_000_000_000;
            sec -= 1;
        }
        Timestamp { sec, nsec: nsec as u32 }
    }
}

/// Reduces a raw wall-clock time (seconds since `UNIX_EPOCH`) into the
/// internal coordinate system this module does its arithmetic in.
pub fn reduce(wall_seconds: f64) -> f64 {
    wall_seconds - TIME_EPOCH_OFFSET
}

/// Per-channel synchronization state.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTimer {
    seq: u8,
    last: f64,
    ts: f64,
    offset: f64,
    rmed: f64,
    rgain: f64,
    rerr: f64,
    lprate: f64,
    initialized: bool,
}

impl Default for ChannelTimer {
    fn default() -> Self {
        ChannelTimer {
            seq: 0,
            last: 0.0,
            ts: 0.0,
            offset: f64::NEG_INFINITY,
            rmed: 1.0,
            rgain: 0.01,
            rerr: 0.0,
            lprate: 0.0,
            initialized: false,
        }
    }
}

impl ChannelTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the offset estimator, forcing the next sample to re-sync
    /// cold. Used after a sensor-rate reconfiguration.
    pub fn reset_offset(&mut self) {
        self.offset = f64::NEG_INFINITY;
    }

    /// Returns the low-pass filtered measured rate, in Hz.
    pub fn measured_rate(&self) -> f64 {
        self.lprate
    }

    /// Decays the measured rate toward zero; called by the `main` task when
    /// a channel has gone quiet for a while.
    pub fn decay_rate(&mut self) {
        self.lprate = 0.0;
        self.rmed = self.rmed.max(0.01);
    }

    /// Feeds one arrival. `arrival` and the channel's internal state are
    /// both in the reduced coordinate system from [`reduce`]. `rate` is the
    /// channel's configured nominal rate in Hz (`0.0` if disabled).
    ///
    /// Returns the reconstructed source timestamp, in the same reduced
    /// coordinates.
    pub fn update(&mut self, seq: u8, arrival: f64, rate: f64) -> f64 {
        if !self.initialized {
            self.seq = seq;
            self.last = arrival;
            self.ts = arrival;
            self.lprate = rate;
            self.rmed = rate.max(0.01);
            self.initialized = true;
            return arrival;
        }

        let dt = arrival - self.last;
        if dt > 0.0 {
            let df = 1.0 / dt;
            self.rerr = if df > self.rmed {
                (3.0 * self.rerr + 1.0) / 4.0
            } else {
                (3.0 * self.rerr - 1.0) / 4.0
            };
            self.rgain = if self.rerr.abs() > 0.75 { self.rgain * 2.0 } else { self.rgain / 2.0 };
            self.rgain = self.rgain.max(0.01);
            self.rmed += if df > self.rmed { self.rgain } else { -self.rgain };
            self.lprate += 0.1 * (self.rmed - self.lprate);
        }

        let ds = seq.wrapping_sub(self.seq) as u32;
        if ds > 16 {
            self.offset = f64::NEG_INFINITY;
        } else if rate > 0.1 {
            self.offset -= 0.001 * ds as f64 / rate;
        } else {
            self.offset = 0.0;
        }

        self.last = arrival;
        self.seq = seq;
        if rate > 0.1 {
            self.ts += ds as f64 / rate;
        } else {
            self.ts = arrival;
        }

        if self.ts - arrival > self.offset {
            self.offset = self.ts - arrival;
        }

        let a = if arrival - (self.ts - self.offset) > 0.005 {
            self.offset = self.ts - arrival;
            arrival
        } else {
            self.ts - self.offset
        };
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_is_non_decreasing_for_steady_stream() {
        let mut timer = ChannelTimer::new();
        let mut prev = timer.update(0, 0.0, 1000.0);
        for s in 1u8..=17 {
            let arrival = s as f64 * 0.001;
            let ts = timer.update(s, arrival, 1000.0);
            assert!(ts >= prev - 1e-9, "ts went backward: {ts} < {prev}");
            prev = ts;
        }
    }

    #[test]
    fn large_gap_resets_offset_but_never_goes_backward() {
        let mut timer = ChannelTimer::new();
        let mut prev = timer.update(0, 0.0, 1000.0);
        for s in 1u8..=17 {
            prev = timer.update(s, s as f64 * 0.001, 1000.0);
        }
        // drop 20 frames: resume at seq 38, long after the last arrival.
        let resumed = timer.update(38, 0.058, 1000.0);
        assert!(resumed >= prev - 1e-9);
        let next = timer.update(39, 0.059, 1000.0);
        assert!(next >= resumed - 1e-9);
    }

    #[test]
    fn low_rate_channel_uses_arrival_time_directly() {
        let mut timer = ChannelTimer::new();
        timer.update(0, 10.0, 0.05);
        let ts = timer.update(1, 25.0, 0.05);
        assert_eq!(ts, 25.0);
    }
}
