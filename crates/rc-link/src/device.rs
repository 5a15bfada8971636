//! Known flight-board variants.
//!
//! Replaces the original sentinel-terminated device table with an explicit
//! sum type: unsupported hardware is `None` from [`identify`], not a null
//! row.

/// A known flight-board model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Mkbl,
    Mkfl,
    Flymu,
    Chimera,
    Teensy,
}

/// Per-model static characteristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSpec {
    /// Identity-string prefix this model's firmware reports, e.g. `"chimera"`.
    pub prefix: &'static str,
    /// Minimum accepted firmware revision.
    pub min_rev: f64,
    /// Gyroscope LSB resolution, rad/s per count.
    pub gyro_res: f64,
    /// Accelerometer LSB resolution, m/s^2 per count.
    pub accel_res: f64,
    /// Magnetometer LSB resolution, tesla per count.
    pub mag_res: f64,
    /// Temperature resolution (deg C per count) and offset (deg C), if the
    /// model reports temperature.
    pub temp: Option<(f64, f64)>,
    /// Whether this model accepts `set_pid`.
    pub supports_pid: bool,
}

const DEVICE_TABLE: &[(DeviceKind, DeviceSpec)] = &[
    (
        DeviceKind::Mkbl,
        DeviceSpec {
            prefix: "mkbl",
            min_rev: 1.0,
            gyro_res: 0.0015,
            accel_res: 0.0024,
            mag_res: 0.00000015,
            temp: None,
            supports_pid: false,
        },
    ),
    (
        DeviceKind::Mkfl,
        DeviceSpec {
            prefix: "mkfl",
            min_rev: 1.0,
            gyro_res: 0.0015,
            accel_res: 0.0024,
            mag_res: 0.00000015,
            temp: None,
            supports_pid: false,
        },
    ),
    (
        DeviceKind::Flymu,
        DeviceSpec {
            prefix: "flymu",
            min_rev: 1.0,
            gyro_res: 0.00106,
            accel_res: 0.00239,
            mag_res: 0.00000015,
            temp: None,
            supports_pid: false,
        },
    ),
    (
        DeviceKind::Chimera,
        DeviceSpec {
            prefix: "chimera",
            min_rev: 1.1,
            gyro_res: 0.00106,
            accel_res: 0.00239,
            mag_res: 0.00000015,
            temp: Some((0.01, 0.0)),
            supports_pid: false,
        },
    ),
    (
        DeviceKind::Teensy,
        DeviceSpec {
            prefix: "teensy",
            min_rev: 1.0,
            gyro_res: 0.00106,
            accel_res: 0.00239,
            mag_res: 0.00000015,
            temp: None,
            supports_pid: true,
        },
    ),
];

/// Errors from [`identify`].
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifyError {
    /// No entry's prefix matched the identity string.
    NoMatch,
    /// A prefix matched but the revision suffix did not parse as a number.
    BadRevision,
    /// A prefix matched, but the reported firmware is older than the
    /// minimum accepted revision.
    TooOld { min_rev: f64, got: f64 },
}

/// Parses a board identity string of the form `<prefix><revision>`
/// (e.g. `"chimera1.1"`) against the known device table.
pub fn identify(identity: &str) -> Result<(DeviceKind, DeviceSpec, f64), IdentifyError> {
    let lower = identity.to_ascii_lowercase();
    let (kind, spec) = DEVICE_TABLE
        .iter()
        .find(|(_, spec)| lower.starts_with(spec.prefix))
        .ok_or(IdentifyError::NoMatch)?;

    let rev_str = &lower[spec.prefix.len()..];
    let rev: f64 = rev_str.trim().parse().map_err(|_| IdentifyError::BadRevision)?;

    if rev < spec.min_rev {
        return Err(IdentifyError::TooOld { min_rev: spec.min_rev, got: rev });
    }

    Ok((*kind, *spec, rev))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chimera_accepted_at_minimum_revision() {
        let (kind, _, rev) = identify("chimera1.1").unwrap();
        assert_eq!(kind, DeviceKind::Chimera);
        assert_eq!(rev, 1.1);
    }

    #[test]
    fn chimera_rejected_below_minimum_revision() {
        let err = identify("chimera1.0").unwrap_err();
        assert_eq!(err, IdentifyError::TooOld { min_rev: 1.1, got: 1.0 });
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        assert_eq!(identify("widget3.0").unwrap_err(), IdentifyError::NoMatch);
    }

    #[test]
    fn teensy_is_the_only_pid_capable_device() {
        for (kind, spec) in DEVICE_TABLE {
            assert_eq!(spec.supports_pid, *kind == DeviceKind::Teensy);
        }
    }
}
