//! Command surface for the `rc-bridged` development harness. Mirrors the
//! `Supervisor` activity surface one-to-one; this binary does no work of
//! its own beyond parsing, loading config, and dispatching.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rc-bridged", about = "Onboard control-plane bridge to a multirotor flight board")]
pub struct Cli {
    /// Path to a TOML config describing the serial links to open at startup.
    #[arg(short, long, default_value = "rc-bridged.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the links named in the config, run the startup sequencer, then
    /// idle until interrupted (Ctrl+C) while `comm`/`main` keep running.
    Run {
        /// Skip the startup sequencer and go straight to idling.
        #[arg(long)]
        no_start: bool,
    },
    /// Open one additional link outside the config file.
    Connect {
        path: String,
        #[arg(long, default_value_t = 115_200)]
        baud: u32,
        #[arg(long)]
        imu: bool,
        #[arg(long)]
        mag: bool,
        #[arg(long, value_parser = parse_range)]
        motor_range: Option<(u8, u8)>,
    },
    /// Broadcast an immediate emergency stop and wait for confirmation.
    Stop,
    /// Drive rotors by fractional velocity, one value per configured rotor.
    Velocity { values: Vec<f64> },
    /// Drive rotors by fractional throttle, one value per configured rotor.
    Throttle { values: Vec<f64> },
    SetSensorRate {
        #[arg(long, default_value_t = 0.0)]
        imu: f64,
        #[arg(long, default_value_t = 0.0)]
        mag: f64,
        #[arg(long, default_value_t = 0.0)]
        motor: f64,
        #[arg(long, default_value_t = 0.0)]
        battery: f64,
    },
    SetBatteryLimits { min: f64, max: f64 },
    DisableMotor { id: u8 },
    EnableMotor { id: u8 },
    SetPid { motor: u8, kp: f64, ki: f64, kd: f64, f: f64 },
    SetImuFilter { gyro_fc: f64, accel_fc: f64, mag_fc: f64 },
    GetImuFilter,
    SetZeroVelocity,
    /// Average live sensor samples for `seconds` and print the result.
    GetSensorAverage {
        #[arg(long, default_value_t = 1.0)]
        seconds: f64,
    },
    /// Start writing a decimated log to `path`.
    Log {
        path: String,
        #[arg(long, default_value_t = 1)]
        decimation: u32,
    },
    LogStop,
    LogInfo,
}

fn parse_range(s: &str) -> Result<(u8, u8), String> {
    let (lo, hi) = s.split_once('-').ok_or_else(|| format!("expected MIN-MAX, got {s:?}"))?;
    let lo: u8 = lo.parse().map_err(|_| format!("bad lower bound in {s:?}"))?;
    let hi: u8 = hi.parse().map_err(|_| format!("bad upper bound in {s:?}"))?;
    Ok((lo, hi))
}
