//! `rc-bridged`: the thin outer shell around `rc-core`. Parses a subcommand,
//! loads the serial topology from a TOML config, wires up tracing, and
//! drives a [`rc_core::Supervisor`] for the lifetime of the process. All the
//! actual control-plane logic lives in `rc-core`; this binary is a
//! development harness over its activity surface, nothing more.

mod cli;
mod config;

use std::process::ExitCode;

use clap::Parser;
use rc_core::types::SensorRates;
use rc_core::Supervisor;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::BridgeConfig;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_log::LogTracer::init().expect("tracing-log bridge installs once per process");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "rc-bridged exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = BridgeConfig::load(&cli.config).await?;
    let supervisor = Supervisor::new();

    match cli.command {
        Command::Run { no_start } => {
            open_configured_links(&supervisor, &config).await?;
            supervisor.spawn_tasks().await;
            if config.rates.imu > 0.0 || config.rates.mag > 0.0 || config.rates.motor > 0.0 || config.rates.battery > 0.0 {
                supervisor
                    .set_sensor_rate(SensorRates {
                        imu: config.rates.imu,
                        mag: config.rates.mag,
                        motor: config.rates.motor,
                        battery: config.rates.battery,
                    })
                    .await?;
            }
            supervisor.set_battery_limits(config.battery.min, config.battery.max).await?;
            if !no_start {
                supervisor.start(30.0).await?;
                tracing::info!("startup sequencer completed");
            }
            tracing::info!("running, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            supervisor.stop().await.ok();
            supervisor.shutdown().await;
        }
        Command::Connect { path, baud, imu, mag, motor_range } => {
            let idx = supervisor.connect(&path, baud, imu, mag, motor_range).await?;
            println!("opened link {idx} at {path}");
        }
        Command::Stop => {
            supervisor.stop().await?;
            println!("stopped");
        }
        Command::Velocity { values } => {
            supervisor.set_velocity(values).await?;
        }
        Command::Throttle { values } => {
            supervisor.set_throttle(values).await?;
        }
        Command::SetSensorRate { imu, mag, motor, battery } => {
            supervisor.set_sensor_rate(SensorRates { imu, mag, motor, battery }).await?;
        }
        Command::SetBatteryLimits { min, max } => {
            supervisor.set_battery_limits(min, max).await?;
        }
        Command::DisableMotor { id } => {
            supervisor.disable_motor(id).await?;
        }
        Command::EnableMotor { id } => {
            supervisor.enable_motor(id).await?;
        }
        Command::SetPid { motor, kp, ki, kd, f } => {
            supervisor.set_pid(motor, kp, ki, kd, f).await?;
        }
        Command::SetImuFilter { gyro_fc, accel_fc, mag_fc } => {
            supervisor.set_imu_filter(gyro_fc, accel_fc, mag_fc).await;
        }
        Command::GetImuFilter => {
            let (g, a, m) = supervisor.get_imu_filter().await;
            println!("gyro_fc={g} accel_fc={a} mag_fc={m}");
        }
        Command::SetZeroVelocity => {
            supervisor.set_zero_velocity().await;
        }
        Command::GetSensorAverage { seconds } => {
            let (imu, mag, battery) = supervisor.get_sensor_average(std::time::Duration::from_secs_f64(seconds)).await;
            println!("imu.accel={:?} imu.gyro={:?} mag={:?} battery={:.2}V", imu.accel, imu.gyro, mag.mag, battery.level);
        }
        Command::Log { path, decimation } => {
            supervisor.log(&path, decimation).await?;
            println!("logging to {path}");
        }
        Command::LogStop => {
            supervisor.log_stop().await;
        }
        Command::LogInfo => {
            match supervisor.log_info().await {
                Some(stats) => println!("written={} missed={}", stats.written, stats.missed),
                None => println!("no log active"),
            }
        }
    }

    Ok(())
}

async fn open_configured_links(supervisor: &Supervisor, config: &BridgeConfig) -> anyhow::Result<()> {
    for link in &config.links {
        supervisor
            .connect(&link.path, link.baud, link.imu, link.mag, link.motor_range)
            .await?;
    }
    Ok(())
}
