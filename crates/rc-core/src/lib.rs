//! Timestamping, calibration/filtering, sensor pipeline, control plane,
//! servo loop, and the `Supervisor` that ties them together into the
//! onboard control-plane bridge for a serial-connected multirotor board.
//!
//! This crate owns everything spec'd as the system's core: the Olson
//! passive clock sync, the per-axis calibration + IIR filter, rotor
//! lifecycle and emergency handling, the startup sequencer, and the two
//! cooperative periodic tasks (`comm`, `main`) plus activity surface the
//! `Supervisor` exposes. Wire framing lives in `rc_proto`; device
//! handshake and the open file descriptor live in `rc_link`.

pub mod calibration;
pub mod control;
mod error;
pub mod filter;
pub mod logger;
pub mod pipeline;
pub mod servo;
pub mod supervisor;
pub mod timestamp;
pub mod types;

pub use control::ControlPlane;
pub use error::Error;
pub use pipeline::SensorPipeline;
pub use servo::{ControlInput, ServoFault, ServoLoop, ServoOutcome, StartupOutcome, StartupSequencer, CONTROL_PERIOD_MS};
pub use supervisor::{Supervisor, SystemState};
pub use timestamp::{ChannelTimer, Timestamp};

pub use rc_proto::MAX_ROTORS;
