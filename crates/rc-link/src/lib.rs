//! Serial link state machine, board handshake, and multi-link fan-in.

pub mod connection;
pub mod device;
mod error;
pub mod link;

pub use connection::{poll_fds, Connection, PollOutcome};
pub use device::{identify, DeviceKind, DeviceSpec, IdentifyError};
pub use error::LinkError;
pub use link::{Link, LinkMeta};

pub use rc_proto::MAX_ROTORS;
