use thiserror::Error;

/// Every way a core operation can fail, matching the structured error kinds
/// the activity surface is required to report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("argument out of range: {0}")]
    Range(String),

    #[error("system error ({context}): {source}")]
    Sys {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad device: {0}")]
    BadDevice(String),

    #[error("no open connection")]
    Connection,

    #[error("rotor {0} reports emergency stop")]
    RotorFailure(u8),

    #[error("rotor {0} stopped unexpectedly")]
    RotorStopped(u8),

    #[error("rotor {0} is spinning but was expected to be disabled")]
    RotorNotDisabled(u8),

    #[error("sensor rate undersampled: {0}")]
    Rate(String),

    #[error("rotor is already spinning")]
    Started,

    #[error("no valid servo input within watchdog timeout")]
    Input,
}

impl From<rc_link::LinkError> for Error {
    fn from(e: rc_link::LinkError) -> Self {
        match e {
            rc_link::LinkError::Io { path, source } => Error::Sys { context: path, source },
            rc_link::LinkError::NoReply { path, attempts } => {
                Error::BadDevice(format!("{path}: no identity reply after {attempts} attempts"))
            }
            rc_link::LinkError::BadDevice { path, reason } => {
                Error::BadDevice(format!("{path}: {reason}"))
            }
            rc_link::LinkError::AlreadyOpen { path, other_path } => {
                Error::BadDevice(format!("{path}: already open as {other_path}"))
            }
        }
    }
}
