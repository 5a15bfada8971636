use thiserror::Error;

use crate::device::IdentifyError;

/// Failures opening or operating a [`crate::link::Link`].
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: handshake failed, no identity reply after {attempts} attempts")]
    NoReply { path: String, attempts: u32 },
    #[error("{path}: unrecognized or rejected device ({reason})")]
    BadDevice { path: String, reason: String },
    #[error("{path}: already open as {other_path}")]
    AlreadyOpen { path: String, other_path: String },
}

impl From<IdentifyError> for String {
    fn from(e: IdentifyError) -> Self {
        match e {
            IdentifyError::NoMatch => "no device table entry matches identity string".into(),
            IdentifyError::BadRevision => "identity string has an unparsable revision".into(),
            IdentifyError::TooOld { min_rev, got } => {
                format!("firmware revision {got} is older than minimum required {min_rev}")
            }
        }
    }
}
