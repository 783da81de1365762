use std::fmt;
use std::io;

use otalink_frame::FrameError;
use otalink_ota::{OtaError, TransferStatus};
use otalink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;
/// Interrupted by the operator (128 + SIGINT).
pub const ABORTED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => USAGE,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    let code = match &err {
        TransportError::Timeout(_) => TIMEOUT,
        TransportError::InvalidArg(_) => USAGE,
        _ => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Transport(err) => transport_error(context, err),
        FrameError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn ota_error(context: &str, err: OtaError) -> CliError {
    match err {
        OtaError::Transport(err) => transport_error(context, err),
        OtaError::Frame(err) => frame_error(context, err),
        OtaError::InvalidArg(_) => CliError::new(USAGE, format!("{context}: {err}")),
        OtaError::TimedOut { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        OtaError::LocallyAborted => CliError::new(ABORTED, format!("{context}: {err}")),
        OtaError::Rejected(status) | OtaError::RemoteAbort(status) => {
            CliError::new(status_code(status), format!("{context}: {err}"))
        }
        OtaError::Protocol { .. } | OtaError::UnknownMessage(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

/// Statuses that blame the image rather than the device.
fn status_code(status: TransferStatus) -> i32 {
    match status {
        TransferStatus::SizeMismatch
        | TransferStatus::OffsetMismatch
        | TransferStatus::VerifyFailed
        | TransferStatus::VersionError => DATA_INVALID,
        _ => FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn maps_transfer_outcomes_to_codes() {
        assert_eq!(ota_error("x", OtaError::LocallyAborted).code, ABORTED);
        assert_eq!(ota_error("x", OtaError::TimedOut { retries: 3 }).code, TIMEOUT);
        assert_eq!(
            ota_error("x", OtaError::Rejected(TransferStatus::VerifyFailed)).code,
            DATA_INVALID
        );
        assert_eq!(
            ota_error("x", OtaError::RemoteAbort(TransferStatus::FlashError)).code,
            FAILURE
        );
        assert_eq!(
            ota_error("x", OtaError::InvalidArg("empty".into())).code,
            USAGE
        );
    }

    #[test]
    fn unwraps_nested_transport_errors() {
        let err = OtaError::Frame(FrameError::Transport(TransportError::Disconnected));
        assert_eq!(ota_error("x", err).code, TRANSPORT_ERROR);
        let err = OtaError::Frame(FrameError::Timeout(Duration::from_secs(1)));
        assert_eq!(ota_error("x", err).code, TIMEOUT);
    }
}
