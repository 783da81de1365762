use otalink_frame::FrameError;
use otalink_transport::TransportError;

use crate::flash::FlashError;
use crate::message::TransferStatus;

/// Errors from the transfer protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    /// A message payload was too short or internally inconsistent.
    #[error("malformed {kind} message: {reason}")]
    Protocol {
        kind: &'static str,
        reason: &'static str,
    },

    /// A frame carried a type byte that is not a transfer message.
    #[error("unknown message type 0x{0:02X}")]
    UnknownMessage(u8),

    /// The caller passed something the protocol cannot carry.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The receiver answered with a failure status.
    #[error("receiver rejected transfer: {0}")]
    Rejected(TransferStatus),

    /// The receiver aborted the session.
    #[error("receiver aborted transfer: {0}")]
    RemoteAbort(TransferStatus),

    /// No acknowledgement after exhausting the retry budget.
    #[error("no response after {retries} retries")]
    TimedOut { retries: u32 },

    /// The local caller cancelled the transfer.
    #[error("transfer cancelled locally")]
    LocallyAborted,

    /// Slot storage failed.
    #[error(transparent)]
    Flash(#[from] FlashError),

    /// Framing failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The byte stream failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OtaError {
    pub(crate) fn protocol(kind: &'static str, reason: &'static str) -> Self {
        OtaError::Protocol { kind, reason }
    }

    /// Lift a framing error, keeping transport failures distinguishable.
    pub(crate) fn from_frame(err: FrameError) -> Self {
        match err {
            FrameError::Transport(err) => OtaError::Transport(err),
            other => OtaError::Frame(other),
        }
    }

    /// True when the peer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            OtaError::Transport(TransportError::Disconnected)
                | OtaError::Frame(FrameError::Transport(TransportError::Disconnected))
        )
    }

    /// The status reported by the receiver, if this error carries one.
    pub fn status(&self) -> Option<TransferStatus> {
        match self {
            OtaError::Rejected(status) | OtaError::RemoteAbort(status) => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OtaError>;
