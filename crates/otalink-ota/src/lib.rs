//! Chunked over-the-air firmware transfer.
//!
//! The host side ([`Orchestrator`]) streams an image as Begin, Data and End
//! messages and waits for an Ack to each one. The device side ([`Receiver`])
//! decodes frames and hands them to an [`Installer`], which writes into the
//! inactive slot of a dual-slot [`FlashSlots`] store and verifies the image
//! before marking it for a trial boot.

pub mod error;
pub mod flash;
pub mod installer;
pub mod message;
pub mod orchestrator;
pub mod receiver;
pub mod version;

pub use error::{OtaError, Result};
pub use flash::{BootState, FlashError, FlashSlots, MemoryFlash, SlotId};
pub use installer::{
    InstallSnapshot, Installed, Installer, InstallerConfig, Reply, SessionToken,
    DEFAULT_MAX_FIRMWARE_SIZE,
};
pub use message::{
    Ack, Begin, DataChunk, Message, MsgType, TransferStatus, MAX_CHUNK, MAX_DATA_LEN,
    MAX_VERSION_LEN, SHA256_SIZE,
};
pub use orchestrator::{
    hex, CancelHandle, ChunkPolicy, Orchestrator, SessionSnapshot, TransferConfig,
    TransferEvent, TransferOutcome, TransferState,
};
pub use receiver::{
    AbortHandle, AbortOrigin, NoWatchdog, Receiver, ReceiverConfig, ReceiverEvent, RunExit,
    StopHandle, Watchdog,
};
pub use version::{FirmwareVersion, ParseVersionError};
