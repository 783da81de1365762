//! Fail-safe over-the-air firmware transfer.
//!
//! otalink moves a firmware image over an unreliable byte stream and installs
//! it into the inactive slot of an A/B flash layout, so a device never ends
//! up without a bootable image.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream abstraction (TCP, in-memory)
//! - [`frame`]: start-marker + CRC32 framing with resynchronization
//! - [`ota`]: transfer messages, installer, receiver task and orchestrator

/// Re-export transport types.
pub mod transport {
    pub use otalink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use otalink_frame::*;
}

/// Re-export transfer protocol types.
pub mod ota {
    pub use otalink_ota::*;
}
