//! Byte-stream transport abstraction for firmware transfer.
//!
//! Every link that can carry an update (USB-CDC serial, BLE GATT write/notify,
//! TCP) is reduced to the same small contract: open it, push bytes, pull
//! whatever bytes arrived within a timeout, and close it. Everything above
//! this crate is written against [`ByteStream`] only.
//!
//! Two implementations ship here:
//! - [`TcpTransport`] / [`TcpServer`] for devices reachable over the network
//! - [`MemoryStream`] for in-process loopback (tests, device emulation)

pub mod error;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use memory::MemoryStream;
pub use tcp::{TcpServer, TcpTransport};
pub use traits::ByteStream;
