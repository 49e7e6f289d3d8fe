//! Interfaces to the external collaborators: message persistence, the point
//! ledger, and the device-registration directory.
//!
//! Each is a trait backed by a real store in production and an in-memory
//! implementation here for single-node use and tests.

pub mod devices;
pub mod ledger;
pub mod message;

pub use devices::{DeviceDirectory, MemoryDeviceDirectory, PushPayload};
pub use ledger::{MemoryPointLedger, PointLedger};
pub use message::{MemoryMessageStore, MessageStore};
