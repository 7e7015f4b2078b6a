//! The brokerage core: device registry, connection rendezvous, and relay.

pub mod registry;
pub mod relay;
pub mod rendezvous;

pub use registry::{Device, DeviceRegistry, RegisterError};
pub use relay::relay;
pub use rendezvous::{RendezvousTable, Ticket, WaitError, RENDEZVOUS_TIMEOUT};
