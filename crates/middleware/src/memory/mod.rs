//! In-memory broker for tests and local runs
pub mod transport;

pub use transport::{BrokerCall, InMemoryTransport};
