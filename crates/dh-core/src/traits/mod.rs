//! Transport abstractions

mod transport;

pub use transport::{CommandTransport, TransportFactory};
