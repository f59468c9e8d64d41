pub mod config;
pub mod negotiation;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use signaling_proto as protocol;
