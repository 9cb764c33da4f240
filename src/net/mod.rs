//! Network helpers shared by telemetry reporting

pub mod ip;

pub use ip::{classify, IpClass, IpKind, IpVersion};
