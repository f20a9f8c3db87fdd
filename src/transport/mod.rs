//! Transport parameters extension (RFC 9000 Sections 7.4, 18).

#![forbid(unsafe_code)]

pub mod parameters;

pub use parameters::TransportParameters;
