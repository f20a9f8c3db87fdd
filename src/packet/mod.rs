//! Packet metadata and packet-number-space accounting (RFC 9000 Sections
//! 12.3, 13).

#![forbid(unsafe_code)]

pub mod meta;
pub mod space;

pub use meta::{RetransmitFrame, SentPacket};
pub use space::PacketNumberSpace;
