//! # quicore: QUIC transport endpoint core
//!
//! A sans-I/O implementation of the QUIC transport state machine
//! (RFC 9000) and its loss detection and congestion control (RFC 9002):
//! the frame codec, per-stream reassembly and flow control, packet-number
//! accounting, ACK generation and consumption, RTT estimation, NewReno
//! congestion control, and the connection/stream lifecycle.
//!
//! ## What lives elsewhere
//!
//! The TLS handshake engine (consumed through [`connection::HandshakeDriver`]),
//! UDP sockets, and packet header parsing/protection are collaborators, not
//! residents: packets arrive here as already-authenticated plaintext payloads
//! tagged with their epoch and packet number, and leave the same way.
//!
//! ## Shape
//!
//! ```text
//! quicore/
//! ├── error        - transport error codes
//! ├── types        - ids, epochs, time, protocol constants
//! ├── varint       - variable-length integer codec
//! ├── diet         - discontinuous interval sets
//! ├── frames       - frame types, parsing, serialization
//! ├── packet       - sent-packet metadata, packet number spaces
//! ├── stream       - send/recv buffers, reassembly, stream table
//! ├── flow_control - connection/stream windows
//! ├── recovery     - RTT, loss detection, NewReno
//! ├── transport    - transport parameters extension
//! └── connection   - the connection state machine
//! ```
//!
//! ## Driving a connection
//!
//! The embedding event loop owns the sockets and the clock:
//!
//! ```rust,ignore
//! let mut conn = Connection::new_client(scid, dcid, config, tls);
//! loop {
//!     while let Some(pkt) = conn.poll_transmit(now) { /* seal + send */ }
//!     match wait(conn.next_timeout()) {
//!         Io(payload) => conn.recv(payload)?,
//!         Timer(now) => conn.handle_timeout(now),
//!     }
//!     while let Some(event) = conn.poll_event() { /* wake the app */ }
//! }
//! ```

#![forbid(unsafe_code)]

pub mod connection;
pub mod diet;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod stream;
pub mod transport;
pub mod types;
pub mod varint;

pub use connection::{
    CloseReason, Connection, ConnectionConfig, ConnectionEvent, ConnectionState, ConnectionStats,
    HandshakeDriver, PacketInput, PacketOutput, StubHandshake, TlsEvent,
};
pub use diet::Diet;
pub use error::{Error, Result};
pub use frames::{Frame, FrameIter, FrameSerializer};
pub use packet::PacketNumberSpace;
pub use recovery::Recovery;
pub use stream::{RecvStream, SendStream, StreamState};
pub use transport::TransportParameters;
pub use types::{ConnectionId, EcnCodepoint, Epoch, Instant, Side, StreamId};
