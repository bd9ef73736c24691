//! Client-server communication protocol.
//!
//! This module defines the wire protocol spoken between MaazDB clients and servers: the
//! message bodies, the frame envelope that carries them, and a transport that moves whole
//! frames over any duplex byte stream.
//!
//! # Overview
//!
//! A client opens a stream, sends a [`Request::Handshake`] carrying its credentials and waits
//! for [`Response::HandshakeAccepted`]. Afterwards every [`Command`] carries a correlation id
//! and the server answers each one with a [`Reply`] bearing the same id. Replies may arrive in
//! any order, which lets one connection carry many outstanding queries.
//!
//! # Key Components
//!
//! - [`Command`] / [`Request`]: what the client sends.
//! - [`Reply`] / [`Response`]: what the server sends back, including typed [`Value`]s.
//! - [`codec`]: frame layout, encode/decode and streaming reassembly.
//! - [`ProtocolTransport`]: frame-level reads and writes over a [`Stream`].
//! - [`TlsStream`]: TLS 1.3 over TCP, usable as a [`Stream`] like a plain socket.
//!
//! # Binary Format
//!
//! - Each frame begins with a 13 byte header: payload length, correlation id and frame kind.
//! - The payload is a bincode-encoded message body.
//! - All integers are big-endian and fixed width.
//!
//! # See Also
//!
//! - [`client`](crate::client): Uses this module to talk to a server.
//! - [`server`](crate::server): The mock server speaking the same protocol.
pub mod codec;
mod request;
mod response;
mod tls;
mod transport;

pub use codec::{CodecError, Decoded, Frame, FrameBuffer, FrameKind};
pub use request::{Command, CorrelationId, CONTROL_ID, Request};
pub use response::{ErrorCode, Reply, Response, Row, RowSet, Value};
pub use tls::{TlsOptions, TlsStream, load_certificates, load_private_key, server_config};
pub use transport::{NetworkStream, ProtocolTransport, Stream, TransportError};
