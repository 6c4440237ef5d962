//! RTMP: handshake, chunk-stream framing, AMF0 commands, and the
//! `connect`→`createStream`→`publish`|`play` server/client state machines.
//!
//! Grounded in `format/rtmp/rtmp.go` and its handshake/`amf`/chunk-io
//! helpers. The original's single `Conn` handling either direction is split
//! here into a server half (`conn`, driven by [`conn::listen_and_serve`])
//! and a client half (`client`, dial-out `play`/`publish`) since the two
//! sides' state machines share the wire layer but little else.

pub mod amf0;
pub mod chunk;
pub mod client;
pub mod conn;
pub mod flv_bridge;
pub mod handshake;

pub use conn::{listen_and_serve, listen_single_publisher, serve, PublishReceiver, Registry};
