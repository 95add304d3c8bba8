//! The protocol stages, bottom to top.
//!
//! ```text
//! SocketStage ─ FramingStage ─ handshake → CipherStage ─ TunnelStage
//! ```

mod cipher;
mod framing;
mod handshake;
mod packet;
mod socket;
mod tunnel;

pub use cipher::CipherStage;
pub use framing::{encode_frame, FramingStage, Reassembler, LENGTH_PREFIX_SIZE};
pub use handshake::{ClientHandshake, ServerHandshake, CLIENT_MAX_SKEW_MS, SERVER_MAX_SKEW_MS};
pub use packet::{HandshakePacket, HEADER_SIZE, PACKET_VERSION};
pub use socket::{listen, Endpoint, EndpointStage, Facing, SocketIo, SocketStage, READ_BUFFER_SIZE};
pub use tunnel::{IndexStage, Role, StageFactory, StreamKey, TunnelStage, STREAM_KEY_SIZE};
