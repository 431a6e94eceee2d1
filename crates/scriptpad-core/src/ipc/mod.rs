//! Inter-process communication between the supervisor and its worker.
//!
//! The worker listens on a per-attempt Unix socket. The supervisor connects,
//! proves it spawned the worker by presenting the handshake token, and then
//! both sides exchange length-prefixed JSON frames over that one connection.

mod protocol;
mod transport;

pub use protocol::{
    Frame, MAX_FRAME_LEN, PROTOCOL_VERSION, Push, Request, Response, decode_frame, encode_frame,
    read_frame, write_frame,
};
pub use transport::{PushSender, Responder, RpcChannel, ServerChannel};

#[cfg(test)]
pub(crate) use transport::FrameReceiver;
