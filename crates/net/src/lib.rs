//! TCP transport for remote evaluation: the length-prefixed wire protocol,
//! the server-side consumer that hands work to connected clients, and the
//! long-running worker client.

mod client;
mod protocol;
mod server;

pub use client::{ClientError, ClientReport, StopReason, WorkerClient};
pub use protocol::{
    Handshake, MAX_FRAME_BYTES, Message, PROTOCOL_VERSION, ProtocolError, read_message,
    write_message,
};
pub use server::TcpServerConsumer;
