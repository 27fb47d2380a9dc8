//! Sync protocol: packet model, stream abstraction and the two endpoint
//! state machines.

mod packet;
mod receiver;
mod sender;
mod stream;

pub use packet::Packet;
pub use receiver::receive;
pub use sender::{send, ProgressFn, COPY_BUF_SIZE};
pub use stream::{PacketStream, SyncStream};
