//! Diff-based directory tree synchronization over an arbitrary packet
//! transport.
//!
//! One exchange makes a destination tree converge to a source tree. The
//! source walks its tree and announces every entry's metadata in walk order;
//! the destination diffs that announcement against its own tree, requests
//! content for the files that differ, and writes the streamed chunks to
//! disk. Entries are addressed by implicit sequential ids taken from
//! announcement order, so ids never travel with the metadata. The exchange
//! ends with a mutual `Fin` handshake.
//!
//! The endpoints are transport-agnostic: anything implementing
//! [`PacketStream`] works. [`FramedStream`] provides a length-prefixed
//! bincode framing over any byte duplex, and [`transport::loopback_pair`]
//! wires two of them together in memory.
//!
//! ```no_run
//! use treesync::{receive, send, transport::loopback_pair, WalkOptions};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (src_stream, dst_stream) = loopback_pair(64 * 1024);
//! let sender = tokio::spawn(send(src_stream, "/data/src", WalkOptions::default(), None));
//! receive(dst_stream, "/data/dst").await?;
//! sender.await??;
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod diff;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod walk;

pub use apply::DiskWriter;
pub use diff::{Change, ChangeHandler};
pub use error::ProtocolError;
pub use protocol::{receive, send, Packet, PacketStream, ProgressFn, SyncStream};
pub use transport::FramedStream;
pub use walk::{Entry, EntryKind, WalkOptions};
