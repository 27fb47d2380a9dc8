//! Protocol-contract errors.
//!
//! These indicate the two endpoints have desynchronized. They are always
//! fatal to the exchange: the transfer tables cannot be resumed once an id
//! has been consumed or skipped.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A `Req` arrived for an id that was never announced as a regular file,
    /// or whose content was already requested.
    #[error("invalid file id {0}")]
    InvalidFileId(u32),

    /// A content fetch was requested for a path with no pending id.
    #[error("invalid file request {0}")]
    InvalidFileRequest(String),

    /// A `Data` chunk arrived for an id with no open sink.
    #[error("no open sink for file id {0}")]
    StrayData(u32),
}
