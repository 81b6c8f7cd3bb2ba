//! Error types for framing, message decoding and the object directory

use crate::ids::{ObjectId, TemplateId};
use thiserror::Error;

/// Failures while moving a frame on or off the stream
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the 32767 byte limit")]
    TooLarge { len: usize },

    #[error("stream closed after {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },

    #[error("timed out waiting for frame data")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Transport errors end the connection; `TooLarge` only drops the frame
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::TooLarge { .. })
    }
}

/// A payload that does not decode into a known message
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message payload")]
    Empty,

    #[error("unknown message type {0}")]
    UnknownType(i8),

    #[error("message type {kind} truncated: needed {needed} bytes, got {got}")]
    Truncated { kind: i8, needed: usize, got: usize },
}

/// Errors raised while applying replication traffic to a directory
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("object {0} already exists")]
    DuplicateObjectId(ObjectId),

    #[error("object {0} does not exist")]
    UnknownObjectId(ObjectId),

    #[error("no template registered for {0}")]
    UnknownTemplate(TemplateId),

    #[error("object {object} rejected update: {source}")]
    Apply {
        object: ObjectId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
