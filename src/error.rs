// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// The error taxonomy consumed across every module boundary. Each variant is
/// handled uniformly by its caller: `Io`/`Protocol`/`Timeout` put a
/// recording context into `Dead`, `StorageExhausted` stops the writer,
/// `NotFound`/`InvalidArgument` are returned verbatim to the HTTP caller.
#[derive(Debug, Error)]
pub enum RevereError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dumbdex has no free blocks")]
    StorageFull,

    #[error("Storage is full and the prune hook reclaimed no blocks")]
    StorageExhausted,

    #[error("RTSP/codec protocol error: {0}")]
    Protocol(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out waiting for samples (stalled > {0:?})")]
    Timeout(std::time::Duration),

    #[error("Storage file already exists: {0:?}")]
    AlreadyExists(std::path::PathBuf),

    #[error("Camera '{id}' not found")]
    CameraNotFound { id: String },

    #[error("Camera '{id}' connection failed: {reason}")]
    CameraConnection { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, RevereError>;
