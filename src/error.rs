//! Error types shared across the crate.
//!
//! All of them are plain messages. Context is attached by wrapping them into [`exn::Exn`].

use std::path::{Path, PathBuf};

use derive_more::Display;
use tracing::debug;

/// A generic error with a human readable message.
#[derive(Debug, Display)]
pub struct ErrorMessage(String);

impl std::error::Error for ErrorMessage {}

impl ErrorMessage {
    /// Create a new message, which also gets logged for debugging.
    pub fn new(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug!("{msg}");
        Self(msg)
    }
}

/// The content of a file matched none of the known archive signatures.
#[derive(Debug, Display)]
#[display("no known archive signature in \"{}\"", _0.display())]
pub struct SniffIndeterminate(PathBuf);

impl std::error::Error for SniffIndeterminate {}

impl SniffIndeterminate {
    /// Create the error for the file at `path`.
    pub fn new(path: &Path) -> Self {
        Self(path.to_path_buf())
    }
}

/// An archive could not be extracted.
#[derive(Debug, Display)]
pub struct ExtractionError(String);

impl std::error::Error for ExtractionError {}

impl ExtractionError {
    /// Create a new extraction error from a message that already includes its cause.
    pub fn new(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug!("{msg}");
        Self(msg)
    }
}

/// An extracted tree could not be written into a new archive.
#[derive(Debug, Display)]
pub struct RepackError(String);

impl std::error::Error for RepackError {}

impl RepackError {
    /// Create a new repack error from a message that already includes its cause.
    pub fn new(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug!("{msg}");
        Self(msg)
    }
}

/// A failed input could not be copied into the `_failed` tree.
#[derive(Debug, Display)]
pub struct RelocationError(String);

impl std::error::Error for RelocationError {}

impl RelocationError {
    /// Create a new relocation error from a message that already includes its cause.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Describe a zip error, including the cause of I/O errors which its `Display` leaves out.
pub fn zip_cause(e: &zip::result::ZipError) -> String {
    match e {
        zip::result::ZipError::Io(io) => format!("{e}: {io}"),
        e => e.to_string(),
    }
}
