//! Core domain types for the tusk resumable upload engine.
//!
//! This crate defines the data model shared by the other crates:
//! - The persisted upload record and its committed part list
//! - The public file descriptor handed to protocol front ends
//! - Upload length parsing and validation
//! - Pluggable upload identifier naming
//! - Configuration

pub mod config;
pub mod error;
pub mod naming;
pub mod upload;

pub use error::{Error, Result};
pub use naming::{Namer, NamingError, UuidNamer};
pub use upload::{CompletedPart, UploadFile, UploadInfo, UploadStatus, parse_upload_length};

/// Default size of a committed part: 5 MiB.
///
/// This is also the S3 minimum for every part except the last.
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest single part a backend accepts: 5 GiB.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Suffix appended to an upload identifier to address its metadata sidecar.
pub const INFO_SUFFIX: &str = ".info";

/// Key of the metadata sidecar for an upload.
pub fn info_key(id: &str) -> String {
    format!("{id}{INFO_SUFFIX}")
}
