//! Upload records, descriptors and length parsing.

use serde::{Deserialize, Serialize};

/// A part already committed to the backend.
///
/// The tag is opaque and must be handed back verbatim when the multipart
/// session is completed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    /// Backend-assigned part tag (the S3 ETag).
    pub etag: String,
}

/// The durable record of an in-progress upload.
///
/// Persisted as the `<id>.info` sidecar. The identifier itself is the key of
/// the record and is not repeated inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Backend multipart session id, fixed at creation.
    pub backend_session_id: String,
    /// Declared final length; `None` while the length is deferred.
    pub total_length: Option<u64>,
    /// Bytes durably committed to the backend.
    pub offset: u64,
    /// Opaque client metadata.
    pub metadata: Option<String>,
    /// Whether the length was unknown at creation and is still outstanding.
    pub defer_length: bool,
    /// Number of committed parts.
    pub part_count: u32,
    /// Committed parts in part-number order.
    pub parts: Vec<CompletedPart>,
}

impl UploadInfo {
    /// Create the initial record for a freshly opened backend session.
    pub fn new(
        backend_session_id: impl Into<String>,
        total_length: Option<u64>,
        metadata: Option<String>,
    ) -> Self {
        Self {
            backend_session_id: backend_session_id.into(),
            total_length,
            offset: 0,
            metadata,
            defer_length: total_length.is_none(),
            part_count: 0,
            parts: Vec::new(),
        }
    }

    /// Part number the next committed part will carry.
    pub fn next_part_number(&self) -> u32 {
        self.part_count + 1
    }

    /// Record a part of `size` bytes as committed and return its number.
    pub fn record_part(&mut self, etag: impl Into<String>, size: u64) -> u32 {
        let part_number = self.next_part_number();
        self.parts.push(CompletedPart {
            part_number,
            etag: etag.into(),
        });
        self.part_count = part_number;
        self.offset += size;
        part_number
    }

    /// Whether every declared byte has been committed.
    pub fn is_complete(&self) -> bool {
        self.total_length == Some(self.offset)
    }

    /// Public descriptor for this upload.
    pub fn to_file(&self, id: &str) -> UploadFile {
        UploadFile {
            id: id.to_string(),
            length: self.total_length,
            defer_length: self.defer_length,
            metadata: self.metadata.clone(),
        }
    }
}

/// Public description of an upload, safe to hand to clients and subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    /// Upload identifier.
    pub id: String,
    /// Declared length, if known.
    pub length: Option<u64>,
    /// Whether the length is still deferred.
    pub defer_length: bool,
    /// Opaque client metadata.
    pub metadata: Option<String>,
}

/// Resume position of an upload as reported to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    /// The upload this status describes.
    #[serde(flatten)]
    pub file: UploadFile,
    /// Bytes received so far: committed plus buffered.
    pub offset: u64,
}

/// Resolve the declared length of a new upload.
///
/// A concrete length wins over the defer flag. Without either the request is
/// rejected, as is any value that is not a plain non-negative decimal integer.
pub fn parse_upload_length(
    upload_length: Option<&str>,
    defer_length: bool,
) -> crate::Result<Option<u64>> {
    match upload_length {
        Some(raw) => parse_length_value(raw).map(Some),
        None if defer_length => Ok(None),
        None => Err(crate::Error::InvalidLength(
            "either an upload length or the defer-length flag is required".to_string(),
        )),
    }
}

/// Parse a single length value such as an `Upload-Length` header.
pub fn parse_length_value(raw: &str) -> crate::Result<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(crate::Error::InvalidLength(format!(
            "not a non-negative integer: {raw:?}"
        )));
    }
    trimmed
        .parse::<u64>()
        .map_err(|e| crate::Error::InvalidLength(format!("{raw:?}: {e}")))
}
