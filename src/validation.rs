use thiserror::Error;

use crate::bulk::DocWriteRequest;

/// Longest allowed index name, in bytes
pub const MAX_INDEX_NAME_BYTES: usize = 255;

/// Longest allowed document id, in bytes
pub const MAX_ID_BYTES: usize = 512;

const INVALID_INDEX_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];

/// Why a write request was refused before reaching the queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    #[error("invalid index name [{name}], {reason}")]
    IndexName { name: String, reason: String },

    #[error("document id must not be empty")]
    EmptyId,

    #[error("document id is {0} bytes, longer than 512")]
    IdTooLong(usize),
}

/// Provides index name validation functionality
pub struct IndexNameValidator;

impl IndexNameValidator {
    /// Creates a new IndexNameValidator instance
    pub fn new() -> Self {
        Self {}
    }

    /// Checks an index name, returning the first rule it breaks
    ///
    /// This function checks that the name:
    /// - Is not empty and not `.` or `..`
    /// - Does not exceed 255 bytes
    /// - Is all lowercase
    /// - Does not start with `_`, `-` or `+`
    /// - Contains none of `\ / * ? " < > | , # :` or spaces
    pub fn check(&self, name: &str) -> Option<&'static str> {
        if name.is_empty() {
            return Some("must not be empty");
        }
        if name == "." || name == ".." {
            return Some("must not be '.' or '..'");
        }
        if name.len() > MAX_INDEX_NAME_BYTES {
            return Some("index name is too long");
        }
        if name.chars().any(char::is_uppercase) {
            return Some("must be lowercase");
        }
        if name.starts_with(['_', '-', '+']) {
            return Some("must not start with '_', '-', or '+'");
        }
        if name.contains(INVALID_INDEX_CHARS) {
            return Some("must not contain the characters \\ / * ? \" < > | , # : or space");
        }
        None
    }

    pub fn is_valid(&self, name: &str) -> bool {
        self.check(name).is_none()
    }
}

impl Default for IndexNameValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates a write request's index name and id
pub fn validate_request(request: &DocWriteRequest) -> Result<(), InvalidRequest> {
    let validator = IndexNameValidator::new();
    let name = request.index_name();

    if let Some(reason) = validator.check(name) {
        return Err(InvalidRequest::IndexName {
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }

    if let Some(id) = request.id() {
        if id.is_empty() {
            return Err(InvalidRequest::EmptyId);
        }
        if id.len() > MAX_ID_BYTES {
            return Err(InvalidRequest::IdTooLong(id.len()));
        }
    }

    Ok(())
}
