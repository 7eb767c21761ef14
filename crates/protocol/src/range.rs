//! `Content-Range` / `Range` header helpers for resumable PUT uploads.
//!
//! A resume probe sends `Content-Range: bytes */<total>` with an empty body.
//! The storage endpoint answers `308` with `Range: bytes=0-<last>` where
//! `<last>` is the index of the last byte it holds.

/// Errors from parsing a `Range` response header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range header missing")]
    Missing,

    #[error("malformed range header: {0}")]
    Malformed(String),

    #[error("range does not start at byte 0: {0}")]
    NotFromZero(String),
}

/// Parses `bytes=0-<last>` and returns `<last>`, the last received byte index.
pub fn parse_range_header(value: &str) -> Result<u64, RangeError> {
    let trimmed = value.trim();
    let spec = trimmed
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Malformed(trimmed.to_string()))?;

    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(trimmed.to_string()))?;

    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| RangeError::Malformed(trimmed.to_string()))?;
    if start != 0 {
        return Err(RangeError::NotFromZero(trimmed.to_string()));
    }

    end.trim()
        .parse()
        .map_err(|_| RangeError::Malformed(trimmed.to_string()))
}

/// Formats the `Content-Range` value for a partial send of `start..=end`.
pub fn content_range(start: u64, end: u64, total: u64) -> String {
    format!("bytes {start}-{end}/{total}")
}

/// Formats the `Content-Range` value of a zero-length resume probe.
pub fn probe_content_range(total: u64) -> String {
    format!("bytes */{total}")
}
