use std::path::Path;

use skyhaul_protocol::constants::FALLBACK_CONTENT_TYPE;

use crate::TransferError;

/// Validates a submitted source file and returns its size in bytes.
///
/// Rejects:
/// - URL-like sources (`scheme://...`), which are not local files
/// - Paths that do not exist
/// - Anything that is not a regular file
pub fn validate_source(path: &Path) -> Result<u64, TransferError> {
    let display = path.to_string_lossy();
    if display.is_empty() {
        return Err(TransferError::SourceMissing("empty path".into()));
    }
    if display.contains("://") {
        return Err(TransferError::NotLocal(display.into_owned()));
    }

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::SourceMissing(display.into_owned()));
        }
        Err(e) => return Err(TransferError::Io(e)),
    };

    if !metadata.is_file() {
        return Err(TransferError::NotLocal(format!(
            "not a regular file: {display}"
        )));
    }

    Ok(metadata.len())
}

/// Maps a media file extension to its MIME content type.
pub fn detect_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("heic") => "image/heic",
        Some("webp") => "image/webp",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("wav") => "audio/wav",
        _ => FALLBACK_CONTENT_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"1234").unwrap();
        assert_eq!(validate_source(&path).unwrap(), 4);
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_source(&dir.path().join("gone.mp4")).unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));
    }

    #[test]
    fn rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_source(dir.path()).unwrap_err();
        assert!(matches!(err, TransferError::NotLocal(_)));
    }

    #[test]
    fn rejects_remote_url() {
        let err = validate_source(Path::new("https://example.com/clip.mp4")).unwrap_err();
        assert!(matches!(err, TransferError::NotLocal(_)));
    }

    #[test]
    fn rejects_empty_path() {
        assert!(validate_source(Path::new("")).is_err());
    }

    #[test]
    fn detect_content_type_known() {
        assert_eq!(detect_content_type(Path::new("a.mp4")), "video/mp4");
        assert_eq!(detect_content_type(Path::new("a.MOV")), "video/quicktime");
        assert_eq!(detect_content_type(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(detect_content_type(Path::new("a.m4a")), "audio/mp4");
    }

    #[test]
    fn detect_content_type_unknown() {
        assert_eq!(detect_content_type(Path::new("a.pdf")), FALLBACK_CONTENT_TYPE);
        assert_eq!(detect_content_type(Path::new("noext")), FALLBACK_CONTENT_TYPE);
    }
}
