use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::TransferError;

/// Number of bytes still to send when the remote holds `resume_from` bytes.
pub fn tail_len(total: u64, resume_from: u64) -> u64 {
    total.saturating_sub(resume_from)
}

/// Copies the unsent tail of `source`, starting at `resume_from`, into `dest`.
///
/// The tail becomes the body of a `Content-Range` request on its own, so
/// the transport never has to seek inside a file. Returns the tail length.
pub fn write_resume_tail(
    source: &Path,
    dest: &Path,
    resume_from: u64,
) -> Result<u64, TransferError> {
    let mut file = File::open(source)?;
    let total = file.metadata()?.len();
    if resume_from > total {
        return Err(TransferError::ResumeBeyondEnd { resume_from, total });
    }

    file.seek(SeekFrom::Start(resume_from))?;
    let expected = tail_len(total, resume_from);

    let mut out = File::create(dest)?;
    let copied = std::io::copy(&mut file.take(expected), &mut out)?;
    out.flush()?;
    out.sync_all()?;

    if copied != expected {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("payload shrank: copied {copied} of {expected} tail bytes"),
        )));
    }
    Ok(copied)
}
