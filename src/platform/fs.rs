// logtail - platform/fs.rs
//
// Filesystem access for text sources: stat and ranged reads.
//
// Every failure is classified into a SourceError so callers can turn it into
// an error property (missing vs inaccessible) without inspecting io kinds.

use crate::util::error::SourceError;
use chrono::{DateTime, Utc};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// The metadata a text source needs each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Current length in bytes.
    pub len: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

/// Stat `path`.
pub fn stat(path: &Path) -> Result<FileStat, SourceError> {
    let meta = std::fs::metadata(path).map_err(|e| SourceError::from_io(path.to_path_buf(), e))?;
    if meta.is_dir() {
        return Err(SourceError::CannotBeAccessed {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "path is a directory"),
        });
    }
    Ok(FileStat {
        len: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        created: meta.created().ok().map(DateTime::<Utc>::from),
    })
}

/// Read up to `limit` bytes from `path` starting at byte position `offset`.
///
/// Returns fewer bytes than `limit` if the file ends before `limit` is reached.
pub fn read_bytes_at(path: &Path, offset: u64, limit: usize) -> Result<Vec<u8>, SourceError> {
    let mut file =
        std::fs::File::open(path).map_err(|e| SourceError::from_io(path.to_path_buf(), e))?;
    let read_err = |source| SourceError::Read {
        path: path.to_path_buf(),
        offset,
        source,
    };
    file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
    let mut buf = Vec::with_capacity(limit);
    file.take(limit as u64)
        .read_to_end(&mut buf)
        .map_err(read_err)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_stat_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = stat(&dir.path().join("nope.log")).unwrap_err();
        assert!(matches!(err, SourceError::DoesNotExist { .. }));
    }

    #[test]
    fn test_stat_directory_is_inaccessible() {
        let dir = tempfile::tempdir().unwrap();
        let err = stat(dir.path()).unwrap_err();
        assert!(matches!(err, SourceError::CannotBeAccessed { .. }));
    }

    #[test]
    fn test_read_bytes_at_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"0123456789").unwrap();
        drop(f);

        assert_eq!(stat(&path).unwrap().len, 10);
        assert_eq!(read_bytes_at(&path, 3, 4).unwrap(), b"3456");
        assert_eq!(read_bytes_at(&path, 8, 100).unwrap(), b"89");
        assert!(read_bytes_at(&path, 20, 4).unwrap().is_empty());
    }
}
