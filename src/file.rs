use crate::response::Outcome;
use memmap2::Mmap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const S_IROTH: u32 = 0o004;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("no such file")]
    Missing,
    #[error("file is not readable by others")]
    Forbidden,
    #[error("target is a directory")]
    Directory,
    #[error("target is not a regular file")]
    NotRegular,
    #[error("failed to map file: {0}")]
    Map(#[source] io::Error),
}

impl From<FileError> for Outcome {
    fn from(err: FileError) -> Self {
        match err {
            FileError::Missing => Outcome::NotFound,
            FileError::Forbidden => Outcome::Forbidden,
            FileError::Directory | FileError::NotRegular => Outcome::BadRequest,
            FileError::Map(_) => Outcome::InternalError,
        }
    }
}

/// Read-only view of a served file. Empty files carry no mapping.
#[derive(Debug)]
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    #[inline]
    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

/// `doc_root` and `target` are joined as strings; `target` starts with `/`.
pub fn resolve(doc_root: &Path, target: &str) -> PathBuf {
    let mut path = OsString::from(doc_root.as_os_str());
    path.push(target);
    PathBuf::from(path)
}

/// Stat and map the file `target` names under `doc_root`. The file handle is
/// closed before returning; the mapping outlives it.
pub fn open(doc_root: &Path, target: &str) -> Result<MappedFile, FileError> {
    let path = resolve(doc_root, target);
    let meta = fs::metadata(&path).map_err(|_| FileError::Missing)?;
    if meta.permissions().mode() & S_IROTH == 0 {
        return Err(FileError::Forbidden);
    }
    if meta.is_dir() {
        return Err(FileError::Directory);
    }
    if !meta.file_type().is_file() {
        return Err(FileError::NotRegular);
    }
    if meta.len() == 0 {
        return Ok(MappedFile { map: None });
    }

    let file = File::open(&path).map_err(FileError::Map)?;
    // SAFETY: the mapping is read-only and private. Files under the document
    // root are not expected to be truncated while being served.
    let map = unsafe { Mmap::map(&file) }.map_err(FileError::Map)?;
    Ok(MappedFile { map: Some(map) })
}
