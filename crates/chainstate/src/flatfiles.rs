//! Append-only block and undo files addressed by (file id, offset).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const FILE_LOCATION_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; FILE_LOCATION_LEN] {
        let mut out = [0u8; FILE_LOCATION_LEN];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FILE_LOCATION_LEN {
            return None;
        }
        Some(Self {
            file_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            offset: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
            len: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }

    /// File length once this record (with its length prefix) is written.
    pub fn end(&self) -> u64 {
        self.offset + 4 + u64::from(self.len)
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
    Poisoned,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::LengthMismatch => write!(f, "flatfile length mismatch"),
            FlatFileError::Poisoned => write!(f, "flatfile lock poisoned"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

/// A directory of `{prefix}{id:05}.dat` files. Records are length-prefixed and
/// a new file is started once the current one would exceed `max_file_size`.
pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    state: Mutex<FlatFileState>,
}

#[derive(Debug)]
struct FlatFileState {
    current_file: u32,
    current_len: u64,
    unsynced: bool,
}

impl FlatFileStore {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self, FlatFileError> {
        Self::new_with_prefix(dir, "blk", max_file_size)
    }

    pub fn new_with_prefix(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            state: Mutex::new(FlatFileState {
                current_file,
                current_len,
                unsynced: false,
            }),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let len = u32::try_from(bytes.len()).map_err(|_| FlatFileError::InvalidLocation)?;
        let mut state = self.lock()?;
        let needed = 4u64 + u64::from(len);
        if state.current_len > 0 && state.current_len + needed > self.max_file_size {
            // Finish the old file before rolling over; nothing will sync it later.
            if state.unsynced {
                self.sync_file(state.current_file)?;
            }
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(state.current_file))?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed;
        state.unsynced = true;
        Ok(FileLocation {
            file_id: state.current_file,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let mut file = File::open(self.file_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        if u32::from_le_bytes(len_bytes) != location.len {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; location.len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Forces the file currently being appended to onto stable storage.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        let mut state = self.lock()?;
        if !state.unsynced {
            return Ok(());
        }
        self.sync_file(state.current_file)?;
        state.unsynced = false;
        Ok(())
    }

    pub fn current_file(&self) -> Result<u32, FlatFileError> {
        Ok(self.lock()?.current_file)
    }

    fn sync_file(&self, file_id: u32) -> Result<(), FlatFileError> {
        let path = self.file_path(file_id);
        if path.exists() {
            OpenOptions::new().append(true).open(path)?.sync_all()?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, FlatFileState>, FlatFileError> {
        self.state.lock().map_err(|_| FlatFileError::Poisoned)
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("{}{file_id:05}.dat", self.prefix))
    }
}

fn locate_active_file(
    dir: &Path,
    prefix: &str,
    max_file_size: u64,
) -> Result<(u32, u64), FlatFileError> {
    let mut file_id = 0u32;
    let mut last_existing: Option<(u32, u64)> = None;
    loop {
        let path = dir.join(format!("{prefix}{file_id:05}.dat"));
        if !path.exists() {
            break;
        }
        last_existing = Some((file_id, std::fs::metadata(&path)?.len()));
        file_id += 1;
    }
    Ok(match last_existing {
        Some((last_id, len)) if len >= max_file_size => (last_id + 1, 0),
        Some((last_id, len)) => (last_id, len),
        None => (0, 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_roll_over_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path(), 64).expect("store");
        let first = store.append(&[1u8; 40]).expect("append");
        let second = store.append(&[2u8; 40]).expect("append");
        assert_eq!(first.file_id, 0);
        assert_eq!(second.file_id, 1);
        assert_eq!(second.offset, 0);
        store.sync().expect("sync");
        assert_eq!(store.read(first).expect("read"), vec![1u8; 40]);
        assert_eq!(store.read(second).expect("read"), vec![2u8; 40]);

        let bad = FileLocation { len: 39, ..first };
        assert!(matches!(store.read(bad), Err(FlatFileError::LengthMismatch)));
    }

    #[test]
    fn reopen_resumes_last_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = {
            let store = FlatFileStore::new_with_prefix(dir.path(), "rev", 1_000).expect("store");
            store.append(b"undo").expect("append")
        };
        let store = FlatFileStore::new_with_prefix(dir.path(), "rev", 1_000).expect("store");
        let next = store.append(b"more").expect("append");
        assert_eq!(next.file_id, location.file_id);
        assert_eq!(next.offset, location.end());
        assert_eq!(FileLocation::decode(&next.encode()), Some(next));
    }
}
