//! Block and undo flat files plus the per-file summaries kept in the index.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::filemeta::{FlatFileInfo, FlatFileKind};
use crate::flatfiles::{FileLocation, FlatFileError, FlatFileStore};

const BLOCK_FILE_PREFIX: &str = "blk";
const UNDO_FILE_PREFIX: &str = "rev";

pub struct BlockStorage {
    blocks: FlatFileStore,
    undo: FlatFileStore,
    infos: BTreeMap<(FlatFileKind, u32), FlatFileInfo>,
    dirty: BTreeSet<(FlatFileKind, u32)>,
    last_block_file: u32,
    block_file_rolled: bool,
}

impl BlockStorage {
    pub fn open(
        dir: &Path,
        max_file_size: u64,
        infos: Vec<(FlatFileKind, u32, FlatFileInfo)>,
    ) -> Result<Self, FlatFileError> {
        let blocks = FlatFileStore::new_with_prefix(dir, BLOCK_FILE_PREFIX, max_file_size)?;
        let undo = FlatFileStore::new_with_prefix(dir, UNDO_FILE_PREFIX, max_file_size)?;
        let last_block_file = blocks.current_file()?;
        Ok(Self {
            blocks,
            undo,
            infos: infos
                .into_iter()
                .map(|(kind, file_id, info)| ((kind, file_id), info))
                .collect(),
            dirty: BTreeSet::new(),
            last_block_file,
            block_file_rolled: false,
        })
    }

    pub fn write_block(
        &mut self,
        bytes: &[u8],
        height: i32,
        time: u32,
    ) -> Result<FileLocation, FlatFileError> {
        let location = self.blocks.append(bytes)?;
        if location.file_id != self.last_block_file {
            self.last_block_file = location.file_id;
            self.block_file_rolled = true;
        }
        self.record(FlatFileKind::Blocks, location, height, time);
        Ok(location)
    }

    pub fn write_undo(
        &mut self,
        bytes: &[u8],
        height: i32,
        time: u32,
    ) -> Result<FileLocation, FlatFileError> {
        let location = self.undo.append(bytes)?;
        self.record(FlatFileKind::Undo, location, height, time);
        Ok(location)
    }

    pub fn read_block(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.blocks.read(location)
    }

    pub fn read_undo(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.undo.read(location)
    }

    fn record(&mut self, kind: FlatFileKind, location: FileLocation, height: i32, time: u32) {
        self.infos
            .entry((kind, location.file_id))
            .or_default()
            .add_record(location.end(), height, time);
        self.dirty.insert((kind, location.file_id));
    }

    /// Forces both file sets to stable storage.
    pub fn sync(&self) -> Result<(), FlatFileError> {
        self.blocks.sync()?;
        self.undo.sync()
    }

    pub fn last_block_file(&self) -> u32 {
        self.last_block_file
    }

    /// Whether a new block file was started since the last call.
    pub fn take_file_rolled(&mut self) -> bool {
        std::mem::take(&mut self.block_file_rolled)
    }

    pub fn take_dirty_infos(&mut self) -> Vec<(FlatFileKind, u32, FlatFileInfo)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|key| self.infos.get(&key).map(|info| (key.0, key.1, *info)))
            .collect()
    }

    pub fn file_info(&self, kind: FlatFileKind, file_id: u32) -> Option<&FlatFileInfo> {
        self.infos.get(&(kind, file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_file_summaries_and_rollover() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = BlockStorage::open(dir.path(), 64, Vec::new()).expect("open");
        let first = storage.write_block(&[1u8; 30], 1, 100).expect("write");
        assert!(!storage.take_file_rolled());
        let second = storage.write_block(&[2u8; 30], 2, 160).expect("write");
        assert_eq!((first.file_id, second.file_id), (0, 1));
        assert!(storage.take_file_rolled());
        assert!(!storage.take_file_rolled());

        storage.write_undo(&[3u8; 10], 2, 160).expect("undo");
        let dirty = storage.take_dirty_infos();
        assert_eq!(dirty.len(), 3);
        assert!(storage.take_dirty_infos().is_empty());

        let info = storage
            .file_info(FlatFileKind::Blocks, 0)
            .expect("block file 0");
        assert_eq!((info.blocks, info.height_first, info.height_last), (1, 1, 1));
        assert_eq!(storage.read_block(second).expect("read"), vec![2u8; 30]);
    }
}
