use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// In-process store for tests and `--backend memory`. Batches can be made to
/// fail on demand to exercise local-fault handling.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
    fail_writes: AtomicBool,
    batches_committed: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn batches_committed(&self) -> usize {
        self.batches_committed.load(Ordering::SeqCst)
    }

    pub fn len(&self, column: Column) -> usize {
        self.inner
            .read()
            .map(|guard| guard.keys().filter(|(col, _)| *col == column).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map(|guard| guard.is_empty()).unwrap_or(true)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard
            .range((column, prefix.to_vec())..)
            .take_while(|((entry_column, key), _)| *entry_column == column && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated write failure".to_string()));
        }
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert((*column, key.as_slice().to_vec()), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        self.batches_committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
