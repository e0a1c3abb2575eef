use std::path::Path;
use std::time::{Duration, Instant};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub fsync_ms: Option<u16>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: FjallOptions) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = options.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        if let Some(ms) = options.fsync_ms {
            config = config.fsync_ms(Some(ms));
        }
        let keyspace = config.open().map_err(map_err)?;
        let partitions = Column::ALL
            .iter()
            .map(|column| {
                keyspace
                    .open_partition(column.as_str(), PartitionCreateOptions::default())
                    .map_err(map_err)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column)?.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let partition = self.partition(column)?;
        let mut results = Vec::new();
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut fjall_batch = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    fjall_batch.insert(self.partition(*column)?, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    fjall_batch.remove(self.partition(*column)?, key.as_slice());
                }
            }
        }
        let commit_start = Instant::now();
        fjall_batch.commit().map_err(map_err)?;
        let elapsed = commit_start.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD {
            pivxd_log::log_warn!(
                "fjall batch commit took {}ms ({} ops, write buffer {}B)",
                elapsed.as_millis(),
                batch.len(),
                self.keyspace.write_buffer_size(),
            );
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(map_err)
    }

    fn approximate_size(&self) -> Option<u64> {
        Some(self.keyspace.disk_space())
    }
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
