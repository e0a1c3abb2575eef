//! Key-value persistence used by the chain state: column-addressed gets, prefix
//! scans, and atomic write batches over a pluggable backend.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Poisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::Poisoned => write!(f, "store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Block index records keyed by block hash.
    BlockIndex,
    /// Per flat-file statistics keyed by file number.
    BlockFileInfo,
    /// Unspent outputs keyed by outpoint.
    Coins,
    /// Singletons: best block, last block file, flags.
    Meta,
}

impl Column {
    pub const ALL: [Column; 4] = [
        Column::BlockIndex,
        Column::BlockFileInfo,
        Column::Coins,
        Column::Meta,
    ];

    pub const fn index(self) -> usize {
        match self {
            Column::BlockIndex => 0,
            Column::BlockFileInfo => 1,
            Column::Coins => 2,
            Column::Meta => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockIndex => "block_index",
            Column::BlockFileInfo => "block_file_info",
            Column::Coins => "coins",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 40]>);

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 64]>);

macro_rules! byte_wrapper {
    ($name:ident) => {
        impl $name {
            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.as_slice()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(value: Vec<u8>) -> Self {
                Self(SmallVec::from_vec(value))
            }
        }

        impl From<&[u8]> for $name {
            fn from(value: &[u8]) -> Self {
                Self(SmallVec::from_slice(value))
            }
        }

        impl<const N: usize> From<[u8; N]> for $name {
            fn from(value: [u8; N]) -> Self {
                Self(SmallVec::from_slice(&value))
            }
        }

        impl<const N: usize> From<&[u8; N]> for $name {
            fn from(value: &[u8; N]) -> Self {
                Self(SmallVec::from_slice(value))
            }
        }
    };
}

byte_wrapper!(WriteKey);
byte_wrapper!(WriteValue);

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

/// Ordered set of mutations applied atomically by [`KeyValueStore::write_batch`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    /// Forces previously committed batches to stable storage.
    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Rough on-disk footprint, when the backend can tell.
    fn approximate_size(&self) -> Option<u64> {
        None
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.as_ref().sync()
    }

    fn approximate_size(&self) -> Option<u64> {
        self.as_ref().approximate_size()
    }
}
