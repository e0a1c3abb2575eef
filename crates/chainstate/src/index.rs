//! Block tree persistence: index nodes and flat file statistics.

use pivxd_consensus::Hash256;
use pivxd_primitives::block::BlockHeader;
use pivxd_primitives::encoding::{DecodeError, Decoder, Encoder};
use pivxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::StoredNode;
use crate::filemeta::{file_info_key, parse_file_info_key, FlatFileInfo, FlatFileKind};
use crate::flatfiles::FileLocation;

const META_LAST_BLOCK_FILE_KEY: &[u8] = b"last_block_file";

pub struct BlockTreeDb<S> {
    store: S,
}

impl<S: KeyValueStore> BlockTreeDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn put_node(&self, batch: &mut WriteBatch, node: &StoredNode) {
        batch.put(Column::BlockIndex, node.hash, encode_node(node));
    }

    pub fn put_file_info(
        &self,
        batch: &mut WriteBatch,
        kind: FlatFileKind,
        file_id: u32,
        info: &FlatFileInfo,
    ) {
        batch.put(Column::BlockFileInfo, file_info_key(kind, file_id), info.encode());
    }

    pub fn put_last_block_file(&self, batch: &mut WriteBatch, file_id: u32) {
        batch.put(Column::Meta, META_LAST_BLOCK_FILE_KEY, file_id.to_le_bytes());
    }

    pub fn write(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.store.write_batch(batch)?;
        self.store.sync()
    }

    pub fn load_nodes(&self) -> Result<Vec<StoredNode>, StoreError> {
        let entries = self.store.scan_prefix(Column::BlockIndex, &[])?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Backend("invalid block index key".to_string()))?;
            let node = decode_node(hash, &value).map_err(|err| {
                StoreError::Backend(format!("block index entry decode failed: {err}"))
            })?;
            if node.header.hash() != hash {
                return Err(StoreError::Backend(
                    "block index entry does not match its key".to_string(),
                ));
            }
            out.push(node);
        }
        Ok(out)
    }

    pub fn load_file_infos(&self) -> Result<Vec<(FlatFileKind, u32, FlatFileInfo)>, StoreError> {
        let entries = self.store.scan_prefix(Column::BlockFileInfo, &[])?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let (kind, file_id) = parse_file_info_key(&key)
                .ok_or_else(|| StoreError::Backend("invalid file info key".to_string()))?;
            let info = FlatFileInfo::decode(&value)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            out.push((kind, file_id, info));
        }
        Ok(out)
    }

    pub fn last_block_file(&self) -> Result<Option<u32>, StoreError> {
        match self.store.get(Column::Meta, META_LAST_BLOCK_FILE_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid last block file".to_string()))?;
                Ok(Some(u32::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }
}

fn encode_node(node: &StoredNode) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(200);
    encoder.write_var_bytes(&node.header.consensus_encode());
    encoder.write_i32_le(node.height);
    encoder.write_u32_le(node.status);
    encoder.write_u32_le(node.tx_count);
    write_location(&mut encoder, node.block_pos);
    write_location(&mut encoder, node.undo_pos);
    encoder.into_inner()
}

fn decode_node(hash: Hash256, bytes: &[u8]) -> Result<StoredNode, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::consensus_decode(&decoder.read_var_bytes()?)?;
    let height = decoder.read_i32_le()?;
    let status = decoder.read_u32_le()?;
    let tx_count = decoder.read_u32_le()?;
    let block_pos = read_location(&mut decoder)?;
    let undo_pos = read_location(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(StoredNode {
        hash,
        header,
        height,
        status,
        tx_count,
        block_pos,
        undo_pos,
    })
}

fn write_location(encoder: &mut Encoder, location: Option<FileLocation>) {
    match location {
        Some(location) => {
            encoder.write_bool(true);
            encoder.write_bytes(&location.encode());
        }
        None => encoder.write_bool(false),
    }
}

fn read_location(decoder: &mut Decoder) -> Result<Option<FileLocation>, DecodeError> {
    if !decoder.read_bool()? {
        return Ok(None);
    }
    let bytes = decoder.read_fixed::<16>()?;
    FileLocation::decode(&bytes)
        .map(Some)
        .ok_or(DecodeError::InvalidData("invalid file location"))
}
