//! Per-file statistics for the block and undo flat files.

use pivxd_primitives::encoding::{DecodeError, Decoder, Encoder};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FlatFileKind {
    Blocks,
    Undo,
}

impl FlatFileKind {
    fn tag(self) -> u8 {
        match self {
            FlatFileKind::Blocks => b'b',
            FlatFileKind::Undo => b'u',
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'b' => Some(FlatFileKind::Blocks),
            b'u' => Some(FlatFileKind::Undo),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlatFileInfo {
    pub blocks: u32,
    pub size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl FlatFileInfo {
    /// Accounts for one more record ending at `file_len`.
    pub fn add_record(&mut self, file_len: u64, height: i32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks = self.blocks.saturating_add(1);
        self.size = self.size.max(file_len);
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(32);
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le()?,
            size: decoder.read_u64_le()?,
            height_first: decoder.read_i32_le()?,
            height_last: decoder.read_i32_le()?,
            time_first: decoder.read_u32_le()?,
            time_last: decoder.read_u32_le()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(info)
    }
}

pub fn file_info_key(kind: FlatFileKind, file_id: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = kind.tag();
    key[1..].copy_from_slice(&file_id.to_be_bytes());
    key
}

pub fn parse_file_info_key(key: &[u8]) -> Option<(FlatFileKind, u32)> {
    let (&tag, id) = key.split_first()?;
    let kind = FlatFileKind::from_tag(tag)?;
    Some((kind, u32::from_be_bytes(id.try_into().ok()?)))
}
