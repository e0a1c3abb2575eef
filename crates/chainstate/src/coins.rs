//! Unspent output records and the layered coin view.
//!
//! A [`CoinsDb`] is the durable bottom layer. [`CoinsViewCache`] stacks on
//! top of any [`CoinView`] (including another cache), so speculative work can
//! run on a child overlay that is either flushed into its parent or dropped.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use pivxd_consensus::Hash256;
use pivxd_primitives::encoding::{DecodeError, Decoder, Encoder};
use pivxd_primitives::outpoint::OutPoint;
use pivxd_primitives::transaction::TxOut;
use pivxd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const META_COINS_BEST_BLOCK_KEY: &[u8] = b"coins_best_block";

const COIN_FLAG_COINBASE: u8 = 1 << 0;
const COIN_FLAG_COINSTAKE: u8 = 1 << 1;

/// Rough per-entry overhead of a cached coin, on top of its script bytes.
const CACHE_ENTRY_OVERHEAD: usize = 96;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub out: TxOut,
    pub height: i32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

impl Coin {
    pub fn new(out: TxOut, height: i32, is_coinbase: bool, is_coinstake: bool) -> Self {
        Self {
            out,
            height,
            is_coinbase,
            is_coinstake,
        }
    }

    /// Coinbase and coinstake outputs are subject to maturity.
    pub fn is_reward(&self) -> bool {
        self.is_coinbase || self.is_coinstake
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.out.script_pubkey.len() + 16);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.out.value);
        encoder.write_var_bytes(&self.out.script_pubkey);
        encoder.write_i32_le(self.height);
        let mut flags = 0u8;
        if self.is_coinbase {
            flags |= COIN_FLAG_COINBASE;
        }
        if self.is_coinstake {
            flags |= COIN_FLAG_COINSTAKE;
        }
        encoder.write_u8(flags);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coin = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(coin)
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_i32_le()?;
        let flags = decoder.read_u8()?;
        if flags & !(COIN_FLAG_COINBASE | COIN_FLAG_COINSTAKE) != 0 {
            return Err(DecodeError::InvalidData("unknown coin flags"));
        }
        Ok(Self {
            out: TxOut {
                value,
                script_pubkey,
            },
            height,
            is_coinbase: flags & COIN_FLAG_COINBASE != 0,
            is_coinstake: flags & COIN_FLAG_COINSTAKE != 0,
        })
    }

    fn dynamic_usage(&self) -> usize {
        CACHE_ENTRY_OVERHEAD + self.out.script_pubkey.len()
    }
}

/// A cached coin slot. `coin == None` records a spend that the parent layer
/// has not seen yet. `fresh` means the parent holds no unspent version, so a
/// spend can simply forget the slot instead of propagating a delete.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub coin: Option<Coin>,
    pub dirty: bool,
    pub fresh: bool,
}

pub type CoinChanges = HashMap<OutPoint, CacheEntry>;

/// The read side every coin layer exposes, plus the write-back hook a child
/// cache uses to flush into it.
pub trait CoinView {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;

    /// All unspent outputs of `txid` visible through this view.
    fn coins_for_txid(&self, txid: &Hash256) -> Result<Vec<(u32, Coin)>, StoreError>;

    fn best_block(&self) -> Result<Hash256, StoreError>;

    fn batch_write(&mut self, changes: CoinChanges, best_block: Hash256) -> Result<(), StoreError>;
}

impl<T: CoinView + ?Sized> CoinView for &mut T {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        (**self).get(outpoint)
    }

    fn coins_for_txid(&self, txid: &Hash256) -> Result<Vec<(u32, Coin)>, StoreError> {
        (**self).coins_for_txid(txid)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        (**self).best_block()
    }

    fn batch_write(&mut self, changes: CoinChanges, best_block: Hash256) -> Result<(), StoreError> {
        (**self).batch_write(changes, best_block)
    }
}

/// Durable coin set in [`Column::Coins`], keyed by [`OutPoint::to_key`].
pub struct CoinsDb<S> {
    store: S,
    best_block: Hash256,
}

impl<S: KeyValueStore> CoinsDb<S> {
    pub fn new(store: S) -> Result<Self, StoreError> {
        let best_block = match store.get(Column::Meta, META_COINS_BEST_BLOCK_KEY)? {
            Some(bytes) => decode_hash(&bytes)?,
            None => [0u8; 32],
        };
        Ok(Self { store, best_block })
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: KeyValueStore> CoinView for CoinsDb<S> {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.store.get(Column::Coins, &outpoint.to_key())? {
            Some(bytes) => Coin::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    fn coins_for_txid(&self, txid: &Hash256) -> Result<Vec<(u32, Coin)>, StoreError> {
        let entries = self.store.scan_prefix(Column::Coins, txid)?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.len() != 36 {
                return Err(StoreError::Backend("invalid coin key length".to_string()));
            }
            let mut index = [0u8; 4];
            index.copy_from_slice(&key[32..]);
            let coin = Coin::decode(&value).map_err(|err| StoreError::Backend(err.to_string()))?;
            out.push((u32::from_be_bytes(index), coin));
        }
        Ok(out)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        Ok(self.best_block)
    }

    fn batch_write(&mut self, changes: CoinChanges, best_block: Hash256) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for (outpoint, entry) in changes {
            if !entry.dirty {
                continue;
            }
            match entry.coin {
                Some(coin) => batch.put(Column::Coins, outpoint.to_key(), coin.encode()),
                None => batch.delete(Column::Coins, outpoint.to_key()),
            }
        }
        batch.put(Column::Meta, META_COINS_BEST_BLOCK_KEY, best_block);
        self.store.write_batch(&batch)?;
        self.best_block = best_block;
        Ok(())
    }
}

/// Write-back cache over a parent view.
pub struct CoinsViewCache<B> {
    base: B,
    entries: CoinChanges,
    best_block: Option<Hash256>,
    usage: usize,
}

impl<B: CoinView> CoinsViewCache<B> {
    pub fn new(base: B) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best_block: None,
            usage: 0,
        }
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.get(outpoint)?.is_some())
    }

    /// Adds an unspent output. Replaces whatever this layer held for the outpoint.
    pub fn put(&mut self, outpoint: OutPoint, coin: Coin) -> Result<(), StoreError> {
        let fresh = match self.entries.get(&outpoint) {
            Some(entry) => entry.fresh,
            None => self.base.get(&outpoint)?.is_none(),
        };
        self.usage += coin.dynamic_usage();
        let previous = self.entries.insert(
            outpoint,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
        if let Some(coin) = previous.and_then(|entry| entry.coin) {
            self.usage = self.usage.saturating_sub(coin.dynamic_usage());
        }
        Ok(())
    }

    /// Spends `outpoint`, returning the coin it held.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if !self.fetch(outpoint)? {
            return Ok(None);
        }
        let Entry::Occupied(mut slot) = self.entries.entry(outpoint.clone()) else {
            return Ok(None);
        };
        let Some(coin) = slot.get_mut().coin.take() else {
            return Ok(None);
        };
        self.usage = self.usage.saturating_sub(coin.dynamic_usage());
        if slot.get().fresh {
            slot.remove();
        } else {
            slot.get_mut().dirty = true;
        }
        Ok(Some(coin))
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Pushes every dirty entry and the best block into the parent, leaving this layer empty.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let best_block = self.best_block()?;
        let entries = std::mem::take(&mut self.entries);
        self.usage = 0;
        self.base.batch_write(entries, best_block)?;
        self.best_block = None;
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.usage
    }

    /// Pulls `outpoint` into this layer. Returns whether an unspent coin is present.
    fn fetch(&mut self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok(entry.coin.is_some());
        }
        let Some(coin) = self.base.get(outpoint)? else {
            return Ok(false);
        };
        self.usage += coin.dynamic_usage();
        self.entries.insert(
            outpoint.clone(),
            CacheEntry {
                coin: Some(coin),
                dirty: false,
                fresh: false,
            },
        );
        Ok(true)
    }
}

impl<B: CoinView> CoinView for CoinsViewCache<B> {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.base.get(outpoint),
        }
    }

    fn coins_for_txid(&self, txid: &Hash256) -> Result<Vec<(u32, Coin)>, StoreError> {
        let mut out: Vec<(u32, Coin)> = self
            .base
            .coins_for_txid(txid)?
            .into_iter()
            .filter(|(index, _)| {
                !self
                    .entries
                    .contains_key(&OutPoint::new(*txid, *index))
            })
            .collect();
        for (outpoint, entry) in &self.entries {
            if &outpoint.hash != txid {
                continue;
            }
            if let Some(coin) = &entry.coin {
                out.push((outpoint.index, coin.clone()));
            }
        }
        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        match self.best_block {
            Some(hash) => Ok(hash),
            None => self.base.best_block(),
        }
    }

    fn batch_write(&mut self, changes: CoinChanges, best_block: Hash256) -> Result<(), StoreError> {
        for (outpoint, child) in changes {
            if !child.dirty {
                continue;
            }
            match self.entries.entry(outpoint) {
                Entry::Vacant(slot) => {
                    // A coin created and spent above us never reaches this layer.
                    if child.fresh && child.coin.is_none() {
                        continue;
                    }
                    if let Some(coin) = &child.coin {
                        self.usage += coin.dynamic_usage();
                    }
                    slot.insert(CacheEntry {
                        coin: child.coin,
                        dirty: true,
                        fresh: child.fresh,
                    });
                }
                Entry::Occupied(mut slot) => {
                    if let Some(coin) = &slot.get().coin {
                        self.usage = self.usage.saturating_sub(coin.dynamic_usage());
                    }
                    if slot.get().fresh && child.coin.is_none() {
                        slot.remove();
                        continue;
                    }
                    if let Some(coin) = &child.coin {
                        self.usage += coin.dynamic_usage();
                    }
                    let entry = slot.get_mut();
                    entry.coin = child.coin;
                    entry.dirty = true;
                }
            }
        }
        self.best_block = Some(best_block);
        Ok(())
    }
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Backend("invalid hash length".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivxd_storage::memory::MemoryStore;
    use std::sync::Arc;

    fn coin(value: i64, height: i32) -> Coin {
        Coin::new(
            TxOut {
                value,
                script_pubkey: vec![0x51],
            },
            height,
            false,
            false,
        )
    }

    fn outpoint(byte: u8, index: u32) -> OutPoint {
        OutPoint::new([byte; 32], index)
    }

    #[test]
    fn coin_encoding_keeps_flags() {
        let mut record = coin(50, 7);
        record.is_coinstake = true;
        let decoded = Coin::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
        assert!(decoded.is_reward());
    }

    #[test]
    fn flush_reaches_the_database() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store)).expect("db");
        {
            let mut cache = CoinsViewCache::new(&mut db);
            cache.put(outpoint(1, 0), coin(10, 1)).expect("put");
            cache.put(outpoint(1, 1), coin(20, 1)).expect("put");
            cache.set_best_block([9u8; 32]);
            cache.flush().expect("flush");
        }
        assert_eq!(db.get(&outpoint(1, 1)).expect("get"), Some(coin(20, 1)));
        assert_eq!(db.best_block().expect("best"), [9u8; 32]);

        let reopened = CoinsDb::new(Arc::clone(&store)).expect("reopen");
        assert_eq!(reopened.best_block().expect("best"), [9u8; 32]);
        assert_eq!(reopened.coins_for_txid(&[1u8; 32]).expect("scan").len(), 2);
    }

    #[test]
    fn fresh_spend_never_reaches_parent() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store)).expect("db");
        let mut cache = CoinsViewCache::new(&mut db);
        cache.put(outpoint(2, 0), coin(5, 3)).expect("put");
        assert_eq!(cache.remove(&outpoint(2, 0)).expect("remove"), Some(coin(5, 3)));
        assert_eq!(cache.cache_size(), 0);
        assert_eq!(cache.remove(&outpoint(2, 0)).expect("remove"), None);
        cache.set_best_block([1u8; 32]);
        cache.flush().expect("flush");
        assert_eq!(store.len(Column::Coins), 0);
    }

    #[test]
    fn overlay_changes_are_discardable() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store)).expect("db");
        let mut tip = CoinsViewCache::new(&mut db);
        tip.put(outpoint(3, 0), coin(7, 1)).expect("put");

        {
            let mut overlay = CoinsViewCache::new(&mut tip);
            assert!(overlay.remove(&outpoint(3, 0)).expect("remove").is_some());
            overlay.put(outpoint(4, 0), coin(6, 2)).expect("put");
            assert!(!overlay.have_coin(&outpoint(3, 0)).expect("have"));
        }
        assert!(tip.have_coin(&outpoint(3, 0)).expect("have"));
        assert!(!tip.have_coin(&outpoint(4, 0)).expect("have"));

        {
            let mut overlay = CoinsViewCache::new(&mut tip);
            overlay.remove(&outpoint(3, 0)).expect("remove");
            overlay.put(outpoint(4, 0), coin(6, 2)).expect("put");
            overlay.set_best_block([4u8; 32]);
            overlay.flush().expect("flush");
        }
        assert!(!tip.have_coin(&outpoint(3, 0)).expect("have"));
        assert_eq!(tip.get(&outpoint(4, 0)).expect("get"), Some(coin(6, 2)));
        assert_eq!(tip.best_block().expect("best"), [4u8; 32]);
    }

    #[test]
    fn spend_of_stored_coin_deletes_on_flush() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store)).expect("db");
        {
            let mut cache = CoinsViewCache::new(&mut db);
            cache.put(outpoint(5, 0), coin(1, 1)).expect("put");
            cache.put(outpoint(5, 2), coin(2, 1)).expect("put");
            cache.flush().expect("flush");
        }
        let mut cache = CoinsViewCache::new(&mut db);
        assert!(cache.remove(&outpoint(5, 0)).expect("remove").is_some());
        let siblings = cache.coins_for_txid(&[5u8; 32]).expect("siblings");
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].0, 2);
        cache.flush().expect("flush");
        assert_eq!(store.len(Column::Coins), 1);
    }
}
