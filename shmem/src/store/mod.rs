//! Fixed-capacity key/value store packed into one segment.
//!
//! Entries are stored back to back as `[key_len: u16][key][value_len: u32][value]`
//! and `occupied` covers exactly the packed entries. Upserts rewrite the
//! packed region inside one critical section; a full store is an error,
//! never an eviction.

use std::collections::BTreeMap;

use crate::codec::{self, Records};
use crate::core::lock::SegmentGuard;
use crate::core::ShmemConfig;
use crate::errors::{IpcError, Result};
use crate::segment::Segment;

pub struct StoreDict {
    name: String,
    segment: Segment,
    verbose: bool,
}

impl StoreDict {
    /// Creates or attaches the backing segment of `capacity` bytes.
    pub fn create(cfg: &ShmemConfig, name: &str, capacity: usize) -> Result<StoreDict> {
        Ok(StoreDict {
            name: name.to_string(),
            segment: Segment::create(cfg, name, capacity)?,
            verbose: cfg.verbose,
        })
    }

    pub fn setup(&mut self) -> Result<bool> {
        self.segment.setup()
    }

    /// Inserts or replaces `key`. Last write wins.
    pub fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        codec::validate_key(key)?;
        let record_len = codec::record_len(key, value);
        let mut guard = self.segment.lock()?;
        if record_len > guard.capacity() {
            return Err(IpcError::TooLarge {
                len: record_len,
                capacity: guard.capacity(),
            });
        }

        let mut packed = Vec::with_capacity(guard.occupied() + record_len);
        let mut replaced = false;
        for entry in entries_of(&guard) {
            let (k, v) = entry?;
            if k == key {
                codec::encode_record(&mut packed, key, value)?;
                replaced = true;
            } else {
                codec::encode_record(&mut packed, k, v)?;
            }
        }
        if !replaced {
            codec::encode_record(&mut packed, key, value)?;
        }
        if packed.len() > guard.capacity() {
            return Err(IpcError::Full(self.name.clone()));
        }

        rewrite(&mut guard, &packed)?;
        op_event!(self.verbose, name = %self.name, key, len = value.len(), replaced, "store");
        Ok(())
    }

    pub fn store_str(&self, key: &str, value: &str) -> Result<()> {
        self.store(key, value.as_bytes())
    }

    pub fn retrieve(&self, key: &str) -> Result<Vec<u8>> {
        codec::validate_key(key)?;
        let guard = self.segment.lock()?;
        for entry in entries_of(&guard) {
            let (k, v) = entry?;
            if k == key {
                return Ok(v.to_vec());
            }
        }
        Err(IpcError::NotFound(key.to_string()))
    }

    pub fn retrieve_string(&self, key: &str) -> Result<String> {
        Ok(String::from_utf8(self.retrieve(key)?)?)
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool> {
        codec::validate_key(key)?;
        let mut guard = self.segment.lock()?;
        let mut packed = Vec::with_capacity(guard.occupied());
        let mut found = false;
        for entry in entries_of(&guard) {
            let (k, v) = entry?;
            if k == key {
                found = true;
            } else {
                codec::encode_record(&mut packed, k, v)?;
            }
        }
        if found {
            rewrite(&mut guard, &packed)?;
            op_event!(self.verbose, name = %self.name, key, "store delete");
        }
        Ok(found)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        match self.retrieve(key) {
            Ok(_) => Ok(true),
            Err(IpcError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let guard = self.segment.lock()?;
        entries_of(&guard)
            .map(|entry| entry.map(|(k, _)| k.to_string()))
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.segment.lock()?;
        entries_of(&guard).try_fold(0, |n, entry| entry.map(|_| n + 1))
    }

    pub fn is_empty(&self) -> Result<bool> {
        let guard = self.segment.lock()?;
        Ok(guard.occupied() == 0)
    }

    /// Snapshot of every entry, taken in one critical section.
    pub fn entries(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let guard = self.segment.lock()?;
        entries_of(&guard)
            .map(|entry| entry.map(|(k, v)| (k.to_string(), v.to_vec())))
            .collect()
    }

    pub fn clear(&self) -> Result<()> {
        self.segment.clear()
    }

    pub fn close(&mut self) {
        self.segment.close();
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.segment.unlink()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total bytes available to packed entries.
    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }
}

fn entries_of<'g>(guard: &'g SegmentGuard<'_>) -> Records<'g> {
    Records::new(&guard.payload()[..guard.occupied()])
}

fn rewrite(guard: &mut SegmentGuard<'_>, packed: &[u8]) -> Result<()> {
    let previous = guard.occupied();
    let payload = guard.payload_mut();
    payload[..packed.len()].copy_from_slice(packed);
    if previous > packed.len() {
        payload[packed.len()..previous].fill(0);
    }
    guard.set_occupied(packed.len())?;
    guard.bump_generation();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{test_config, unique_name};
    use std::error::Error;

    type TestResult = std::result::Result<(), Box<dyn Error>>;

    fn open(cfg: &ShmemConfig, name: &str, capacity: usize) -> Result<StoreDict> {
        let mut store = StoreDict::create(cfg, name, capacity)?;
        store.setup()?;
        Ok(store)
    }

    #[test]
    fn store_then_retrieve_across_handles() -> TestResult {
        let (cfg, _dir) = test_config()?;
        let name = unique_name("dict");
        let mut writer = open(&cfg, &name, 256)?;
        let mut reader = open(&cfg, &name, 256)?;

        writer.store_str("host", "alpha")?;
        writer.store("blob", &[0, 1, 2, 255])?;
        assert_eq!(reader.retrieve_string("host")?, "alpha");
        assert_eq!(reader.retrieve("blob")?, vec![0, 1, 2, 255]);
        assert!(matches!(reader.retrieve("missing"), Err(IpcError::NotFound(_))));

        reader.close();
        writer.unlink()?;
        Ok(())
    }

    #[test]
    fn last_write_wins_and_keeps_order() -> TestResult {
        let (cfg, _dir) = test_config()?;
        let mut store = open(&cfg, &unique_name("upsert"), 256)?;
        store.store_str("a", "1")?;
        store.store_str("b", "2")?;
        store.store_str("a", "a much longer value")?;
        assert_eq!(store.retrieve_string("a")?, "a much longer value");
        assert_eq!(store.keys()?, vec!["a".to_string(), "b".to_string()]);
        store.store_str("a", "")?;
        assert_eq!(store.retrieve("a")?, Vec::<u8>::new());
        assert_eq!(store.len()?, 2);
        store.unlink()?;
        Ok(())
    }

    #[test]
    fn full_store_is_left_unchanged() -> TestResult {
        let (cfg, _dir) = test_config()?;
        let mut store = open(&cfg, &unique_name("full"), 32)?;
        // Each entry is 6 bytes of framing plus key and value.
        store.store_str("k1", "12345678")?;
        store.store_str("k2", "12345678")?;
        let before = store.entries()?;
        assert!(matches!(store.store_str("k3", "12345678"), Err(IpcError::Full(_))));
        assert!(matches!(
            store.store_str("k1", "this value is far too long"),
            Err(IpcError::TooLarge { .. })
        ));
        assert_eq!(store.entries()?, before);

        assert!(store.delete("k1")?);
        assert!(!store.delete("k1")?);
        store.store_str("k3", "12345678")?;
        assert_eq!(store.keys()?, vec!["k2".to_string(), "k3".to_string()]);
        store.unlink()?;
        Ok(())
    }

    #[test]
    fn keys_are_validated() -> TestResult {
        let (cfg, _dir) = test_config()?;
        let mut store = open(&cfg, &unique_name("keys"), 64)?;
        assert!(matches!(store.store_str("", "x"), Err(IpcError::InvalidKey(_))));
        let long_key = "k".repeat(u16::MAX as usize + 1);
        assert!(matches!(store.retrieve(&long_key), Err(IpcError::InvalidKey(_))));
        assert!(store.is_empty()?);
        store.unlink()?;
        Ok(())
    }

    #[test]
    fn clear_and_contains() -> TestResult {
        let (cfg, _dir) = test_config()?;
        let mut store = open(&cfg, &unique_name("clear"), 128)?;
        store.store_str("x", "1")?;
        assert!(store.contains_key("x")?);
        store.clear()?;
        assert!(!store.contains_key("x")?);
        assert!(store.is_empty()?);
        assert_eq!(store.len()?, 0);
        store.unlink()?;
        Ok(())
    }
}
