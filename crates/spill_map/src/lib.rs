//! A keyed container that transparently overflows from memory to a local
//! on-disk store.
//!
//! Values are combined with a caller-supplied merge function, which must be
//! commutative and associative: entries for the same key may be merged in the
//! cache, merged on eviction against an already-spilled value, or merged at
//! read time across the two layers, and every path has to agree.

use std::{
    collections::HashMap,
    path::Path,
};

use anyhow::Context as _;
use indexmap::{
    map::Entry,
    IndexMap,
    IndexSet,
};
use serde::{
    de::DeserializeOwned,
    Serialize,
};

mod store;

use store::DiskStore;

const SCAN_PAGE_SIZE: usize = 1000;

pub struct SpillMap<V, F> {
    cache: IndexMap<String, V>,
    store: Option<DiskStore>,
    merge: F,
    spill_threshold: usize,
    spill_proportion: f64,
    spill_batch_size: usize,
}

impl<V, F> SpillMap<V, F>
where
    V: Serialize + DeserializeOwned + Clone,
    F: Fn(V, V) -> V,
{
    pub fn open(
        db_path: impl AsRef<Path>,
        spill_threshold: usize,
        spill_proportion: f64,
        merge: F,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            spill_threshold > 0,
            "spill threshold must be at least one entry"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&spill_proportion) && spill_proportion > 0.0,
            "spill proportion must be in (0, 1]"
        );
        Ok(Self {
            cache: IndexMap::new(),
            store: Some(DiskStore::open(db_path.as_ref())?),
            merge,
            spill_threshold,
            spill_proportion,
            spill_batch_size: 500,
        })
    }

    fn store(&self) -> &DiskStore {
        self.store.as_ref().expect("spill store already closed")
    }

    fn store_mut(&mut self) -> &mut DiskStore {
        self.store.as_mut().expect("spill store already closed")
    }

    /// Store `value` under `key`, merging with any value already cached for
    /// it. Crossing the spill threshold evicts the oldest-inserted slice of
    /// the cache to disk.
    pub fn put(&mut self, key: impl Into<String>, value: V) -> anyhow::Result<()> {
        let key = key.into();
        match self.cache.entry(key) {
            Entry::Occupied(mut entry) => {
                let merged = (self.merge)(entry.get().clone(), value);
                entry.insert(merged);
            },
            Entry::Vacant(entry) => {
                entry.insert(value);
            },
        }
        if self.cache.len() > self.spill_threshold {
            self.spill()?;
        }
        Ok(())
    }

    pub fn put_many(
        &mut self,
        pairs: impl IntoIterator<Item = (String, V)>,
    ) -> anyhow::Result<()> {
        for (key, value) in pairs {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// The fully merged value for `key` across both layers.
    pub fn get(&self, key: &str) -> anyhow::Result<Option<V>> {
        let cached = self.cache.get(key).cloned();
        let spilled = self
            .store()
            .get(key)?
            .map(|blob| deserialize_value(key, &blob))
            .transpose()?;
        Ok(match (spilled, cached) {
            (Some(spilled), Some(cached)) => Some((self.merge)(spilled, cached)),
            (Some(spilled), None) => Some(spilled),
            (None, cached) => cached,
        })
    }

    pub fn get_many<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> anyhow::Result<Vec<Option<V>>> {
        keys.into_iter().map(|key| self.get(key)).collect()
    }

    /// Remove `key` from both layers, returning the merged value.
    pub fn pop(&mut self, key: &str) -> anyhow::Result<Option<V>> {
        let value = self.get(key)?;
        if value.is_some() {
            self.cache.shift_remove(key);
            self.store().delete(key)?;
        }
        Ok(value)
    }

    pub fn contains(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.cache.contains_key(key) || self.store().contains(key)?)
    }

    /// Union cardinality across both layers.
    pub fn len(&self) -> anyhow::Result<usize> {
        let mut len = self.store().len()?;
        for key in self.cache.keys() {
            if !self.store().contains(key)? {
                len += 1;
            }
        }
        Ok(len)
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.cache.is_empty() && self.store().is_empty()?)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn spilled_len(&self) -> anyhow::Result<usize> {
        self.store().len()
    }

    /// Iterate every key exactly once with its fully merged value. Order is
    /// unspecified. Disk pages are streamed, so memory stays bounded by the
    /// cache plus one page.
    pub fn iter(&self) -> Iter<'_, V, F> {
        Iter {
            map: self,
            cursor: None,
            buffer: Vec::new(),
            disk_done: false,
            cache_remaining: self.cache.keys().cloned().collect(),
        }
    }

    /// Close the map and delete its database file.
    pub fn close(mut self) -> anyhow::Result<()> {
        let store = self.store.take().expect("spill store already closed");
        store.destroy()
    }

    fn spill(&mut self) -> anyhow::Result<()> {
        let count = ((self.cache.len() as f64) * self.spill_proportion).ceil() as usize;
        let count = count.clamp(1, self.cache.len());
        let evicted: Vec<(String, V)> = self.cache.drain(0..count).collect();

        let mut rows = Vec::with_capacity(evicted.len());
        for (key, value) in &evicted {
            rows.push((key.clone(), serialize_value(key, value)?));
        }

        let batch_size = self.spill_batch_size;
        let mut conflicts = Vec::new();
        for batch in rows.chunks(batch_size) {
            conflicts.extend(self.store_mut().insert_new(batch)?);
        }
        if !conflicts.is_empty() {
            let evicted_by_key: HashMap<&str, &V> =
                evicted.iter().map(|(k, v)| (k.as_str(), v)).collect();
            let mut merged_rows = Vec::with_capacity(conflicts.len());
            for key in &conflicts {
                let existing = self
                    .store()
                    .get(key)?
                    .with_context(|| format!("conflicting spill key {key:?} disappeared"))?;
                let existing = deserialize_value(key, &existing)?;
                let incoming = (*evicted_by_key
                    .get(key.as_str())
                    .expect("conflict key came from the evicted batch"))
                .clone();
                let merged = (self.merge)(existing, incoming);
                merged_rows.push((key.clone(), serialize_value(key, &merged)?));
            }
            for batch in merged_rows.chunks(batch_size) {
                self.store_mut().put_many(batch)?;
            }
        }
        tracing::debug!(
            evicted = count,
            conflicts = conflicts.len(),
            cache_len = self.cache.len(),
            "Spilled cache slice to disk"
        );
        Ok(())
    }
}

impl<V, F> Drop for SpillMap<V, F> {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = store.destroy() {
                tracing::warn!("Failed to remove spill database on drop: {e:#}");
            }
        }
    }
}

fn serialize_value<V: Serialize>(key: &str, value: &V) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(value).with_context(|| format!("failed to serialize value for {key:?}"))
}

fn deserialize_value<V: DeserializeOwned>(key: &str, blob: &[u8]) -> anyhow::Result<V> {
    serde_json::from_slice(blob).with_context(|| format!("corrupt spilled value for {key:?}"))
}

pub struct Iter<'a, V, F> {
    map: &'a SpillMap<V, F>,
    cursor: Option<String>,
    buffer: Vec<(String, Vec<u8>)>,
    disk_done: bool,
    cache_remaining: IndexSet<String>,
}

impl<V, F> Iterator for Iter<'_, V, F>
where
    V: Serialize + DeserializeOwned + Clone,
    F: Fn(V, V) -> V,
{
    type Item = anyhow::Result<(String, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.disk_done {
            if let Some((key, blob)) = self.buffer.pop() {
                let spilled = match deserialize_value(&key, &blob) {
                    Ok(value) => value,
                    Err(e) => return Some(Err(e)),
                };
                let value = match self.map.cache.get(&key) {
                    Some(cached) => {
                        self.cache_remaining.swap_remove(&key);
                        (self.map.merge)(spilled, cached.clone())
                    },
                    None => spilled,
                };
                return Some(Ok((key, value)));
            }
            let page = match self.map.store().scan_page(self.cursor.as_deref(), SCAN_PAGE_SIZE) {
                Ok(page) => page,
                Err(e) => return Some(Err(e)),
            };
            if page.is_empty() {
                self.disk_done = true;
            } else {
                self.cursor = Some(page.last().expect("nonempty page").0.clone());
                // Popped back-to-front; page order itself is unspecified to
                // callers.
                self.buffer = page;
                self.buffer.reverse();
            }
        }
        let key = self.cache_remaining.shift_remove_index(0)?;
        let value = self
            .map
            .cache
            .get(&key)
            .expect("cache keys snapshot is a subset of the cache")
            .clone();
        Some(Ok((key, value)))
    }
}
