//! Epoch contexts and their process-wide cache
//!
//! An [`EpochContext`] owns the light cache (and optionally the full dataset
//! slab) for one epoch. Contexts are immutable after construction except for
//! dataset slots, which are racy-write-once: concurrent writers produce
//! identical bytes, and a per-item presence bitmap published with release
//! ordering keeps readers from observing partial items.

use super::{
    build_light_cache, calculate_dataset_item_1024, full_dataset_num_items, is_prime,
    light_cache_num_items, seed_from_epoch, FULL_DATASET_ITEM_SIZE, LIGHT_CACHE_ITEM_SIZE,
    L1_CACHE_SIZE, L1_CACHE_WORDS,
};
use crate::types::{Hash1024, Hash2048, Hash512};
use crate::{Error, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Full dataset storage with write-once item publication.
///
/// Items are stored as 64-bit words so concurrent recomputation of the same
/// index never constitutes a data race; the bytes written are identical by
/// construction. A presence bit is set with release ordering only after all
/// sixteen words of an item are in place.
pub struct DatasetSlab {
    num_items: u32,
    words: Box<[AtomicU64]>,
    present: Box<[AtomicU64]>,
}

const WORDS_PER_ITEM: usize = FULL_DATASET_ITEM_SIZE / 8;

impl DatasetSlab {
    /// Allocate a zeroed slab for `num_items` 1024-bit items
    pub fn new(num_items: u32) -> Self {
        let words = (0..num_items as usize * WORDS_PER_ITEM)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let present = (0..(num_items as usize).div_ceil(64))
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            num_items,
            words,
            present,
        }
    }

    /// Number of items the slab holds
    pub fn num_items(&self) -> u32 {
        self.num_items
    }

    /// Read an item if it has been published
    pub fn get(&self, index: u32) -> Option<Hash1024> {
        let bit = &self.present[index as usize / 64];
        if bit.load(Ordering::Acquire) & (1u64 << (index % 64)) == 0 {
            return None;
        }
        let base = index as usize * WORDS_PER_ITEM;
        let mut item = Hash1024::zero();
        for w in 0..WORDS_PER_ITEM {
            let value = self.words[base + w].load(Ordering::Relaxed);
            item.0[w * 8..w * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        Some(item)
    }

    /// Publish an item. Safe to call concurrently for the same index as long
    /// as every caller computed the same bytes.
    pub fn put(&self, index: u32, item: &Hash1024) {
        let base = index as usize * WORDS_PER_ITEM;
        for w in 0..WORDS_PER_ITEM {
            let value = u64::from_le_bytes(item.0[w * 8..w * 8 + 8].try_into().unwrap());
            self.words[base + w].store(value, Ordering::Relaxed);
        }
        self.present[index as usize / 64].fetch_or(1u64 << (index % 64), Ordering::Release);
    }
}

/// All epoch-dependent state needed to hash and verify.
///
/// Immutable after construction; the optional dataset slab only ever gains
/// published items.
pub struct EpochContext {
    epoch_number: u32,
    light_cache: Vec<Hash512>,
    l1_cache: Vec<u32>,
    full_dataset_num_items: u32,
    full_dataset: Option<DatasetSlab>,
}

impl EpochContext {
    /// Build the context for an epoch. `full` additionally allocates the
    /// dataset slab; without it every lookup synthesizes from the light cache.
    pub fn build(epoch: u32, full: bool) -> Result<Self> {
        let light_items = light_cache_num_items(epoch);
        let full_items = full_dataset_num_items(epoch);
        if !is_prime(light_items as u64) || !is_prime(full_items as u64) {
            return Err(Error::invariant(format!(
                "prime search returned composite item count for epoch {}",
                epoch
            )));
        }

        let seed = seed_from_epoch(epoch);
        debug!(epoch, light_items, full_items, "building epoch context");
        let light_cache = build_light_cache(&seed, light_items as usize);
        let l1_cache = build_l1_cache(&light_cache);
        let full_dataset = full.then(|| DatasetSlab::new(full_items));

        Ok(Self {
            epoch_number: epoch,
            light_cache,
            l1_cache,
            full_dataset_num_items: full_items,
            full_dataset,
        })
    }

    /// Epoch number this context belongs to
    pub fn epoch_number(&self) -> u32 {
        self.epoch_number
    }

    /// The light cache items
    pub fn light_cache(&self) -> &[Hash512] {
        &self.light_cache
    }

    /// Number of light cache items
    pub fn light_cache_num_items(&self) -> u32 {
        self.light_cache.len() as u32
    }

    /// Light cache size in bytes
    pub fn light_cache_size(&self) -> usize {
        self.light_cache.len() * LIGHT_CACHE_ITEM_SIZE
    }

    /// Number of 1024-bit full dataset items
    pub fn full_dataset_num_items(&self) -> u32 {
        self.full_dataset_num_items
    }

    /// Full dataset size in bytes (whether or not the slab is allocated)
    pub fn full_dataset_size(&self) -> usize {
        self.full_dataset_num_items as usize * FULL_DATASET_ITEM_SIZE
    }

    /// Number of 2048-bit entries addressed by the mixing loop
    pub fn num_dataset_entries(&self) -> u32 {
        self.full_dataset_num_items / 2
    }

    /// The L1 cache: the first 16 KiB of the full dataset as 32-bit words
    pub fn l1_cache(&self) -> &[u32] {
        &self.l1_cache
    }

    /// Fetch a 1024-bit dataset item, from the slab when already published,
    /// otherwise synthesized from the light cache (and published if a slab
    /// is allocated).
    pub fn dataset_item_1024(&self, index: u32) -> Hash1024 {
        if let Some(slab) = &self.full_dataset {
            if let Some(item) = slab.get(index) {
                return item;
            }
        }
        let item = calculate_dataset_item_1024(&self.light_cache, index);
        if let Some(slab) = &self.full_dataset {
            slab.put(index, &item);
        }
        item
    }

    /// Fetch a 2048-bit dataset entry (two sequential 1024-bit items)
    pub fn dataset_entry_2048(&self, index: u32) -> Hash2048 {
        let a = self.dataset_item_1024(index * 2);
        let b = self.dataset_item_1024(index * 2 + 1);
        Hash2048::from_items(&a, &b)
    }

    /// Test-sized context with explicit item counts; hashing semantics are
    /// identical to full-size contexts, only the table sizes shrink.
    #[cfg(test)]
    pub(crate) fn build_for_tests(epoch: u32, light_items: u32, full_items: u32) -> Self {
        let seed = seed_from_epoch(epoch);
        let light_cache = build_light_cache(&seed, light_items as usize);
        let l1_cache = build_l1_cache(&light_cache);
        Self {
            epoch_number: epoch,
            light_cache,
            l1_cache,
            full_dataset_num_items: full_items,
            full_dataset: None,
        }
    }
}

fn build_l1_cache(light_cache: &[Hash512]) -> Vec<u32> {
    let num_items = L1_CACHE_SIZE / FULL_DATASET_ITEM_SIZE;
    let mut words = Vec::with_capacity(L1_CACHE_WORDS);
    for index in 0..num_items as u32 {
        let item = calculate_dataset_item_1024(light_cache, index);
        for w in 0..FULL_DATASET_ITEM_SIZE / 4 {
            words.push(item.word32(w));
        }
    }
    words
}

/// Cache of shared epoch contexts keyed by epoch number.
///
/// Construction is single-flight: concurrent requests for the same epoch
/// block on one builder and share the result. Pass the cache explicitly to
/// whoever needs contexts; there is deliberately no process-wide instance.
#[derive(Default)]
pub struct EpochContextCache {
    entries: Mutex<HashMap<u32, Arc<OnceCell<Arc<EpochContext>>>>>,
}

impl EpochContextCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or build the context for an epoch. The `full` flag of the first
    /// caller for an epoch decides whether the dataset slab is allocated.
    pub fn get(&self, epoch: u32, full: bool) -> Result<Arc<EpochContext>> {
        let cell = {
            let mut entries = self.entries.lock();
            entries
                .entry(epoch)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_try_init(|| EpochContext::build(epoch, full).map(Arc::new))
            .cloned()
    }

    /// Drop cache entries for epochs below `epoch`. Contexts still referenced
    /// by workers stay alive until the last reference goes away.
    pub fn evict_older_than(&self, epoch: u32) {
        let mut entries = self.entries.lock();
        entries.retain(|e, _| *e >= epoch);
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pre-seed the cache with an already-built context
    #[cfg(test)]
    pub(crate) fn insert(&self, context: Arc<EpochContext>) {
        let cell = Arc::new(OnceCell::new());
        cell.set(context.clone()).ok();
        self.entries
            .lock()
            .insert(context.epoch_number(), cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethash::calculate_dataset_item_1024;

    fn tiny_context(full: bool) -> EpochContext {
        let mut ctx = EpochContext::build_for_tests(0, 61, 512);
        if full {
            ctx.full_dataset = Some(DatasetSlab::new(512));
        }
        ctx
    }

    #[test]
    fn test_slab_publish_roundtrip() {
        let slab = DatasetSlab::new(8);
        assert!(slab.get(3).is_none());

        let mut item = Hash1024::zero();
        item.0[0] = 0xab;
        item.0[127] = 0xcd;
        slab.put(3, &item);

        assert_eq!(slab.get(3), Some(item));
        assert!(slab.get(2).is_none());
    }

    #[test]
    fn test_lazy_lookup_matches_direct_computation() {
        let ctx = tiny_context(true);
        let direct = calculate_dataset_item_1024(ctx.light_cache(), 7);
        // First call synthesizes and publishes, second reads the slab
        assert_eq!(ctx.dataset_item_1024(7), direct);
        assert_eq!(ctx.dataset_item_1024(7), direct);
        assert_eq!(ctx.full_dataset.as_ref().unwrap().get(7), Some(direct));
    }

    #[test]
    fn test_lookup_without_slab_synthesizes() {
        let ctx = tiny_context(false);
        let direct = calculate_dataset_item_1024(ctx.light_cache(), 5);
        assert_eq!(ctx.dataset_item_1024(5), direct);
    }

    #[test]
    fn test_l1_cache_mirrors_dataset_head() {
        let ctx = tiny_context(false);
        let item0 = calculate_dataset_item_1024(ctx.light_cache(), 0);
        let item1 = calculate_dataset_item_1024(ctx.light_cache(), 1);
        assert_eq!(ctx.l1_cache().len(), L1_CACHE_WORDS);
        assert_eq!(ctx.l1_cache()[0], item0.word32(0));
        assert_eq!(ctx.l1_cache()[32], item1.word32(0));
    }

    #[test]
    fn test_dataset_entry_concatenates_sequential_items() {
        let ctx = tiny_context(false);
        let entry = ctx.dataset_entry_2048(3);
        let a = ctx.dataset_item_1024(6);
        let b = ctx.dataset_item_1024(7);
        assert_eq!(&entry.0[..128], &a.0[..]);
        assert_eq!(&entry.0[128..], &b.0[..]);
    }

    #[test]
    fn test_cache_single_flight_shares_context() {
        let cache = EpochContextCache::new();
        cache.insert(Arc::new(tiny_context(false)));

        let a = cache.get(0, false).unwrap();
        let b = cache.get(0, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_eviction_keeps_current() {
        let cache = EpochContextCache::new();
        cache.insert(Arc::new(EpochContext::build_for_tests(0, 61, 512)));
        cache.insert(Arc::new(EpochContext::build_for_tests(1, 61, 512)));
        cache.insert(Arc::new(EpochContext::build_for_tests(2, 61, 512)));

        // A held reference survives eviction of its cache entry
        let old = cache.get(0, false).unwrap();
        cache.evict_older_than(2);
        assert_eq!(cache.len(), 1);
        assert_eq!(old.epoch_number(), 0);
        assert_eq!(cache.get(2, false).unwrap().epoch_number(), 2);
    }
}
