//! Ethash epoch machinery for MeowPoW
//!
//! Binary-exact reimplementation of the epoch layer: Keccak digests, prime
//! sizing of the light cache and full dataset, the epoch seed chain, the
//! RandMemoHash light-cache construction and FNV dataset item generation.
//! MeowPoW shortens the epoch to 7500 blocks to keep the DAG growth rate of
//! a 13 s chain on a 5 min block time; every other constant matches Ethash.

use crate::types::{Hash1024, Hash2048, Hash256, Hash512};
use sha3::{Digest, Keccak256, Keccak512};

pub mod context;

pub use context::{DatasetSlab, EpochContext, EpochContextCache};

/// Blocks per epoch
pub const EPOCH_LENGTH: u64 = 7500;
/// Size of one light cache item in bytes (a Keccak-512 digest)
pub const LIGHT_CACHE_ITEM_SIZE: usize = 64;
/// Size of one full dataset item in bytes
pub const FULL_DATASET_ITEM_SIZE: usize = 128;
/// DAG accesses performed by one mixing loop
pub const NUM_DATASET_ACCESSES: usize = 64;
/// Initial light cache size in bytes
pub const LIGHT_CACHE_INIT_SIZE: usize = 1 << 24;
/// Light cache growth per epoch in bytes
pub const LIGHT_CACHE_GROWTH: usize = 1 << 17;
/// RandMemoHash rounds over the light cache
pub const LIGHT_CACHE_ROUNDS: usize = 3;
/// Initial full dataset size in bytes
pub const FULL_DATASET_INIT_SIZE: u64 = 1 << 30;
/// Full dataset growth per epoch in bytes
pub const FULL_DATASET_GROWTH: u64 = 1 << 23;
/// Light cache parents mixed into one dataset item
pub const DATASET_PARENTS: u32 = 512;
/// Bytes of the full dataset mirrored into the L1 cache
pub const L1_CACHE_SIZE: usize = 16 * 1024;
/// 32-bit words in the L1 cache
pub const L1_CACHE_WORDS: usize = L1_CACHE_SIZE / 4;

/// Upper bound on the epoch number when reversing a seed hash
const MAX_EPOCH_SEARCH: u32 = 65536;

pub(crate) const FNV_PRIME: u32 = 0x0100_0193;
pub(crate) const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1 mix as used by dataset item generation
#[inline]
pub(crate) fn fnv1(u: u32, v: u32) -> u32 {
    u.wrapping_mul(FNV_PRIME) ^ v
}

/// FNV-1a mix as used by the ProgPoW sequence generators
#[inline]
pub(crate) fn fnv1a(u: u32, v: u32) -> u32 {
    (u ^ v).wrapping_mul(FNV_PRIME)
}

/// Keccak-256 (original padding, not NIST SHA-3)
pub fn keccak256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    Hash256(out)
}

/// Keccak-512 (original padding, not NIST SHA-3)
pub fn keccak512(data: &[u8]) -> Hash512 {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Keccak512::digest(data));
    Hash512(out)
}

pub(crate) fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Find the largest prime `p <= upper_bound`; returns 0 for bounds below 2.
/// Deterministic trial division, identical on every platform.
pub fn find_largest_prime(upper_bound: u32) -> u32 {
    let mut n = upper_bound as u64;
    if n < 2 {
        return 0;
    }
    if n == 2 {
        return 2;
    }
    if n % 2 == 0 {
        n -= 1;
    }
    while n >= 3 {
        if is_prime(n) {
            return n as u32;
        }
        n -= 2;
    }
    2
}

/// Number of 64-byte items in the light cache for an epoch
pub fn light_cache_num_items(epoch: u32) -> u32 {
    let upper = (LIGHT_CACHE_INIT_SIZE + LIGHT_CACHE_GROWTH * epoch as usize)
        / LIGHT_CACHE_ITEM_SIZE;
    find_largest_prime(upper as u32)
}

/// Number of 128-byte items in the full dataset for an epoch
pub fn full_dataset_num_items(epoch: u32) -> u32 {
    let upper = (FULL_DATASET_INIT_SIZE + FULL_DATASET_GROWTH * epoch as u64)
        / FULL_DATASET_ITEM_SIZE as u64;
    find_largest_prime(upper as u32)
}

/// Light cache size in bytes for an epoch
pub fn light_cache_size(epoch: u32) -> usize {
    light_cache_num_items(epoch) as usize * LIGHT_CACHE_ITEM_SIZE
}

/// Full dataset size in bytes for an epoch
pub fn full_dataset_size(epoch: u32) -> usize {
    full_dataset_num_items(epoch) as usize * FULL_DATASET_ITEM_SIZE
}

/// Epoch number for a block height
pub fn epoch_from_block(block: u64) -> u32 {
    (block / EPOCH_LENGTH) as u32
}

/// Epoch seed: Keccak-256 iterated `epoch` times over 32 zero bytes
pub fn seed_from_epoch(epoch: u32) -> Hash256 {
    let mut seed = Hash256::zero();
    for _ in 0..epoch {
        seed = keccak256(seed.as_bytes());
    }
    seed
}

/// Reverse a seed hash back to its epoch number by forward iteration.
/// Returns `None` when no epoch below the search bound matches.
pub fn epoch_from_seed(seed: &Hash256) -> Option<u32> {
    let mut current = Hash256::zero();
    for epoch in 0..MAX_EPOCH_SEARCH {
        if current == *seed {
            return Some(epoch);
        }
        current = keccak256(current.as_bytes());
    }
    None
}

fn hash512_words(h: &Hash512) -> [u32; 16] {
    let mut words = [0u32; 16];
    for (i, w) in words.iter_mut().enumerate() {
        *w = h.word32(i);
    }
    words
}

fn hash512_from_words(words: &[u32; 16]) -> Hash512 {
    let mut h = Hash512::zero();
    for (i, w) in words.iter().enumerate() {
        h.set_word32(i, *w);
    }
    h
}

/// Build a light cache of `num_items` 64-byte items from the epoch seed
/// using the RandMemoHash scheme: a sequential Keccak-512 fill followed by
/// [`LIGHT_CACHE_ROUNDS`] in-place mixing passes.
pub fn build_light_cache(seed: &Hash256, num_items: usize) -> Vec<Hash512> {
    let mut cache = Vec::with_capacity(num_items);
    let mut item = keccak512(seed.as_bytes());
    cache.push(item);
    for _ in 1..num_items {
        item = keccak512(item.as_bytes());
        cache.push(item);
    }

    let n = num_items;
    for _ in 0..LIGHT_CACHE_ROUNDS {
        for i in 0..n {
            // First index: left neighbour with wrap-around.
            // Second index: randomly selected by the item's first word.
            let v = cache[i].word32(0) as usize % n;
            let w = (n + i - 1) % n;
            cache[i] = keccak512(cache[w].bitxor(&cache[v]).as_bytes());
        }
    }
    cache
}

struct ItemState<'a> {
    cache: &'a [Hash512],
    num_cache_items: u64,
    seed: u32,
    mix: [u32; 16],
}

impl<'a> ItemState<'a> {
    fn new(cache: &'a [Hash512], index: u64) -> Self {
        let num_cache_items = cache.len() as u64;
        let seed = index as u32;
        let mut mix = hash512_words(&cache[(index % num_cache_items) as usize]);
        mix[0] ^= seed;
        let mix = hash512_words(&keccak512(hash512_from_words(&mix).as_bytes()));
        Self {
            cache,
            num_cache_items,
            seed,
            mix,
        }
    }

    fn update(&mut self, round: u32) {
        let t = fnv1(self.seed ^ round, self.mix[(round % 16) as usize]);
        let parent = (t as u64 % self.num_cache_items) as usize;
        let parent_words = hash512_words(&self.cache[parent]);
        for (m, p) in self.mix.iter_mut().zip(parent_words.iter()) {
            *m = fnv1(*m, *p);
        }
    }

    fn finalize(self) -> Hash512 {
        keccak512(hash512_from_words(&self.mix).as_bytes())
    }
}

/// Generate one 512-bit half of a full dataset item from the light cache
pub fn calculate_dataset_item_512(light_cache: &[Hash512], index: u64) -> Hash512 {
    let mut state = ItemState::new(light_cache, index);
    for round in 0..DATASET_PARENTS {
        state.update(round);
    }
    state.finalize()
}

/// Generate one 1024-bit full dataset item from the light cache
pub fn calculate_dataset_item_1024(light_cache: &[Hash512], index: u32) -> Hash1024 {
    let a = calculate_dataset_item_512(light_cache, index as u64 * 2);
    let b = calculate_dataset_item_512(light_cache, index as u64 * 2 + 1);
    Hash1024::from_halves(&a, &b)
}

/// Generate one 2048-bit dataset entry: two sequential 1024-bit items.
/// The 64-byte-lane mixing loop addresses the dataset in these entries.
pub fn calculate_dataset_item_2048(light_cache: &[Hash512], index: u32) -> Hash2048 {
    let a = calculate_dataset_item_1024(light_cache, index * 2);
    let b = calculate_dataset_item_1024(light_cache, index * 2 + 1);
    Hash2048::from_items(&a, &b)
}
