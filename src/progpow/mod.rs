//! MeowPoW hashing engine
//!
//! The ProgPoW-family inner loop: a KISS99-derived random program, fixed per
//! period of [`PERIOD_LENGTH`] blocks, drives register math, L1 cache reads
//! and 2048-bit DAG loads over a 16-lane, 32-register mix state. The outer
//! construction is hashimoto-shaped: a Keccak-512 seed over header and
//! nonce, the memory-hard mix, and a final Keccak-256 over seed and mix.
//!
//! The engine is pure; the only failure modes are the three verification
//! outcomes.

use crate::ethash::{fnv1a, keccak256, keccak512, EpochContext, EpochContextCache,
    FNV_OFFSET_BASIS, NUM_DATASET_ACCESSES};
use crate::types::{Hash2048, Hash256, Hash512};
use crate::Result;

pub mod kernel;

pub use kernel::{kernel_source, KernelDialect};

/// Blocks sharing one random program
pub const PERIOD_LENGTH: u64 = 10;
/// Parallel lanes of the mix state
pub const NUM_LANES: usize = 16;
/// 32-bit registers per lane
pub const NUM_REGS: usize = 32;
/// 32-bit words each lane takes from a DAG entry per round
pub const NUM_DAG_LOADS: usize = 4;
/// Random L1 cache accesses per round
pub const NUM_CACHE_ACCESSES: usize = 11;
/// Random math operations per round
pub const NUM_MATH_OPERATIONS: usize = 18;

/// Period number for a block height
pub fn period_from_block(block: u64) -> u64 {
    block / PERIOD_LENGTH
}

/// KISS99 PRNG (Marsaglia). Drives both the per-period program and the
/// per-nonce lane initialization; must match the kernel generator bit-exactly.
#[derive(Clone, Debug)]
pub struct Kiss99 {
    z: u32,
    w: u32,
    jsr: u32,
    jcong: u32,
}

impl Kiss99 {
    /// Create from the four state words
    pub fn new(z: u32, w: u32, jsr: u32, jcong: u32) -> Self {
        Self { z, w, jsr, jcong }
    }

    /// Next 32-bit output
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        self.z = 36969u32
            .wrapping_mul(self.z & 0xffff)
            .wrapping_add(self.z >> 16);
        self.w = 18000u32
            .wrapping_mul(self.w & 0xffff)
            .wrapping_add(self.w >> 16);
        let mwc = (self.z << 16).wrapping_add(self.w);
        self.jsr ^= self.jsr << 17;
        self.jsr ^= self.jsr >> 13;
        self.jsr ^= self.jsr << 5;
        self.jcong = 69069u32.wrapping_mul(self.jcong).wrapping_add(1234567);
        (mwc ^ self.jcong).wrapping_add(self.jsr)
    }
}

/// Random program state for one period: the KISS99 stream plus shuffled
/// register destination/source sequences. Each round starts from a fresh
/// copy so the program is identical across all rounds of a hash.
#[derive(Clone)]
pub(crate) struct MixRngState {
    rng: Kiss99,
    dst_seq: [usize; NUM_REGS],
    src_seq: [usize; NUM_REGS],
    dst_counter: usize,
    src_counter: usize,
}

impl MixRngState {
    pub(crate) fn new(period: u64) -> Self {
        let z = fnv1a(FNV_OFFSET_BASIS, period as u32);
        let w = fnv1a(z, (period >> 32) as u32);
        let jsr = fnv1a(w, period as u32);
        let jcong = fnv1a(jsr, (period >> 32) as u32);
        let mut rng = Kiss99::new(z, w, jsr, jcong);

        let mut dst_seq = [0usize; NUM_REGS];
        let mut src_seq = [0usize; NUM_REGS];
        for i in 0..NUM_REGS {
            dst_seq[i] = i;
            src_seq[i] = i;
        }
        // Fisher-Yates driven by the program stream
        for i in (1..NUM_REGS).rev() {
            let j = rng.next() as usize % (i + 1);
            dst_seq.swap(i, j);
            let j = rng.next() as usize % (i + 1);
            src_seq.swap(i, j);
        }

        Self {
            rng,
            dst_seq,
            src_seq,
            dst_counter: 0,
            src_counter: 0,
        }
    }

    pub(crate) fn next_dst(&mut self) -> usize {
        let r = self.dst_seq[self.dst_counter % NUM_REGS];
        self.dst_counter += 1;
        r
    }

    pub(crate) fn next_src(&mut self) -> usize {
        let r = self.src_seq[self.src_counter % NUM_REGS];
        self.src_counter += 1;
        r
    }

    pub(crate) fn rng_next(&mut self) -> u32 {
        self.rng.next()
    }
}

/// One of the eleven random math operations, selected by `selector % 11`
pub(crate) fn random_math(a: u32, b: u32, selector: u32) -> u32 {
    match selector % 11 {
        0 => a.wrapping_add(b),
        1 => a.wrapping_mul(b),
        2 => ((a as u64 * b as u64) >> 32) as u32,
        3 => a.min(b),
        4 => a.rotate_left(b),
        5 => a.rotate_right(b),
        6 => a & b,
        7 => a | b,
        8 => a ^ b,
        9 => a.leading_zeros() + b.leading_zeros(),
        10 => a.count_ones() + b.count_ones(),
        _ => unreachable!(),
    }
}

/// Merge new data into an accumulator without ever zeroing it out,
/// selected by `selector % 4`
pub(crate) fn random_merge(a: u32, b: u32, selector: u32) -> u32 {
    match selector % 4 {
        0 => a.wrapping_mul(33).wrapping_add(b),
        1 => (a ^ b).wrapping_mul(33),
        2 => a.rotate_left(((selector >> 16) % 31) + 1) ^ b,
        _ => a.rotate_right(((selector >> 16) % 31) + 1) ^ b,
    }
}

fn fill_mix(lane_seed: u64, lane_id: u32) -> [u32; NUM_REGS] {
    let z = fnv1a(FNV_OFFSET_BASIS, lane_seed as u32);
    let w = fnv1a(z, (lane_seed >> 32) as u32);
    let jsr = fnv1a(w, lane_id);
    let jcong = fnv1a(jsr, lane_id);
    let mut rng = Kiss99::new(z, w, jsr, jcong);

    let mut mix = [0u32; NUM_REGS];
    for reg in mix.iter_mut() {
        *reg = rng.next();
    }
    mix
}

fn round<F>(
    l1_cache: &[u32],
    num_entries: u32,
    lookup: &mut F,
    r: u32,
    mix: &mut [[u32; NUM_REGS]; NUM_LANES],
    mut state: MixRngState,
) where
    F: FnMut(u32) -> Hash2048,
{
    let entry_index = mix[r as usize % NUM_LANES][0] % num_entries;
    let entry = lookup(entry_index);

    let max_ops = NUM_CACHE_ACCESSES.max(NUM_MATH_OPERATIONS);
    for i in 0..max_ops {
        if i < NUM_CACHE_ACCESSES {
            let src = state.next_src();
            let dst = state.next_dst();
            let sel = state.rng_next();
            for lane in mix.iter_mut() {
                let offset = lane[src] as usize % l1_cache.len();
                lane[dst] = random_merge(lane[dst], l1_cache[offset], sel);
            }
        }
        if i < NUM_MATH_OPERATIONS {
            // Two distinct source registers
            let src_rnd = state.rng_next() as usize % (NUM_REGS * (NUM_REGS - 1));
            let src1 = src_rnd % NUM_REGS;
            let mut src2 = src_rnd / NUM_REGS;
            if src2 >= src1 {
                src2 += 1;
            }
            let sel1 = state.rng_next();
            let dst = state.next_dst();
            let sel2 = state.rng_next();
            for lane in mix.iter_mut() {
                let data = random_math(lane[src1], lane[src2], sel1);
                lane[dst] = random_merge(lane[dst], data, sel2);
            }
        }
    }

    // Merge the DAG entry, each lane consuming a rotated word window.
    // One selector per word, shared by every lane, so a compiled kernel
    // (single instruction stream across lanes) reproduces this exactly.
    for i in 0..NUM_DAG_LOADS {
        let sel = state.rng_next();
        for (l, lane) in mix.iter_mut().enumerate() {
            let offset = ((l as u32 ^ r) as usize % NUM_LANES) * NUM_DAG_LOADS + i;
            lane[i] = random_merge(lane[i], entry.word32(offset), sel);
        }
    }
}

/// The hashimoto seed: Keccak-512 over header and little-endian nonce
pub fn hash_seed(header: &Hash256, nonce: u64) -> Hash512 {
    let mut data = [0u8; 40];
    data[..32].copy_from_slice(header.as_bytes());
    data[32..].copy_from_slice(&nonce.to_le_bytes());
    keccak512(&data)
}

/// The final hash: Keccak-256 over the seed and the mix hash
pub fn hash_final(seed: &Hash512, mix_hash: &Hash256) -> Hash256 {
    let mut data = [0u8; 96];
    data[..64].copy_from_slice(seed.as_bytes());
    data[64..].copy_from_slice(mix_hash.as_bytes());
    keccak256(&data)
}

/// Run the memory-hard mixing loop against arbitrary dataset storage.
/// `lookup` resolves a 2048-bit entry index; callers decide whether that
/// reads device memory, the host slab or synthesizes from the light cache.
pub(crate) fn hash_mix_with<F>(
    l1_cache: &[u32],
    num_entries: u32,
    mut lookup: F,
    period: u64,
    seed: &Hash512,
) -> Hash256
where
    F: FnMut(u32) -> Hash2048,
{
    let lane_seed = seed.word64(0);
    let mut mix = [[0u32; NUM_REGS]; NUM_LANES];
    for (lane_id, lane) in mix.iter_mut().enumerate() {
        *lane = fill_mix(lane_seed, lane_id as u32);
    }

    let state = MixRngState::new(period);
    for r in 0..NUM_DATASET_ACCESSES {
        round(l1_cache, num_entries, &mut lookup, r as u32, &mut mix, state.clone());
    }

    // Per-lane FNV reduction, then fold the lanes into eight words
    let mut lane_hash = [FNV_OFFSET_BASIS; NUM_LANES];
    for (l, lane) in mix.iter().enumerate() {
        for reg in lane.iter() {
            lane_hash[l] = fnv1a(lane_hash[l], *reg);
        }
    }
    let mut words = [FNV_OFFSET_BASIS; 8];
    for (l, lh) in lane_hash.iter().enumerate() {
        words[l % 8] = fnv1a(words[l % 8], *lh);
    }

    let mut compressed = [0u8; 32];
    for (i, w) in words.iter().enumerate() {
        compressed[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    keccak256(&compressed)
}

/// The mixing loop over an epoch context (lazy dataset lookups)
pub fn hash_mix(context: &EpochContext, period: u64, seed: &Hash512) -> Hash256 {
    hash_mix_with(
        context.l1_cache(),
        context.num_dataset_entries(),
        |index| context.dataset_entry_2048(index),
        period,
        seed,
    )
}

/// Outcome of a full hash round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowResult {
    /// Hash compared against the boundary
    pub final_hash: Hash256,
    /// Mix digest proving the memory-hard work
    pub mix_hash: Hash256,
}

/// Perform a full MeowPoW round for one nonce
pub fn hash(context: &EpochContext, block_number: u64, header: &Hash256, nonce: u64) -> PowResult {
    let seed = hash_seed(header, nonce);
    let mix_hash = hash_mix(context, period_from_block(block_number), &seed);
    let final_hash = hash_final(&seed, &mix_hash);
    PowResult {
        final_hash,
        mix_hash,
    }
}

/// Verification outcomes for a submitted solution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationResult {
    /// Solution is valid
    Ok,
    /// Final hash is above the boundary
    InvalidNonce,
    /// Provided mix hash does not match the recomputed mix
    InvalidMixHash,
}

/// Cheap verification trusting the provided mix hash: recomputes only the
/// seed and final hash and compares against the boundary byte-wise.
pub fn verify_light(header: &Hash256, mix_hash: &Hash256, nonce: u64, boundary: &Hash256) -> bool {
    let seed = hash_seed(header, nonce);
    hash_final(&seed, mix_hash) <= *boundary
}

/// Full verification: recomputes the mix through the memory-hard loop.
/// A mix mismatch is reported before the boundary is ever consulted.
pub fn verify_full(
    context: &EpochContext,
    block_number: u64,
    header: &Hash256,
    mix_hash: &Hash256,
    nonce: u64,
    boundary: &Hash256,
) -> VerificationResult {
    let seed = hash_seed(header, nonce);
    let mix = hash_mix(context, period_from_block(block_number), &seed);
    if mix != *mix_hash {
        return VerificationResult::InvalidMixHash;
    }
    if hash_final(&seed, &mix) > *boundary {
        return VerificationResult::InvalidNonce;
    }
    VerificationResult::Ok
}

/// Full verification resolving the epoch context from the block number
/// through the shared cache (built on first demand).
pub fn verify_full_for_block(
    cache: &EpochContextCache,
    block_number: u64,
    header: &Hash256,
    mix_hash: &Hash256,
    nonce: u64,
    boundary: &Hash256,
) -> Result<VerificationResult> {
    let context = cache.get(crate::ethash::epoch_from_block(block_number), false)?;
    Ok(verify_full(
        &context,
        block_number,
        header,
        mix_hash,
        nonce,
        boundary,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethash::EpochContext;

    fn tiny_context() -> EpochContext {
        EpochContext::build_for_tests(0, 61, 512)
    }

    #[test]
    fn test_kiss99_reference_vector() {
        // Test vector from the ProgPoW specification
        let mut rng = Kiss99::new(362436069, 521288629, 123456789, 380116160);
        assert_eq!(rng.next(), 769445856);
        assert_eq!(rng.next(), 742012328);
        assert_eq!(rng.next(), 2121196314);
        assert_eq!(rng.next(), 2805620942);
        let mut rng = Kiss99::new(362436069, 521288629, 123456789, 380116160);
        let mut last = 0;
        for _ in 0..100_000 {
            last = rng.next();
        }
        assert_eq!(last, 941074834);
    }

    #[test]
    fn test_random_math_operations() {
        assert_eq!(random_math(7, 3, 0), 10);
        assert_eq!(random_math(7, 3, 1), 21);
        assert_eq!(random_math(0x8000_0000, 4, 2), 2); // mul_hi
        assert_eq!(random_math(7, 3, 3), 3);
        assert_eq!(random_math(1, 1, 4), 2); // rotl
        assert_eq!(random_math(0xf0, 0x0f, 6), 0);
        assert_eq!(random_math(0xf0, 0x0f, 7), 0xff);
        assert_eq!(random_math(0xff, 0xff, 8), 0);
        assert_eq!(random_math(1, 1, 9), 62); // clz + clz
        assert_eq!(random_math(0xff, 0xff, 10), 16); // popcount + popcount
    }

    #[test]
    fn test_random_merge_never_discards_accumulator() {
        // With b == 0 every merge variant must still depend on a
        for sel in 0..4u32 {
            assert_ne!(random_merge(0xdeadbeef, 0, sel), 0);
        }
    }

    #[test]
    fn test_mix_program_is_period_stable() {
        let mut a = MixRngState::new(7);
        let mut b = MixRngState::new(7);
        for _ in 0..16 {
            assert_eq!(a.next_dst(), b.next_dst());
            assert_eq!(a.next_src(), b.next_src());
            assert_eq!(a.rng_next(), b.rng_next());
        }

        // A different period yields a different program stream
        let mut a = MixRngState::new(7);
        let mut c = MixRngState::new(8);
        let stream_a: Vec<u32> = (0..8).map(|_| a.rng_next()).collect();
        let stream_c: Vec<u32> = (0..8).map(|_| c.rng_next()).collect();
        assert_ne!(stream_a, stream_c);
    }

    #[test]
    fn test_hash_matches_explicit_mix() {
        let ctx = tiny_context();
        let header = Hash256::from_hex(
            "2a000000000000000000000000000000000000000000000000000000000000aa",
        )
        .unwrap();
        let nonce = 0x1234_5678_9abc_def0u64;
        let block = 123u64;

        let result = hash(&ctx, block, &header, nonce);
        let seed = hash_seed(&header, nonce);
        let mix = hash_mix(&ctx, period_from_block(block), &seed);
        assert_eq!(result.mix_hash, mix);
        assert_eq!(result.final_hash, hash_final(&seed, &mix));
    }

    #[test]
    fn test_hash_is_deterministic_and_nonce_sensitive() {
        let ctx = tiny_context();
        let header = Hash256::zero();

        let a = hash(&ctx, 5, &header, 0);
        let b = hash(&ctx, 5, &header, 0);
        let c = hash(&ctx, 5, &header, 1);
        assert_eq!(a, b);
        assert_ne!(a.final_hash, c.final_hash);

        // Different periods run different programs
        let d = hash(&ctx, 5 + PERIOD_LENGTH, &header, 0);
        assert_ne!(a.mix_hash, d.mix_hash);
    }

    #[test]
    fn test_verify_light_rejects_hard_boundary() {
        let header = Hash256([0x11; 32]);
        let mix = Hash256::zero();
        let mut boundary = Hash256::zero();
        boundary.0[31] = 0x01;
        assert!(!verify_light(&header, &mix, 0, &boundary));
    }

    #[test]
    fn test_verify_light_accepts_max_boundary() {
        let header = Hash256([0x11; 32]);
        let mix = Hash256::zero();
        let boundary = Hash256([0xff; 32]);
        assert!(verify_light(&header, &mix, 0, &boundary));
    }

    #[test]
    fn test_verify_full_outcomes() {
        let ctx = tiny_context();
        let header = Hash256([0x42; 32]);
        let nonce = 99u64;
        let block = 17u64;
        let result = hash(&ctx, block, &header, nonce);

        // Correct mix, permissive boundary
        let easy = Hash256([0xff; 32]);
        assert_eq!(
            verify_full(&ctx, block, &header, &result.mix_hash, nonce, &easy),
            VerificationResult::Ok
        );

        // One flipped byte in the mix must be InvalidMixHash, never InvalidNonce
        let mut tampered = result.mix_hash;
        tampered.0[13] ^= 0x01;
        let mut hard = Hash256::zero();
        hard.0[31] = 0x01;
        assert_eq!(
            verify_full(&ctx, block, &header, &tampered, nonce, &hard),
            VerificationResult::InvalidMixHash
        );

        // Correct mix against an unreachable boundary is InvalidNonce
        assert_eq!(
            verify_full(&ctx, block, &header, &result.mix_hash, nonce, &hard),
            VerificationResult::InvalidNonce
        );
    }

    #[test]
    fn test_verify_full_for_block_uses_cached_context() {
        let cache = EpochContextCache::new();
        cache.insert(std::sync::Arc::new(tiny_context()));

        let header = Hash256([0x09; 32]);
        let result = hash(&cache.get(0, false).unwrap(), 25, &header, 4);
        let easy = Hash256([0xff; 32]);
        assert_eq!(
            verify_full_for_block(&cache, 25, &header, &result.mix_hash, 4, &easy).unwrap(),
            VerificationResult::Ok
        );
    }

    #[test]
    fn test_valid_solution_round_trips_both_verifiers() {
        let ctx = tiny_context();
        let header = Hash256([0x07; 32]);
        let block = 3u64;
        let easy = Hash256([0xff; 32]);

        let result = hash(&ctx, block, &header, 1);
        assert!(verify_light(&header, &result.mix_hash, 1, &easy));
        assert_eq!(
            verify_full(&ctx, block, &header, &result.mix_hash, 1, &easy),
            VerificationResult::Ok
        );
    }
}
