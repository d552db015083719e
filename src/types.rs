//! Core types for MeowPoW mining
//!
//! Fixed-width hash digests, the work package / solution pair exchanged
//! between pool and workers, device identity, and boundary arithmetic.
//! All word-level access is little-endian regardless of host; boundary
//! comparisons are byte-wise, which on the raw bytes is a big-endian
//! numeric compare.

use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

macro_rules! fixed_hash {
    ($(#[$doc:meta])* $name:ident, $size:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $size]);

        impl $name {
            /// Size of the digest in bytes
            pub const SIZE: usize = $size;

            /// The all-zero digest
            pub fn zero() -> Self {
                Self([0u8; $size])
            }

            /// Whether every byte is zero
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            /// Raw byte view
            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }

            /// Create from a byte slice of exactly `SIZE` bytes
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != $size {
                    return Err(Error::malformed_work(format!(
                        "invalid digest length: expected {} bytes, got {}",
                        $size,
                        bytes.len()
                    )));
                }
                let mut out = [0u8; $size];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            /// Create from a hex string (optional 0x prefix)
            pub fn from_hex(s: &str) -> Result<Self> {
                let s = s.trim_start_matches("0x");
                let bytes = hex::decode(s)
                    .map_err(|e| Error::malformed_work(format!("invalid hex digest: {}", e)))?;
                Self::from_bytes(&bytes)
            }

            /// Lowercase hex encoding without prefix
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Read the i-th 32-bit word (little-endian)
            pub fn word32(&self, i: usize) -> u32 {
                LittleEndian::read_u32(&self.0[i * 4..i * 4 + 4])
            }

            /// Write the i-th 32-bit word (little-endian)
            pub fn set_word32(&mut self, i: usize, value: u32) {
                LittleEndian::write_u32(&mut self.0[i * 4..i * 4 + 4], value);
            }

            /// Read the i-th 64-bit word (little-endian)
            pub fn word64(&self, i: usize) -> u64 {
                LittleEndian::read_u64(&self.0[i * 8..i * 8 + 8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::zero()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), hex::encode(&self.0[..4]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

fixed_hash!(
    /// 256-bit digest (headers, seeds, boundaries, mix hashes)
    Hash256,
    32
);
fixed_hash!(
    /// 512-bit digest (light cache items, hashimoto seeds)
    Hash512,
    64
);
fixed_hash!(
    /// 1024-bit full dataset item
    Hash1024,
    128
);
fixed_hash!(
    /// 2048-bit dataset entry used by the 64-byte-lane mixing loop
    Hash2048,
    256
);

impl Hash256 {
    /// Upper 64 bits of the digest interpreted as a big-endian number.
    /// This is the value GPU kernels compare search results against.
    pub fn upper64(&self) -> u64 {
        u64::from_be_bytes([
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7],
        ])
    }

    /// Abridged hex form for log lines
    pub fn abridged(&self) -> String {
        format!("{}…", hex::encode(&self.0[..4]))
    }
}

impl Serialize for Hash256 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("0x{}", self.to_hex()))
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl Hash512 {
    /// Byte-wise XOR of two digests
    pub fn bitxor(&self, other: &Hash512) -> Hash512 {
        let mut out = [0u8; 64];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Hash512(out)
    }
}

impl Hash1024 {
    /// Split into the two 512-bit halves it was generated from
    pub fn halves(&self) -> [Hash512; 2] {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        a.copy_from_slice(&self.0[..64]);
        b.copy_from_slice(&self.0[64..]);
        [Hash512(a), Hash512(b)]
    }

    /// Join two 512-bit halves
    pub fn from_halves(a: &Hash512, b: &Hash512) -> Hash1024 {
        let mut out = [0u8; 128];
        out[..64].copy_from_slice(&a.0);
        out[64..].copy_from_slice(&b.0);
        Hash1024(out)
    }
}

impl Hash2048 {
    /// Join two sequential 1024-bit dataset items
    pub fn from_items(a: &Hash1024, b: &Hash1024) -> Hash2048 {
        let mut out = [0u8; 256];
        out[..128].copy_from_slice(&a.0);
        out[128..].copy_from_slice(&b.0);
        Hash2048(out)
    }
}

/// Compute the boundary for a difficulty: `floor(2^256 / difficulty)`,
/// saturated to the all-ones digest. A zero difficulty also yields the
/// all-ones digest (no constraint).
pub fn boundary_from_difficulty(difficulty: &BigUint) -> Hash256 {
    let one = BigUint::from(1u8);
    if difficulty <= &one {
        return Hash256([0xff; 32]);
    }
    let quotient = (one << 256usize) / difficulty;
    let bytes = quotient.to_bytes_be();
    let mut out = [0u8; 32];
    if bytes.len() >= 32 {
        out.copy_from_slice(&bytes[bytes.len() - 32..]);
    } else {
        out[32 - bytes.len()..].copy_from_slice(&bytes);
    }
    Hash256(out)
}

/// Expected number of hashes to find a digest below `boundary`, for display
pub fn hashes_to_boundary(boundary: &Hash256) -> f64 {
    // 2^256 / boundary, evaluated on the top 128 bits
    let mut top = 0f64;
    for b in boundary.0.iter().take(16) {
        top = top * 256.0 + *b as f64;
    }
    if top == 0.0 {
        return f64::MAX;
    }
    // 2^256 / (top * 2^128) == 2^128 / top
    2f64.powi(128) / top
}

/// A mining job snapshot as received from a pool.
///
/// The zero header is the canonical "no work, pause" sentinel; use
/// [`WorkPackage::is_present`] instead of checking fields directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkPackage {
    /// Opaque job identifier assigned by the pool
    pub job_id: String,
    /// Header hash to be mined
    pub header: Hash256,
    /// Share boundary requested by the pool
    pub boundary: Hash256,
    /// Block boundary, zero when the pool did not provide one
    pub block_boundary: Hash256,
    /// Epoch seed hash, zero when the pool did not provide one
    pub seed: Hash256,
    /// Epoch number, derived from `block` when absent
    pub epoch: Option<u32>,
    /// Block height
    pub block: Option<u64>,
    /// First nonce of this job's search range
    pub start_nonce: u64,
    /// Size in bytes of the pool-assigned extra nonce prefix
    pub extra_nonce_size: u16,
    /// Mining algorithm tag
    pub algo: String,
}

impl Default for WorkPackage {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            header: Hash256::zero(),
            boundary: Hash256::zero(),
            block_boundary: Hash256::zero(),
            seed: Hash256::zero(),
            epoch: None,
            block: None,
            start_nonce: 0,
            extra_nonce_size: 0,
            algo: "meowpow".to_string(),
        }
    }
}

impl WorkPackage {
    /// Whether this package carries actual work (a non-zero header)
    pub fn is_present(&self) -> bool {
        !self.header.is_zero()
    }

    /// The boundary to mine against: the max of the share boundary and the
    /// block boundary when both are set (the larger, easier target).
    pub fn effective_boundary(&self) -> Hash256 {
        if self.block_boundary.is_zero() {
            self.boundary
        } else if self.boundary < self.block_boundary {
            self.block_boundary
        } else {
            self.boundary
        }
    }
}

/// A found nonce together with the work it refers to
#[derive(Clone, Debug)]
pub struct Solution {
    /// Winning nonce
    pub nonce: u64,
    /// Mix hash produced by the memory-hard loop
    pub mix_hash: Hash256,
    /// The work package this solution answers
    pub work: WorkPackage,
    /// When the solution was found
    pub found_at: Instant,
    /// Index of the originating worker
    pub miner_index: usize,
}

/// Kind of compute device behind a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// NVIDIA CUDA device
    Cuda,
    /// OpenCL device
    OpenCl,
    /// Other accelerator
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda"),
            DeviceKind::OpenCl => write!(f, "opencl"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Identity and capability hints for one compute device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable identifier; for GPUs this is the PCI id
    pub unique_id: String,
    /// Human readable device name
    pub name: String,
    /// Backend kind
    pub kind: DeviceKind,
    /// Total device memory in bytes
    pub total_memory: usize,
    /// Free device memory in bytes at enumeration time
    pub free_memory: usize,
    /// Compute capability major version (zero when not applicable)
    pub compute_major: u32,
    /// Compute capability minor version
    pub compute_minor: u32,
    /// Largest supported workgroup / block size
    pub max_workgroup_size: u32,
}

/// Hash rate in hashes per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Create a new hash rate
    pub fn new(rate: f64) -> Self {
        Self(rate)
    }

    /// Get the rate value
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["H/s", "KH/s", "MH/s", "GH/s", "TH/s"];
        let mut rate = self.0;
        let mut unit = 0;
        while rate >= 1000.0 && unit < UNITS.len() - 1 {
            rate /= 1000.0;
            unit += 1;
        }
        write!(f, "{:.2} {}", rate, UNITS[unit])
    }
}
