//! Stable FNV-1a hashing for executable fingerprints.
//!
//! Fingerprints must agree across processes and builds, so the std
//! `DefaultHasher` is not an option here.

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Incremental fingerprint over several byte segments.
///
/// Each segment is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    state: u64,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            state: fnv1a_init(),
        }
    }

    pub fn segment(mut self, bytes: &[u8]) -> Self {
        self.state = fnv1a_bytes(self.state, &(bytes.len() as u64).to_le_bytes());
        self.state = fnv1a_bytes(self.state, bytes);
        self
    }

    pub fn finish(self) -> u64 {
        self.state
    }

    pub fn finish_hex(self) -> String {
        fingerprint_hex(self.state)
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a fingerprint as 16 lowercase hex digits.
pub fn fingerprint_hex(value: u64) -> String {
    format!("{value:016x}")
}
