use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::AccountId;

/// Block-level inputs available when a draw executes.
///
/// This is best-effort randomness. Whoever produces the block, or picks the
/// moment the administrator's call lands, can bias the outcome.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrawEntropy {
    pub timestamp: u64,
    pub difficulty: u64,
}

impl DrawEntropy {
    pub fn new(timestamp: u64, difficulty: u64) -> Self {
        Self {
            timestamp,
            difficulty,
        }
    }

    /// Hashes the block inputs, the caller and the entrant list into a seed.
    pub fn seed(&self, caller: &AccountId, entrants: &[AccountId]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"pot-lottery-draw");
        hasher.update(self.difficulty.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        update_prefixed(&mut hasher, caller.as_bytes());
        hasher.update((entrants.len() as u64).to_be_bytes());
        for entrant in entrants {
            update_prefixed(&mut hasher, entrant.as_bytes());
        }
        hasher.finalize().into()
    }

    /// Index of the winning entry, or `None` when nobody has entered.
    pub fn draw_index(&self, caller: &AccountId, entrants: &[AccountId]) -> Option<usize> {
        if entrants.is_empty() {
            return None;
        }
        Some(reduce(&self.seed(caller, entrants), entrants.len()))
    }
}

pub(crate) fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Reads `seed` as a big-endian 256-bit integer and reduces it modulo `modulus`.
pub fn reduce(seed: &[u8; 32], modulus: usize) -> usize {
    assert!(modulus > 0, "modulus must be non-zero");
    let m = modulus as u128;
    // acc < m <= 2^64, so acc * 256 + 255 stays well inside u128.
    seed.iter()
        .fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % m) as usize
}
