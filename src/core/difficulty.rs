use crate::config::ConsensusSettings;
use crate::core::Block;
use log::info;
use num_bigint::BigUint;

/// Targets are 256-bit big-endian magnitudes
pub const TARGET_BYTES: usize = 32;

/// Build the target for a difficulty level by clearing the `level` most
/// significant bits of an all-ones 256-bit value
pub fn make_difficulty_target(level: u32) -> Vec<u8> {
    let mut target = vec![0xffu8; TARGET_BYTES];
    for i in 0..(level as usize).min(TARGET_BYTES * 8) {
        target[i / 8] &= !(1u8 << (7 - i % 8));
    }
    target
}

/// Numeric score of a hash or target, read as a big-endian magnitude
pub fn score_of(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// A hash is valid work when its score does not exceed the target's
pub fn meets_target(hash: &[u8], target: &[u8]) -> bool {
    score_of(hash) <= score_of(target)
}

fn max_target() -> BigUint {
    (BigUint::from(1u8) << (TARGET_BYTES * 8)) - BigUint::from(1u8)
}

fn target_to_bytes(value: &BigUint) -> Vec<u8> {
    let raw = value.to_bytes_be();
    let mut bytes = vec![0u8; TARGET_BYTES.saturating_sub(raw.len())];
    bytes.extend_from_slice(&raw);
    bytes
}

/// Epoch-based difficulty retargeting
///
/// Every block records `interval_total`, the milliseconds elapsed since the
/// last retarget. When the parent's chain length is a multiple of
/// `blocks_per_difficulty`, the child rescales the parent's target by the
/// average interval over the target interval and starts a fresh total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DifficultyAdjustment {
    blocks_per_difficulty: u64,
    target_interval_ms: u64,
}

impl DifficultyAdjustment {
    pub fn new(blocks_per_difficulty: u64, target_interval_ms: u64) -> DifficultyAdjustment {
        DifficultyAdjustment {
            blocks_per_difficulty: blocks_per_difficulty.max(1),
            target_interval_ms: target_interval_ms.max(1),
        }
    }

    pub fn from_settings(settings: &ConsensusSettings) -> DifficultyAdjustment {
        Self::new(settings.blocks_per_difficulty, settings.target_interval_ms)
    }

    pub fn get_blocks_per_difficulty(&self) -> u64 {
        self.blocks_per_difficulty
    }

    pub fn get_target_interval(&self) -> u64 {
        self.target_interval_ms
    }

    /// Whether the block following a chain of `length` blocks retargets
    pub fn is_adjustment_height(&self, length: u64) -> bool {
        length > 0 && length % self.blocks_per_difficulty == 0
    }

    /// Scale `prev` by `avg_interval / target_interval`, rounding down.
    ///
    /// Slow blocks raise the target (easier), fast blocks lower it. The
    /// result stays within `[1, 2^256 - 1]`.
    pub fn adjust_difficulty(
        &self,
        last_length: u64,
        avg_interval: u64,
        prev: &[u8],
    ) -> Vec<u8> {
        let target = self.target_interval_ms;
        let mut next = score_of(prev) * BigUint::from(avg_interval) / BigUint::from(target);
        if next == BigUint::from(0u8) {
            next = BigUint::from(1u8);
        }
        let ceiling = max_target();
        if next > ceiling {
            next = ceiling;
        }

        info!(
            "Retarget after length {last_length}: average interval {avg_interval}ms \
             against {target}ms"
        );
        target_to_bytes(&next)
    }

    /// Difficulty target and interval total a child of `parent` mined at
    /// `timestamp` must carry
    pub fn next_work(&self, parent: &Block, timestamp: i64) -> (Vec<u8>, i64) {
        let interval = timestamp.saturating_sub(parent.get_timestamp()).max(0);
        let total = parent.get_interval_total().saturating_add(interval);

        if self.is_adjustment_height(parent.length()) {
            let avg = total as u64 / self.blocks_per_difficulty;
            let difficulty = self.adjust_difficulty(parent.length(), avg, parent.get_difficulty());
            (difficulty, 0)
        } else {
            (parent.get_difficulty().to_vec(), total)
        }
    }
}
