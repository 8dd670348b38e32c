/// Ledger monetary system
///
/// Values are integer satoshis. The block subsidy follows an epoch-stepped
/// schedule: the base reward is divided by `(height / blocks_per_halving) + 1`,
/// so the first epoch pays the full base, the second half of it, the third a
/// third of it, and so on.
///
/// Number of satoshis in one coin
pub const SATOSHIS_PER_COIN: u64 = 100_000_000;

/// Initial block reward in satoshis (50 coins)
pub const INITIAL_BLOCK_REWARD: u64 = 50 * SATOSHIS_PER_COIN;

/// Subsidy for the block at `height`
///
/// # Examples
/// ```
/// use proof_ledger::core::monetary::compute_reward;
/// assert_eq!(compute_reward(0, 100, 600), 600);
/// assert_eq!(compute_reward(100, 100, 600), 300);
/// assert_eq!(compute_reward(250, 100, 600), 200);
/// ```
pub fn compute_reward(height: u64, blocks_per_halving: u64, base: u64) -> u64 {
    let epoch = height / blocks_per_halving.max(1);
    base / epoch.saturating_add(1)
}

/// Utility functions for monetary conversions
pub mod conversions {
    use super::*;

    /// Convert satoshis to coins
    pub fn satoshis_to_coins(satoshis: u64) -> f64 {
        satoshis as f64 / SATOSHIS_PER_COIN as f64
    }

    /// Format satoshis as a human-readable string
    ///
    /// # Examples
    /// ```
    /// use proof_ledger::core::monetary::conversions::format_satoshis;
    /// assert_eq!(format_satoshis(100_000_000), "1.00000000 coins");
    /// assert_eq!(format_satoshis(1_000), "0.00001000 coins");
    /// ```
    pub fn format_satoshis(satoshis: u64) -> String {
        format!("{:.8} coins", satoshis_to_coins(satoshis))
    }
}

#[cfg(test)]
mod tests {
    use super::conversions::*;
    use super::*;

    #[test]
    fn test_monetary_constants() {
        assert_eq!(SATOSHIS_PER_COIN, 100_000_000);
        assert_eq!(INITIAL_BLOCK_REWARD, 50 * SATOSHIS_PER_COIN);
    }

    #[test]
    fn test_reward_is_epoch_stepped() {
        let base = INITIAL_BLOCK_REWARD;
        // constant within an epoch
        assert_eq!(compute_reward(0, 210_000, base), base);
        assert_eq!(compute_reward(209_999, 210_000, base), base);
        // divisor grows by one per epoch
        assert_eq!(compute_reward(210_000, 210_000, base), base / 2);
        assert_eq!(compute_reward(420_000, 210_000, base), base / 3);
        assert_eq!(compute_reward(2_100_000, 210_000, base), base / 11);
    }

    #[test]
    fn test_reward_rounds_down_and_tolerates_zero_epoch() {
        assert_eq!(compute_reward(20, 10, 10), 3);
        assert_eq!(compute_reward(5, 0, 10), 10 / 6);
        assert_eq!(compute_reward(u64::MAX, 1, 10), 0);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(satoshis_to_coins(SATOSHIS_PER_COIN), 1.0);
        assert_eq!(format_satoshis(SATOSHIS_PER_COIN / 2), "0.50000000 coins");
    }
}
