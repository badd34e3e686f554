//! Small shared helpers.

use rand::Rng;

/// Sleep length for one beacon cycle: the base interval plus a random
/// jitter of up to `jitter` seconds.
pub fn random_jitter(base: u64, jitter: u64) -> u64 {
    base + rand::rng().random_range(0..=jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_jitter_bounds() {
        for _ in 0..100 {
            let value = random_jitter(5, 3);
            assert!((5..=8).contains(&value), "out of range: {}", value);
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        assert_eq!(random_jitter(7, 0), 7);
    }
}
