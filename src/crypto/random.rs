//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source.

use rand::{CryptoRng, RngCore};
use rand_core::OsRng;

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u64.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Get an RNG instance that implements CryptoRng.
    pub fn rng() -> impl RngCore + CryptoRng {
        OsRng
    }
}

/// Random delay in `[min_ms, max_ms)`, used to spread reconnect attempts.
pub fn random_delay_ms(min_ms: u64, max_ms: u64) -> u64 {
    if min_ms >= max_ms {
        return min_ms;
    }
    min_ms + SecureRandom::u64() % (max_ms - min_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_secure_random_fill() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];

        SecureRandom::fill(&mut buf1);
        SecureRandom::fill(&mut buf2);

        // Should not produce all zeros
        assert!(!buf1.iter().all(|&b| b == 0));
        assert!(!buf2.iter().all(|&b| b == 0));

        // Should produce different values each time
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_secure_random_bytes() {
        let bytes1: [u8; 16] = SecureRandom::bytes();
        let bytes2: [u8; 16] = SecureRandom::bytes();

        assert_ne!(bytes1, bytes2);
    }

    #[test]
    fn test_random_delay() {
        let mut delays: HashSet<u64> = HashSet::new();
        for _ in 0..100 {
            let delay = random_delay_ms(100, 1000);
            assert!((100..1000).contains(&delay));
            delays.insert(delay);
        }
        assert!(delays.len() > 1);

        assert_eq!(random_delay_ms(200, 100), 200);
    }
}
