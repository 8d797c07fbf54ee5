//! Seedable randomness shared across selectors and pacing.
//!
//! A single [`SharedRng`] handle is cloned into the proxy selector, identity
//! provider, fingerprint catalog, and pacer so that a fixed seed reproduces
//! the whole selection and delay sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Builder;

#[derive(Debug, Clone)]
pub struct SharedRng {
    inner: Arc<Mutex<StdRng>>,
}

impl SharedRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StdRng> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Uniform index in `0..len`. `len` must be non-zero.
    pub fn index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.lock().gen_range(0..len)
    }

    /// Uniform index in `0..len` that differs from `avoid` whenever `len >= 2`.
    pub fn index_avoiding(&self, len: usize, avoid: Option<usize>) -> usize {
        match avoid {
            Some(skip) if len >= 2 && skip < len => {
                let pick = self.lock().gen_range(0..len - 1);
                if pick >= skip { pick + 1 } else { pick }
            }
            _ => self.index(len),
        }
    }

    /// Uniform integer in `low..=high`.
    pub fn range_u64(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        self.lock().gen_range(low..=high)
    }

    /// Uniform float in `[0, 1)`.
    pub fn unit(&self) -> f64 {
        self.lock().r#gen::<f64>()
    }

    pub fn next_u64(&self) -> u64 {
        self.lock().r#gen::<u64>()
    }

    /// Lowercase alphanumeric token of the given length.
    pub fn token(&self, len: usize) -> String {
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut rng = self.lock();
        (0..len)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    /// Random version-4 UUID string drawn from this generator.
    pub fn uuid_v4(&self) -> String {
        let mut bytes = [0u8; 16];
        self.lock().fill(&mut bytes);
        Builder::from_random_bytes(bytes).into_uuid().to_string()
    }
}

impl Default for SharedRng {
    fn default() -> Self {
        Self::from_entropy()
    }
}
