// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives stimulus exploration, model initialization and posterior noise,
// and keeps every test reproducible from a seed.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    /// Seeded from the wall clock when no explicit seed is configured.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::new(nanos ^ 0xD1B54A32D192ED03)
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self::new(s),
            None => Self::from_time(),
        }
    }

    /// Derive an independent generator (for handing to a worker thread).
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64() ^ 0xA0761D6478BD642F)
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32();
        (x as f32) / (u32::MAX as f32 + 1.0)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        let v = self.next_u64() % span;
        low + v as usize
    }

    /// Uniform index in `0..len`, or `None` for an empty range.
    #[inline]
    pub fn gen_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            None
        } else {
            Some(self.gen_range_usize(0, len))
        }
    }

    /// Standard normal sample (Box-Muller).
    pub fn next_gaussian(&mut self) -> f32 {
        let u1 = self.next_f32_01().max(f32::MIN_POSITIVE);
        let u2 = self.next_f32_01();
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    }

    /// Draw an index from unnormalized non-negative weights.
    pub fn sample_weighted(&mut self, weights: &[f32]) -> Option<usize> {
        let total: f32 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
        if total <= 0.0 {
            return self.gen_index(weights.len());
        }
        let mut pick = self.next_f32_01() * total;
        for (i, &w) in weights.iter().enumerate() {
            if !(w.is_finite() && w > 0.0) {
                continue;
            }
            if pick < w {
                return Some(i);
            }
            pick -= w;
        }
        weights.iter().rposition(|w| w.is_finite() && *w > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn gen_index_stays_in_range() {
        let mut rng = Prng::new(3);
        assert_eq!(rng.gen_index(0), None);
        for _ in 0..1000 {
            let i = rng.gen_index(5).unwrap();
            assert!(i < 5);
        }
    }

    #[test]
    fn weighted_sampling_ignores_zero_weights() {
        let mut rng = Prng::new(11);
        for _ in 0..500 {
            let i = rng.sample_weighted(&[0.0, 1.0, 0.0, 3.0]).unwrap();
            assert!(i == 1 || i == 3);
        }
    }

    #[test]
    fn gaussian_has_roughly_zero_mean() {
        let mut rng = Prng::new(5);
        let n = 20_000;
        let mean: f32 = (0..n).map(|_| rng.next_gaussian()).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean={mean}");
    }
}
