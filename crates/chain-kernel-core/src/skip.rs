//! Single-item reservoir sampling over streams of unknown length.
//!
//! This is Li's Algorithm L specialised to a reservoir of one. The classical form
//! keeps a weight `W` that starts at a uniform variate and shrinks toward zero;
//! here the state stores `1 - W` instead, so the zero value is exactly the state
//! before the first draw and needs no special case.

/// Skip-length generator for choosing one element uniformly from a stream.
///
/// Accept the first element, then repeatedly call [`Skip::next_skip`], discard
/// that many elements and accept the one after them. When the stream ends during
/// a skip, the last accepted element is a uniform choice over the whole stream.
/// Each call consumes two uniform draws and the expected number of calls grows
/// with the logarithm of the stream length.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Skip {
    w: f64,
}

impl Skip {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of elements to discard before the next replacement.
    ///
    /// `u1` and `u2` must be independent uniform 64-bit values. Precision holds for
    /// streams of up to 2^53 elements.
    pub fn next_skip(&mut self, u1: u64, u2: u64) -> u64 {
        // w' = 1 - (1 - w)·U₁, i.e. W' = W·U₁ in the classical form.
        self.w += (1.0 - self.w) * (1.0 - unit(u1));
        if self.w >= 1.0 {
            // Precision exhausted: no later element can be chosen.
            return u64::MAX;
        }
        let skip = unit(u2).ln() / self.w.ln();
        if skip.is_nan() {
            return u64::MAX;
        }
        // Saturating float-to-int conversion; +inf maps to u64::MAX.
        skip.floor() as u64
    }
}

/// Map a uniform 64-bit value onto (0, 1] using its top 53 bits.
fn unit(u: u64) -> f64 {
    const SCALE: f64 = 1.0 / (1_u64 << 53) as f64;
    ((u >> 11) + 1) as f64 * SCALE
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    use super::*;

    fn pick(rng: &mut StdRng, n: u64) -> u64 {
        let mut skip = Skip::new();
        let mut best = 0;
        let mut next = 1_u64;
        loop {
            let s = skip.next_skip(rng.next_u64(), rng.next_u64());
            next = match next.checked_add(s) {
                Some(next) if next < n => next,
                _ => return best,
            };
            best = next;
            next += 1;
        }
    }

    #[test]
    fn unit_interval_excludes_zero() {
        assert!(unit(0) > 0.0);
        assert!((unit(u64::MAX) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_state_is_usable() {
        let mut skip = Skip::new();
        // U₁ = 1 keeps w at 0: the next element must replace immediately.
        assert_eq!(skip.next_skip(u64::MAX, 0), 0);
        let mut skip = Skip::new();
        let s = skip.next_skip(0, u64::MAX);
        assert_eq!(s, 0);
    }

    #[test]
    fn weight_rises_toward_one() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut skip = Skip::new();
        let mut last = skip.w;
        for _ in 0..64 {
            skip.next_skip(rng.next_u64(), rng.next_u64());
            assert!(skip.w >= last);
            assert!(skip.w <= 1.0);
            last = skip.w;
        }
    }

    #[test]
    fn saturated_weight_skips_forever() {
        let mut skip = Skip { w: 1.0 };
        assert_eq!(skip.next_skip(0, 0), u64::MAX);
    }

    #[test]
    fn single_element_stream_always_picks_it() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(pick(&mut rng, 1), 0);
        }
    }

    #[test]
    fn chi_square_uniformity() {
        const N: u64 = 10;
        const TRIALS: u64 = 20_000;
        // Critical value for 9 degrees of freedom at p = 0.0001.
        const CRITICAL: f64 = 33.72;

        let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
        let mut counts = [0_u64; N as usize];
        for _ in 0..TRIALS {
            let chosen = pick(&mut rng, N);
            counts[usize::try_from(chosen).unwrap_or(usize::MAX)] += 1;
        }

        let expected = TRIALS as f64 / N as f64;
        let chi2: f64 = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - expected;
                d * d / expected
            })
            .sum();
        assert!(chi2 < CRITICAL, "chi-square {chi2} over {counts:?}");
    }

    #[test]
    fn long_streams_need_few_draws() {
        let mut rng = StdRng::seed_from_u64(99);
        let n = 1_000_000_u64;
        let mut skip = Skip::new();
        let mut position = 0_u64;
        let mut draws = 0;
        while position < n {
            let s = skip.next_skip(rng.next_u64(), rng.next_u64());
            position = position.saturating_add(s).saturating_add(1);
            draws += 1;
        }
        // The expected count is about ln(n) ≈ 14.
        assert!(draws < 60, "took {draws} draws");
    }
}
