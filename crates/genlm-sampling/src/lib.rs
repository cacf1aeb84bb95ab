//! # genlm-sampling
//!
//! Next-token selection for genlm.
//!
//! Logits become a candidate list, which is then narrowed in order:
//! 1. Suppressed tokens are removed
//! 2. Temperature 0 (or near it) picks the highest logit directly
//! 3. Logits are scaled by `1 / temperature`
//! 4. Top-k keeps the `k` highest candidates
//! 5. Top-p keeps the smallest prefix whose probability reaches `p`
//! 6. A seeded RNG draws from what is left
//!
//! The RNG position is part of the sampler, so a cloned sampler draws the
//! same tokens as its source.

use thiserror::Error;

/// Why a token could not be drawn.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingError {
    #[error("empty logits")]
    InvalidLogits,
    #[error("non-finite logit at vocabulary index {index}")]
    NonFiniteLogits { index: usize },
    #[error("temperature must be finite and >= 0")]
    InvalidTemperature,
    #[error("every token is suppressed")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Below this temperature sampling is an argmax.
const GREEDY_TEMPERATURE: f32 = 1e-3;

/// xorshift64 generator. Cheap, and identical across platforms.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // xorshift never leaves the all-zero state.
        Self { state: seed.max(1) }
    }

    /// Next float in `[0, 1)`, built from the top 24 bits.
    pub fn next_f32(&mut self) -> f32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 40) as f32 / (1u64 << 24) as f32
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: usize,
    weight: f32,
}

/// Sampling strategy plus its RNG.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// 0.0 = greedy.
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    suppressed: Vec<usize>,
    rng: SeededRng,
}

impl Sampler {
    /// Temperature 1.0, no filtering, seed 42.
    pub fn new() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            suppressed: Vec::new(),
            rng: SeededRng::new(42),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SeededRng::new(seed);
        self
    }

    /// Vocabulary indices that are never selected. Out-of-range ids are ignored.
    pub fn with_suppressed_tokens(mut self, tokens: impl IntoIterator<Item = usize>) -> Self {
        self.suppressed = tokens.into_iter().collect();
        self.suppressed.sort_unstable();
        self.suppressed.dedup();
        self
    }

    /// Draw a vocabulary index from `logits`.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        if let Some(index) = logits.iter().position(|l| !l.is_finite()) {
            return Err(SamplingError::NonFiniteLogits { index });
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut candidates = self.candidates(logits);
        if candidates.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }

        if self.temperature < GREEDY_TEMPERATURE {
            return Ok(candidates[0].id);
        }

        for c in &mut candidates {
            c.weight /= self.temperature;
        }
        if let Some(k) = self.top_k.filter(|&k| k > 0) {
            candidates.truncate(k);
        }
        softmax(&mut candidates);
        if let Some(p) = self.top_p {
            nucleus(&mut candidates, p);
        }

        Ok(self.draw(&candidates))
    }

    /// Unsuppressed tokens, highest logit first. Ties keep vocabulary order.
    fn candidates(&self, logits: &[f32]) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .filter(|(id, _)| self.suppressed.binary_search(id).is_err())
            .map(|(id, &weight)| Candidate { id, weight })
            .collect();
        candidates.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        candidates
    }

    fn draw(&mut self, candidates: &[Candidate]) -> usize {
        let r = self.rng.next_f32();
        let mut cumulative = 0.0;
        for c in candidates {
            cumulative += c.weight;
            if r < cumulative {
                return c.id;
            }
        }
        // Rounding left the total just under r.
        candidates.last().map_or(0, |c| c.id)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn sorted logits into probabilities, in place.
fn softmax(candidates: &mut [Candidate]) {
    let Some(max) = candidates.first().map(|c| c.weight) else {
        return;
    };
    let mut sum = 0.0;
    for c in candidates.iter_mut() {
        c.weight = (c.weight - max).exp();
        sum += c.weight;
    }
    for c in candidates.iter_mut() {
        c.weight /= sum;
    }
}

/// Keep the shortest prefix whose mass reaches `p` (at least one token) and
/// renormalise it.
fn nucleus(candidates: &mut Vec<Candidate>, p: f32) {
    let mut mass = 0.0;
    let mut keep = candidates.len();
    for (i, c) in candidates.iter().enumerate() {
        mass += c.weight;
        if mass >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));

    let total: f32 = candidates.iter().map(|c| c.weight).sum();
    if total > 0.0 {
        for c in candidates.iter_mut() {
            c.weight /= total;
        }
    }
}
