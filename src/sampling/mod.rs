//! Next-token selection from logits.
//!
//! Policy, in order:
//! 1. `temperature <= 0` or `top_k == 1`: exact argmax (first maximum wins)
//! 2. divide logits by temperature
//! 3. keep the `top_k` highest logits (`k <= 0` or `k >= vocab` keeps all)
//! 4. softmax, then keep the smallest descending prefix whose mass reaches `top_p`
//!    (`p >= 1` keeps all)
//! 5. draw from the renormalized distribution with the seeded RNG

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;

use crate::TokenId;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingError {
    #[error("invalid logits: {0}")]
    InvalidLogits(String),

    #[error("no valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingConfig {
    /// Keep only the K most likely tokens. `1` is greedy; `<= 0` disables.
    #[serde(default = "default_top_k")]
    pub top_k: i32,

    /// Nucleus threshold. `>= 1.0` disables.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Softmax temperature. `<= 0.0` is greedy.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// RNG seed; `0` seeds from the clock.
    #[serde(default)]
    pub seed: u64,
}

fn default_top_k() -> i32 {
    1
}
fn default_top_p() -> f32 {
    0.8
}
fn default_temperature() -> f32 {
    0.8
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            seed: 0,
        }
    }
}

impl SamplingConfig {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        SamplingConfig {
            top_k: 1,
            top_p: 1.0,
            temperature: 0.0,
            seed: 0,
        }
    }

    /// Whether this configuration always picks the argmax.
    pub fn is_greedy(&self) -> bool {
        self.top_k == 1 || self.temperature <= 0.0
    }
}

/// Deterministic RNG for reproducible sampling (xorshift64).
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // zero is a fixed point of xorshift
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Next float in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15)
}

/// Stateful sampler: a configuration plus the RNG it advances.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: SeededRng,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let seed = if config.seed == 0 {
            clock_seed()
        } else {
            config.seed
        };
        Self {
            config,
            rng: SeededRng::new(seed),
        }
    }

    pub fn greedy() -> Self {
        Self::new(SamplingConfig::greedy())
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Pick a token id from `logits`.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits("empty logits".into()));
        }
        if logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::InvalidLogits("NaN in logits".into()));
        }

        if self.config.is_greedy() {
            return Ok(argmax(logits) as TokenId);
        }

        let temperature = self.config.temperature;
        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i, l / temperature))
            .collect();

        let k = self.config.top_k;
        if k > 0 && (k as usize) < candidates.len() {
            let k = k as usize;
            candidates.select_nth_unstable_by(k - 1, descending);
            candidates.truncate(k);
        }
        candidates.sort_by(descending);

        let probs = softmax(&candidates);
        let keep = nucleus_len(&probs, self.config.top_p);

        let mass: f32 = probs[..keep].iter().sum();
        if !(mass > 0.0) {
            return Err(SamplingError::NoValidTokens);
        }

        let r = self.rng.next_f32() * mass;
        let mut cumsum = 0.0;
        for (&(id, _), &p) in candidates[..keep].iter().zip(&probs) {
            cumsum += p;
            if r < cumsum {
                return Ok(id as TokenId);
            }
        }
        // rounding left r at the edge of the mass
        Ok(candidates[keep - 1].0 as TokenId)
    }
}

/// Index of the first maximum.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate().skip(1) {
        if l > logits[best] {
            best = i;
        }
    }
    best
}

fn descending(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

fn softmax(candidates: &[(usize, f32)]) -> Vec<f32> {
    let max = candidates
        .iter()
        .map(|&(_, l)| l)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates.iter().map(|&(_, l)| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Length of the shortest prefix of descending `probs` whose mass reaches `p`.
fn nucleus_len(probs: &[f32], p: f32) -> usize {
    if p >= 1.0 || p <= 0.0 {
        return probs.len();
    }
    let mut cumsum = 0.0;
    for (i, &prob) in probs.iter().enumerate() {
        cumsum += prob;
        if cumsum >= p {
            return i + 1;
        }
    }
    probs.len()
}
