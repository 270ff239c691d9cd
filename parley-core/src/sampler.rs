//! Samplers - transform a logits array into a chosen token id
//!
//! The main [`Sampler`] applies the full stack in a fixed order: repetition
//! and frequency/presence penalties on raw logits, temperature on penalized
//! logits, top-k/top-p filters on scaled logits, then a softmax categorical
//! draw. Zero temperature short-circuits to greedy argmax. [`GreedySampler`]
//! and [`MirostatSampler`] cover the two alternative strategies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sampling parameters.
///
/// `seed < 0` seeds the generator from entropy; a nonnegative seed gives
/// reproducible draws.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub seed: i32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: -1,
        }
    }
}

/// Configurable token sampler with its own PRNG.
pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = rng_for_seed(config.seed);
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Replace the configuration. The generator is reseeded only when the
    /// new seed is nonnegative, so repeated reconfiguration with `seed = -1`
    /// keeps the current stream.
    pub fn update_config(&mut self, config: SamplerConfig) {
        if config.seed >= 0 {
            self.rng = rng_for_seed(config.seed);
        }
        self.config = config;
    }

    pub fn reset_rng(&mut self, seed: i32) {
        self.rng = rng_for_seed(seed);
    }

    /// Sample one token id from `logits`, mutating the array in place.
    /// `last_tokens` is the lookback window for the penalty stages.
    pub fn sample(&mut self, logits: &mut [f32], last_tokens: &[u32]) -> u32 {
        self.apply_repetition_penalty(logits, last_tokens);
        self.apply_frequency_presence(logits, last_tokens);

        if self.config.temperature <= 0.0 {
            return argmax(logits);
        }
        for logit in logits.iter_mut() {
            *logit /= self.config.temperature;
        }

        self.apply_top_k(logits);
        self.apply_top_p(logits);

        softmax(logits);
        self.draw(logits)
    }

    /// Sample without consuming the caller's logits, additionally returning
    /// the value left at the chosen index after the sampling transforms.
    /// That value is not guaranteed to be a normalized probability; callers
    /// wanting probabilities should softmax the raw logits themselves.
    pub fn sample_with_prob(&mut self, logits: &[f32], last_tokens: &[u32]) -> (u32, f32) {
        let mut scratch = logits.to_vec();
        let token = self.sample(&mut scratch, last_tokens);
        let prob = scratch[token as usize];
        (token, prob)
    }

    /// Top-`k` (id, probability) pairs of the unmodified logits, softmaxed
    /// over the returned candidates. Diagnostic helper; the generation loop
    /// does not use it.
    pub fn top_k_tokens(&self, logits: &[f32], k: usize) -> Vec<(u32, f32)> {
        let k = k.min(logits.len());
        if k == 0 {
            return Vec::new();
        }

        let mut indexed: Vec<(f32, u32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (l, i as u32))
            .collect();
        indexed.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
        indexed.truncate(k);

        let max_logit = indexed[0].0;
        let mut result: Vec<(u32, f32)> = indexed
            .iter()
            .map(|&(l, id)| (id, (l - max_logit).exp()))
            .collect();
        let sum: f32 = result.iter().map(|(_, p)| p).sum();
        for (_, p) in result.iter_mut() {
            *p /= sum;
        }
        result
    }

    fn apply_repetition_penalty(&self, logits: &mut [f32], last_tokens: &[u32]) {
        if self.config.repeat_penalty == 1.0 || last_tokens.is_empty() {
            return;
        }

        let start = last_tokens.len().saturating_sub(self.config.repeat_last_n);
        for &token in &last_tokens[start..] {
            let Some(logit) = logits.get_mut(token as usize) else {
                continue;
            };
            // Divide positive logits, multiply negative ones: both push the
            // value toward less likely while preserving sign.
            if *logit > 0.0 {
                *logit /= self.config.repeat_penalty;
            } else {
                *logit *= self.config.repeat_penalty;
            }
        }
    }

    fn apply_frequency_presence(&self, logits: &mut [f32], last_tokens: &[u32]) {
        if self.config.frequency_penalty == 0.0 && self.config.presence_penalty == 0.0 {
            return;
        }

        let start = last_tokens.len().saturating_sub(self.config.repeat_last_n);
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for &token in &last_tokens[start..] {
            *counts.entry(token).or_insert(0) += 1;
        }

        for (token, count) in counts {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit -= self.config.frequency_penalty * count as f32;
                *logit -= self.config.presence_penalty;
            }
        }
    }

    fn apply_top_k(&self, logits: &mut [f32]) {
        let k = self.config.top_k;
        if k <= 0 || k as usize >= logits.len() {
            return;
        }

        let mut sorted = logits.to_vec();
        sorted.sort_unstable_by(|a, b| b.total_cmp(a));
        let threshold = sorted[k as usize - 1];

        for logit in logits.iter_mut() {
            if *logit < threshold {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn apply_top_p(&self, logits: &mut [f32]) {
        if self.config.top_p >= 1.0 {
            return;
        }

        let mut indexed: Vec<(f32, usize)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (l, i))
            .collect();
        indexed.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        let max_logit = indexed[0].0;
        let mut probs: Vec<f32> = indexed.iter().map(|&(l, _)| (l - max_logit).exp()).collect();
        let sum: f32 = probs.iter().sum();

        // Cumulative mass until top_p is exceeded; the crossing token stays.
        let mut cumsum = 0.0;
        let mut cutoff = indexed.len();
        for (i, p) in probs.iter_mut().enumerate() {
            *p /= sum;
            cumsum += *p;
            if cumsum > self.config.top_p {
                cutoff = i + 1;
                break;
            }
        }

        for &(_, idx) in &indexed[cutoff..] {
            logits[idx] = f32::NEG_INFINITY;
        }
    }

    /// Categorical draw over an already-normalized distribution.
    fn draw(&mut self, probs: &[f32]) -> u32 {
        let r: f32 = self.rng.gen();
        let mut cumsum = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p;
            if cumsum >= r {
                return i as u32;
            }
        }
        (probs.len() - 1) as u32
    }
}

/// Argmax decoding, no state.
pub struct GreedySampler;

impl GreedySampler {
    pub fn sample(&self, logits: &[f32]) -> u32 {
        argmax(logits)
    }
}

/// Mirostat-2: keeps the surprise of emitted tokens near a target `tau` by
/// adapting a moving truncation threshold `mu`.
pub struct MirostatSampler {
    tau: f32,
    eta: f32,
    mu: f32,
    rng: StdRng,
}

impl MirostatSampler {
    pub fn new(tau: f32, eta: f32) -> Self {
        Self {
            tau,
            eta,
            mu: 2.0 * tau,
            rng: StdRng::from_entropy(),
        }
    }

    /// Restore `mu` to its initial value. Call between generations.
    pub fn reset(&mut self) {
        self.mu = 2.0 * self.tau;
    }

    pub fn mu(&self) -> f32 {
        self.mu
    }

    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        let mut sorted: Vec<(f32, u32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (l, i as u32))
            .collect();
        sorted.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        let max_logit = sorted[0].0;
        let mut probs: Vec<f32> = sorted.iter().map(|&(l, _)| (l - max_logit).exp()).collect();
        let sum: f32 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        // Smallest head whose every token has surprise <= mu; at least one
        // candidate always survives.
        let mut k = 0;
        for (i, &p) in probs.iter().enumerate() {
            let surprise = -p.log2();
            if surprise > self.mu {
                k = i.max(1);
                break;
            }
            k = i + 1;
        }

        let truncated_sum: f32 = probs[..k].iter().sum();
        let r: f32 = self.rng.gen::<f32>() * truncated_sum;
        let mut cumsum = 0.0;
        let mut drawn = k - 1;
        for (i, &p) in probs[..k].iter().enumerate() {
            cumsum += p;
            if cumsum >= r {
                drawn = i;
                break;
            }
        }

        let surprise = -probs[drawn].log2();
        self.mu -= self.eta * (surprise - self.tau);

        sorted[drawn].1
    }
}

impl Default for MirostatSampler {
    fn default() -> Self {
        Self::new(5.0, 0.1)
    }
}

fn rng_for_seed(seed: i32) -> StdRng {
    if seed < 0 {
        StdRng::from_entropy()
    } else {
        StdRng::seed_from_u64(seed as u64)
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn softmax(logits: &mut [f32]) {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for logit in logits.iter_mut() {
        *logit = (*logit - max_val).exp();
        sum += *logit;
    }
    for logit in logits.iter_mut() {
        *logit /= sum;
    }
}
