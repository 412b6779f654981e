//! The generation loop over [`InferenceSession::prefill`] and [`InferenceSession::step`].

use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::info;

use super::{InferenceSession, Next};
use crate::backend::ComputeEngine;
use crate::error::{Qwen2Error, Result};
use crate::sampling::SamplingConfig;
use crate::TokenId;

/// Generation budget plus sampling policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens appended to the prompt.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    #[serde(flatten)]
    pub sampling: SamplingConfig,
}

fn default_max_new_tokens() -> usize {
    128
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            max_new_tokens: default_max_new_tokens(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding of up to `max_new_tokens`.
    pub fn greedy(max_new_tokens: usize) -> Self {
        GenerationConfig {
            max_new_tokens,
            sampling: SamplingConfig::greedy(),
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The token budget was used up.
    MaxTokens,
    /// The end-of-sequence token was produced (and appended).
    EndOfSequence,
    /// The compute engine failed; tokens produced before it are kept.
    EngineFailure(String),
    /// The caller stopped generation between steps.
    Cancelled,
}

/// Statistics from a generation run.
#[derive(Debug, Clone, Default)]
pub struct GenerationStats {
    /// Number of tokens in the prompt.
    pub prompt_tokens: usize,

    /// Number of tokens generated.
    pub generated_tokens: usize,

    /// Time for the prefill phase in milliseconds.
    pub prefill_time_ms: f64,

    /// Time for the step phase in milliseconds.
    pub decode_time_ms: f64,

    /// Tokens per second during the step phase.
    pub tokens_per_second: f64,
}

/// A finished generation: the prompt followed by every produced token.
#[derive(Debug, Clone)]
pub struct Generation {
    pub tokens: Vec<TokenId>,
    pub prompt_len: usize,
    pub stop_reason: StopReason,
    pub stats: GenerationStats,
}

impl Generation {
    /// Tokens appended after the prompt.
    pub fn new_tokens(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len..]
    }
}

impl<E: ComputeEngine> InferenceSession<E> {
    /// Extend `prompt` by up to `config.max_new_tokens` tokens.
    pub fn generate(&mut self, prompt: &[TokenId], config: &GenerationConfig) -> Result<Generation> {
        self.generate_with(prompt, config, |_| ControlFlow::Continue(()))
    }

    /// Like [`generate`](Self::generate), handing each produced token to
    /// `on_token` as soon as it is appended. Returning `ControlFlow::Break`
    /// stops before the next step.
    ///
    /// An engine failure is a stop reason, not an error: the returned
    /// [`Generation`] keeps every token produced before it.
    pub fn generate_with<F>(
        &mut self,
        prompt: &[TokenId],
        config: &GenerationConfig,
        mut on_token: F,
    ) -> Result<Generation>
    where
        F: FnMut(TokenId) -> ControlFlow<()>,
    {
        if prompt.is_empty() {
            return Err(Qwen2Error::InvalidInput("empty prompt".into()));
        }

        let prompt_len = prompt.len();
        let mut tokens = prompt.to_vec();
        if config.max_new_tokens == 0 {
            return Ok(Generation {
                tokens,
                prompt_len,
                stop_reason: StopReason::MaxTokens,
                stats: GenerationStats {
                    prompt_tokens: prompt_len,
                    ..GenerationStats::default()
                },
            });
        }

        self.set_sampling(config.sampling.clone());
        self.is_running.store(true, Ordering::Release);

        let prefill_start = Instant::now();
        let mut next = match self.prefill(prompt) {
            Ok(next) => next,
            Err(e) => {
                self.is_running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let prefill_time = prefill_start.elapsed();

        let decode_start = Instant::now();
        let stop_reason = loop {
            let token = match next {
                Next::Failed(reason) => break StopReason::EngineFailure(reason),
                Next::EndOfSequence(eos) => {
                    tokens.push(eos);
                    let _ = on_token(eos);
                    break StopReason::EndOfSequence;
                }
                Next::Token(token) => token,
            };

            tokens.push(token);
            if on_token(token).is_break() {
                break StopReason::Cancelled;
            }
            if tokens.len() - prompt_len >= config.max_new_tokens {
                break StopReason::MaxTokens;
            }

            next = match self.step(token) {
                Ok(next) => next,
                Err(e) => {
                    self.is_running.store(false, Ordering::Release);
                    return Err(e);
                }
            };
        };
        let decode_time = decode_start.elapsed();
        self.is_running.store(false, Ordering::Release);

        let generated = tokens.len() - prompt_len;
        let stats = GenerationStats {
            prompt_tokens: prompt_len,
            generated_tokens: generated,
            prefill_time_ms: millis(prefill_time),
            decode_time_ms: millis(decode_time),
            tokens_per_second: rate(generated.saturating_sub(1), decode_time),
        };

        info!(
            session = %self.id,
            prompt = prompt_len,
            generated,
            reason = ?stop_reason,
            tokens_per_second = stats.tokens_per_second,
            "generation finished"
        );

        Ok(Generation {
            tokens,
            prompt_len,
            stop_reason,
            stats,
        })
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if tokens == 0 || secs <= 0.0 {
        0.0
    } else {
        tokens as f64 / secs
    }
}
