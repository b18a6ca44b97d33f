//! # llama-sampling
//!
//! Token selection for llama-gen.
//!
//! A [`SamplerChain`] is an ordered list of [`SamplerStage`]s built once per
//! generation call from a [`GenerationConfig`](llama_engine::GenerationConfig).
//! Each stage narrows, reorders or rescales a [`Candidates`] list, and exactly
//! one selection stage (greedy, dist or mirostat) picks the token.
//!
//! Supports:
//! - Greedy (argmax)
//! - Logit bias, DRY and repeat/frequency/presence penalties
//! - Mirostat v1 and v2
//! - Top-n-sigma, top-k, typical, top-p, min-p and XTC filters
//! - Temperature scaling
//! - GBNF grammar constraints
//! - Deterministic seeded RNG for reproducible generation

pub mod candidates;
pub mod chain;
pub mod grammar;
pub mod stages;

pub use candidates::{Candidates, TokenData};
pub use chain::{SamplerChain, VocabInfo};
pub use grammar::{Grammar, GrammarError, GrammarMatcher};
pub use stages::SamplerStage;

use llama_engine::{LlamaError, TokenId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("No valid tokens after filtering")]
    NoValidTokens,
    /// A token was accepted that the grammar cannot continue with.
    #[error("Token {0} is not a valid grammar continuation")]
    GrammarRejected(TokenId),
}

/// A chain that cannot pick a token fails the decode step it belongs to.
impl From<SamplingError> for LlamaError {
    fn from(err: SamplingError) -> Self {
        LlamaError::Decode(format!("sampling: {err}"))
    }
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Seeded RNG behind every stochastic stage, so a fixed seed replays a run.
#[derive(Debug, Clone)]
pub struct SeededRng(StdRng);

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    /// Next float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.0.gen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_reproducible() {
        let mut rng1 = SeededRng::new(42);
        let mut rng2 = SeededRng::new(42);

        for _ in 0..100 {
            let v1 = rng1.next_f32();
            let v2 = rng2.next_f32();
            assert!((v1 - v2).abs() < 1e-6);
            assert!((0.0..1.0).contains(&v1));
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let a: Vec<f32> = {
            let mut rng = SeededRng::new(7);
            (0..5).map(|_| rng.next_f32()).collect()
        };
        let b: Vec<f32> = {
            let mut rng = SeededRng::new(8);
            (0..5).map(|_| rng.next_f32()).collect()
        };
        assert_ne!(a, b);
    }

    #[test]
    fn zero_seed_still_advances() {
        let mut rng = SeededRng::new(0);
        let a = rng.next_f32();
        let b = rng.next_f32();
        assert_ne!(a, b);
    }

    #[test]
    fn sampling_error_maps_to_decode_error() {
        let err: LlamaError = SamplingError::NoValidTokens.into();
        assert!(matches!(err, LlamaError::Decode(_)));
        assert_eq!(
            SamplingError::GrammarRejected(5).to_string(),
            "Token 5 is not a valid grammar continuation"
        );
    }
}
