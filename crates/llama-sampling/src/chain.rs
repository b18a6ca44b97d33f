//! Sampler chain construction and execution.

use std::collections::HashSet;
use std::sync::Arc;

use llama_engine::{GenerationConfig, MirostatMode, Runtime, TokenId};
use tracing::{debug, trace};

use crate::grammar::{Grammar, GrammarMatcher};
use crate::stages::{Dry, GrammarStage, Mirostat, Penalties, SamplerStage, Xtc};
use crate::{Candidates, SamplingResult, SeededRng};

/// Tokens mirostat v1 uses to estimate the distribution's Zipf exponent.
const MIROSTAT_V1_M: usize = 100;

/// Vocabulary facts the chain needs at build time.
#[derive(Debug, Clone)]
pub struct VocabInfo {
    pub n_vocab: usize,
    pub n_ctx_train: usize,
    /// Rendered text per token id. Only required for DRY and grammar stages.
    pub pieces: Arc<[String]>,
    pub eog: Arc<HashSet<TokenId>>,
}

impl VocabInfo {
    pub fn new(n_vocab: usize, n_ctx_train: usize) -> Self {
        Self {
            n_vocab,
            n_ctx_train,
            pieces: Arc::from(Vec::new()),
            eog: Arc::new(HashSet::new()),
        }
    }

    pub fn with_pieces(mut self, pieces: Vec<String>) -> Self {
        self.pieces = Arc::from(pieces);
        self
    }

    pub fn with_eog(mut self, eog: impl IntoIterator<Item = TokenId>) -> Self {
        self.eog = Arc::new(eog.into_iter().collect());
        self
    }

    /// Read vocabulary facts from a runtime, rendering every token when
    /// `config` has a stage that inspects token text. A token the runtime
    /// cannot render fails the whole call.
    pub fn for_config<R: Runtime + ?Sized>(
        rt: &R,
        config: &GenerationConfig,
    ) -> llama_engine::Result<Self> {
        let info = Self::new(rt.n_vocab(), rt.n_ctx_train()).with_eog(rt.eog_tokens());
        if !SamplerChain::needs_pieces(config) {
            return Ok(info);
        }
        let pieces = (0..rt.n_vocab())
            .map(|id| rt.token_to_piece(id as TokenId))
            .collect::<llama_engine::Result<Vec<_>>>()?;
        Ok(info.with_pieces(pieces))
    }
}

/// An ordered list of sampler stages, built once per generation call.
#[derive(Debug, Clone, Default)]
pub struct SamplerChain {
    stages: Vec<SamplerStage>,
    seed: u64,
}

impl SamplerChain {
    /// An empty chain. Add stages with [`SamplerChain::with_stage`].
    pub fn new(seed: u64) -> Self {
        Self {
            stages: Vec::new(),
            seed,
        }
    }

    pub fn with_stage(mut self, stage: SamplerStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Whether building `config` needs rendered token text.
    pub fn needs_pieces(config: &GenerationConfig) -> bool {
        config.grammar.is_some() || (!config.is_greedy() && config.dry_multiplier > 0.0)
    }

    /// Translate a config into stages.
    ///
    /// Greedy (`temperature <= 0`) replaces everything else. Otherwise
    /// penalties come first, then either mirostat or the top-k family, and a
    /// configured grammar is always the final stage. Fails with
    /// [`LlamaError::Config`](llama_engine::LlamaError::Config) for an invalid
    /// config or a grammar that does not compile.
    pub fn build(config: &GenerationConfig, vocab: &VocabInfo) -> llama_engine::Result<Self> {
        config.validate()?;
        let grammar = match &config.grammar {
            Some(src) => Some(Arc::new(Grammar::parse(src)?)),
            None => None,
        };

        let seed = config.seed.unwrap_or_else(rand::random);
        let mut chain = Self::new(seed);

        if config.is_greedy() {
            chain.stages.push(SamplerStage::Greedy);
        } else {
            if !config.logit_bias.is_empty() {
                chain
                    .stages
                    .push(SamplerStage::LogitBias(config.logit_bias.clone()));
            }
            if config.dry_multiplier > 0.0 {
                chain.stages.push(SamplerStage::Dry(Dry::new(
                    config.dry_multiplier,
                    config.dry_base,
                    config.dry_allowed_length.max(0) as usize,
                    lookback(config.dry_penalty_last_n, vocab.n_ctx_train),
                    Arc::new(breaker_tokens(&config.dry_sequence_breakers, vocab)),
                )));
            }
            if config.has_penalties() {
                chain.stages.push(SamplerStage::Penalties(Penalties::new(
                    lookback(config.repeat_last_n, vocab.n_ctx_train),
                    config.repeat_penalty,
                    config.frequency_penalty,
                    config.presence_penalty,
                )));
            }

            match config.mirostat_mode()? {
                MirostatMode::V1 => {
                    chain.stages.push(SamplerStage::Temperature(config.temperature));
                    chain.stages.push(SamplerStage::MirostatV1(Mirostat::new(
                        config.mirostat_tau,
                        config.mirostat_eta,
                        MIROSTAT_V1_M,
                        vocab.n_vocab,
                        seed,
                    )));
                }
                MirostatMode::V2 => {
                    chain.stages.push(SamplerStage::Temperature(config.temperature));
                    chain.stages.push(SamplerStage::MirostatV2(Mirostat::new(
                        config.mirostat_tau,
                        config.mirostat_eta,
                        MIROSTAT_V1_M,
                        vocab.n_vocab,
                        seed,
                    )));
                }
                MirostatMode::Disabled => {
                    if config.top_n_sigma > 0.0 {
                        chain.stages.push(SamplerStage::TopNSigma(config.top_n_sigma));
                    }
                    chain.stages.push(SamplerStage::TopK(config.top_k));
                    if config.typical_p < 1.0 {
                        chain.stages.push(SamplerStage::Typical {
                            p: config.typical_p,
                            min_keep: 1,
                        });
                    }
                    chain.stages.push(SamplerStage::TopP {
                        p: config.top_p,
                        min_keep: 1,
                    });
                    if config.min_p > 0.0 {
                        chain.stages.push(SamplerStage::MinP {
                            p: config.min_p,
                            min_keep: 1,
                        });
                    }
                    if config.xtc_probability > 0.0 {
                        chain.stages.push(SamplerStage::Xtc(Xtc::new(
                            config.xtc_probability,
                            config.xtc_threshold,
                            1,
                            seed,
                        )));
                    }
                    chain.stages.push(SamplerStage::Temperature(config.temperature));
                    chain.stages.push(SamplerStage::Dist(SeededRng::new(seed)));
                }
            }
        }

        if let Some(grammar) = grammar {
            debug!(rules = grammar.rule_count(), "compiled grammar");
            chain.stages.push(SamplerStage::Grammar(GrammarStage::new(
                GrammarMatcher::new(grammar),
                vocab.pieces.clone(),
                vocab.eog.clone(),
            )));
        }

        debug!(stages = ?chain.stage_names(), seed, "built sampler chain");
        Ok(chain)
    }

    /// Pick the next token from raw logits.
    ///
    /// With a grammar, the token chosen by the other stages is checked first.
    /// If the grammar rejects it, every invalid candidate is removed and the
    /// other stages run again on what remains.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        let has_grammar = matches!(self.stages.last(), Some(SamplerStage::Grammar(_)));
        let body = if has_grammar {
            self.stages.len() - 1
        } else {
            self.stages.len()
        };

        let mut cur = Candidates::from_logits(logits)?;
        for stage in &mut self.stages[..body] {
            stage.apply(&mut cur)?;
        }
        let id = cur.selected_token()?;

        let (body_stages, tail) = self.stages.split_at_mut(body);
        let Some(grammar) = tail.first_mut() else {
            return Ok(id);
        };
        if let SamplerStage::Grammar(g) = grammar {
            if g.allows(id) {
                return Ok(id);
            }
        }

        trace!(token = id, "grammar rejected sampled token, resampling");
        let mut cur = Candidates::from_logits(logits)?;
        grammar.apply(&mut cur)?;
        for stage in body_stages {
            stage.apply(&mut cur)?;
        }
        cur.selected_token()
    }

    /// Feed a generated token to every stateful stage.
    pub fn accept(&mut self, token: TokenId) -> SamplingResult<()> {
        for stage in &mut self.stages {
            stage.accept(token)?;
        }
        Ok(())
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(SamplerStage::name).collect()
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Negative lookbacks mean the whole training context.
fn lookback(last_n: i32, n_ctx_train: usize) -> usize {
    if last_n < 0 {
        n_ctx_train
    } else {
        last_n as usize
    }
}

/// Tokens whose text contains any of the breaker strings.
fn breaker_tokens(breakers: &[String], vocab: &VocabInfo) -> HashSet<TokenId> {
    vocab
        .pieces
        .iter()
        .enumerate()
        .filter(|(_, piece)| {
            breakers
                .iter()
                .any(|b| !b.is_empty() && piece.contains(b.as_str()))
        })
        .map(|(id, _)| id as TokenId)
        .collect()
}
