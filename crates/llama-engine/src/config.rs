//! Per-request generation configuration.
//!
//! A [`GenerationConfig`] is built once per request and never mutated by the
//! engine. It can be loaded from JSON, where every field is optional and falls
//! back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{LlamaError, Result, TokenId};

/// Adaptive-entropy sampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirostatMode {
    Disabled,
    V1,
    V2,
}

/// Additive bias applied to a single token's logit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitBias {
    pub token: TokenId,
    pub bias: f32,
}

/// Sampling, structural and stop-condition knobs for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Softmax temperature. `<= 0` selects greedy decoding and overrides
    /// every other sampling option.
    pub temperature: f32,
    /// 0 disables the filter.
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typical_p: f32,
    /// Tail-free sampling. Accepted for compatibility; has no stage.
    pub tfs_z: f32,

    /// 0 = off, 1 = mirostat, 2 = mirostat v2.
    pub mirostat: i32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,

    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    /// Lookback for DRY matching. -1 = whole context, 0 = disabled.
    pub dry_penalty_last_n: i32,
    pub dry_sequence_breakers: Vec<String>,

    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    pub top_n_sigma: f32,

    pub repeat_penalty: f32,
    /// Lookback for the penalties stage. -1 = whole context.
    pub repeat_last_n: i32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub logit_bias: Vec<LogitBias>,

    /// New-token budget. 0 = until EOG, antiprompt or cancellation.
    pub max_tokens: usize,
    /// Context size used by the window manager. 0 = the runtime's capacity.
    pub n_ctx: usize,
    pub n_batch: usize,
    /// Number of leading tokens preserved across a window shift.
    pub n_keep: usize,
    /// `None` draws a fresh seed for every call.
    pub seed: Option<u64>,
    pub n_threads: usize,

    pub antiprompts: Vec<String>,
    pub ignore_eos: bool,

    /// GBNF grammar with `root` as the start rule.
    pub grammar: Option<String>,
}

fn default_dry_sequence_breakers() -> Vec<String> {
    ["\n", ":", "\"", "*"].iter().map(|s| s.to_string()).collect()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            tfs_z: 1.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            dry_sequence_breakers: default_dry_sequence_breakers(),
            xtc_probability: 0.0,
            xtc_threshold: 0.5,
            top_n_sigma: 0.0,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            logit_bias: Vec::new(),
            max_tokens: 128,
            n_ctx: 0,
            n_batch: 512,
            n_keep: 64,
            seed: None,
            n_threads: 4,
            antiprompts: Vec::new(),
            ignore_eos: false,
            grammar: None,
        }
    }
}

impl GenerationConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic arg-max decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| LlamaError::Config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no sampler chain can be built from.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() {
            return Err(LlamaError::Config(format!(
                "temperature must be finite, got {}",
                self.temperature
            )));
        }
        if self.n_batch == 0 {
            return Err(LlamaError::Config("n_batch must be at least 1".into()));
        }
        self.mirostat_mode()?;
        Ok(())
    }

    pub fn mirostat_mode(&self) -> Result<MirostatMode> {
        match self.mirostat {
            0 => Ok(MirostatMode::Disabled),
            1 => Ok(MirostatMode::V1),
            2 => Ok(MirostatMode::V2),
            other => Err(LlamaError::Config(format!(
                "unknown mirostat mode {other}, expected 0, 1 or 2"
            ))),
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Whether the combined repeat/frequency/presence stage does anything.
    pub fn has_penalties(&self) -> bool {
        self.repeat_penalty != 1.0 || self.frequency_penalty != 0.0 || self.presence_penalty != 0.0
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_top_k(mut self, k: i32) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_min_p(mut self, p: f32) -> Self {
        self.min_p = p;
        self
    }

    pub fn with_typical_p(mut self, p: f32) -> Self {
        self.typical_p = p;
        self
    }

    /// Set mirostat mode with its target entropy and learning rate.
    pub fn with_mirostat(mut self, mode: i32, tau: f32, eta: f32) -> Self {
        self.mirostat = mode;
        self.mirostat_tau = tau;
        self.mirostat_eta = eta;
        self
    }

    pub fn with_dry(mut self, multiplier: f32, base: f32, allowed_length: i32, last_n: i32) -> Self {
        self.dry_multiplier = multiplier;
        self.dry_base = base;
        self.dry_allowed_length = allowed_length;
        self.dry_penalty_last_n = last_n;
        self
    }

    pub fn with_xtc(mut self, probability: f32, threshold: f32) -> Self {
        self.xtc_probability = probability;
        self.xtc_threshold = threshold;
        self
    }

    pub fn with_top_n_sigma(mut self, n: f32) -> Self {
        self.top_n_sigma = n;
        self
    }

    /// Set repeat, frequency and presence penalties.
    pub fn with_penalties(mut self, repeat: f32, frequency: f32, presence: f32) -> Self {
        self.repeat_penalty = repeat;
        self.frequency_penalty = frequency;
        self.presence_penalty = presence;
        self
    }

    pub fn with_repeat_last_n(mut self, n: i32) -> Self {
        self.repeat_last_n = n;
        self
    }

    pub fn with_logit_bias(mut self, token: TokenId, bias: f32) -> Self {
        self.logit_bias.push(LogitBias { token, bias });
        self
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_n_ctx(mut self, n: usize) -> Self {
        self.n_ctx = n;
        self
    }

    pub fn with_n_batch(mut self, n: usize) -> Self {
        self.n_batch = n;
        self
    }

    pub fn with_n_keep(mut self, n: usize) -> Self {
        self.n_keep = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_n_threads(mut self, n: usize) -> Self {
        self.n_threads = n;
        self
    }

    pub fn with_antiprompt(mut self, s: impl Into<String>) -> Self {
        self.antiprompts.push(s.into());
        self
    }

    pub fn with_ignore_eos(mut self, ignore: bool) -> Self {
        self.ignore_eos = ignore;
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }
}

/// Parse logit biases written as `"<token><+|-><value>"`, comma separated.
///
/// `"15043+1.5"` raises token 15043 by 1.5, `"2-inf"` bans token 2.
pub fn parse_logit_bias(s: &str) -> Result<Vec<LogitBias>> {
    let mut out = Vec::new();
    for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let sign_at = entry
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '+' || *c == '-')
            .map(|(i, _)| i)
            .ok_or_else(|| LlamaError::Config(format!("logit bias '{entry}' has no sign")))?;

        let (token, rest) = entry.split_at(sign_at);
        let token: TokenId = token
            .trim()
            .parse()
            .map_err(|_| LlamaError::Config(format!("invalid token id in logit bias '{entry}'")))?;
        let magnitude: f32 = rest[1..]
            .trim()
            .parse()
            .map_err(|_| LlamaError::Config(format!("invalid bias value in logit bias '{entry}'")))?;
        let bias = if rest.starts_with('-') { -magnitude } else { magnitude };
        out.push(LogitBias { token, bias });
    }
    Ok(out)
}
