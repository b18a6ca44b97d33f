//! Load-time model and context parameters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{LlamaError, Result};

/// Parameters fixed when a runtime is created.
///
/// A session snapshot is only valid for a runtime created with the same
/// `n_ctx` and model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub n_ctx: usize,
    pub n_batch: usize,
    /// Seed for anything the runtime randomizes at load time.
    pub seed: u64,
    /// Create the context with embedding output enabled.
    pub embeddings: bool,
    pub n_gpu_layers: i32,
    pub main_gpu: i32,
    /// Per-device split ratios, one entry per device.
    pub tensor_split: Vec<f32>,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub numa: bool,
    /// 0 = model default.
    pub rope_freq_base: f32,
    /// 0 = model default.
    pub rope_freq_scale: f32,
    pub lora_adapter: Option<String>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 512,
            seed: 0,
            embeddings: false,
            n_gpu_layers: 0,
            main_gpu: 0,
            tensor_split: Vec::new(),
            use_mmap: true,
            use_mlock: false,
            numa: false,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            lora_adapter: None,
        }
    }
}

impl ModelParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&raw)
            .map_err(|e| LlamaError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    pub fn with_n_ctx(mut self, n: usize) -> Self {
        self.n_ctx = n;
        self
    }

    pub fn with_n_batch(mut self, n: usize) -> Self {
        self.n_batch = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_embeddings(mut self, enabled: bool) -> Self {
        self.embeddings = enabled;
        self
    }

    pub fn with_gpu_layers(mut self, n: i32) -> Self {
        self.n_gpu_layers = n;
        self
    }

    /// Set the tensor split from a `"3,1"` / `"3/1"` style string.
    pub fn with_tensor_split(mut self, s: &str) -> Result<Self> {
        self.tensor_split = parse_tensor_split(s)?;
        Ok(self)
    }

    /// Names of placement, memory and RoPE options moved off their defaults.
    /// Backends without devices or a real model report these as ignored.
    pub fn device_overrides(&self) -> Vec<&'static str> {
        let defaults = Self::default();
        [
            ("n_batch", self.n_batch != defaults.n_batch),
            ("n_gpu_layers", self.n_gpu_layers != defaults.n_gpu_layers),
            ("main_gpu", self.main_gpu != defaults.main_gpu),
            ("tensor_split", !self.tensor_split.is_empty()),
            ("use_mmap", self.use_mmap != defaults.use_mmap),
            ("use_mlock", self.use_mlock != defaults.use_mlock),
            ("numa", self.numa != defaults.numa),
            ("rope_freq_base", self.rope_freq_base != defaults.rope_freq_base),
            ("rope_freq_scale", self.rope_freq_scale != defaults.rope_freq_scale),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }
}

/// Parse device split ratios separated by any run of `,` or `/`.
///
/// Empty input yields an empty split (let the runtime decide).
pub fn parse_tensor_split(s: &str) -> Result<Vec<f32>> {
    s.split([',', '/'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<f32>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| LlamaError::Config(format!("invalid tensor split value '{part}'")))
        })
        .collect()
}
