//! A tiny deterministic character-level runtime.
//!
//! Weights are generated from the load seed, so two runtimes loaded with the
//! same [`ModelParams`] produce identical logits for identical input. The
//! forward pass is an exponentially decayed sum of token embeddings projected
//! onto the vocabulary: cheap, position sensitive and fully reproducible.
//!
//! Vocabulary: `0` = BOS, `1` = EOS (both render as empty text), `2` = `'\n'`,
//! then printable ASCII `' '..='~'`. Any other character tokenizes as `'?'`.
//!
//! State layout (little-endian): magic, `n_ctx`, `n_past`, a logits flag,
//! `n_ctx` token slots (unused slots hold `-1`), then `n_vocab` logits.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use llama_engine::{LlamaError, ModelInfo, ModelParams, Result, Runtime, TokenId};
use llama_sampling::SeededRng;
use tracing::{debug, warn};

const BOS: TokenId = 0;
const EOS: TokenId = 1;
const NEWLINE: TokenId = 2;
const FIRST_PRINTABLE: TokenId = 3;
const N_VOCAB: usize = 3 + 95;
const N_EMBD: usize = 16;
const N_CTX_TRAIN: usize = 2048;
const DECAY: f32 = 0.8;
const STATE_MAGIC: u32 = 0x594E_4954;
const STATE_HEADER: usize = 4 + 4 + 4 + 1;

pub struct TinyRuntime {
    n_ctx: usize,
    embeddings_enabled: bool,
    n_threads: usize,
    /// `N_VOCAB x N_EMBD`
    embed: Vec<f32>,
    /// `N_EMBD x N_VOCAB`
    head: Vec<f32>,
    tokens: Vec<TokenId>,
    logits: Option<Vec<f32>>,
    hidden: Option<Vec<f32>>,
}

impl TinyRuntime {
    pub fn load(params: &ModelParams) -> Result<Self> {
        if params.n_ctx == 0 {
            return Err(LlamaError::ModelLoad("n_ctx must be positive".into()));
        }
        if let Some(adapter) = &params.lora_adapter {
            return Err(LlamaError::ModelLoad(format!(
                "LoRA adapter {adapter} is not supported by the tiny runtime"
            )));
        }

        let ignored = params.device_overrides();
        if !ignored.is_empty() {
            warn!(?ignored, "tiny runtime ignores device options");
        }

        let mut rng = SeededRng::new(params.seed);
        let mut weights = |n: usize| -> Vec<f32> { (0..n).map(|_| rng.next_f32() * 2.0 - 1.0).collect() };
        let embed = weights(N_VOCAB * N_EMBD);
        let head = weights(N_EMBD * N_VOCAB);

        debug!(
            n_ctx = params.n_ctx,
            seed = params.seed,
            embeddings = params.embeddings,
            "tiny runtime loaded"
        );
        Ok(Self {
            n_ctx: params.n_ctx,
            embeddings_enabled: params.embeddings,
            n_threads: 1,
            embed,
            head,
            tokens: Vec::with_capacity(params.n_ctx),
            logits: None,
            hidden: None,
        })
    }

    /// Shorthand for `load` with only the context size and seed set.
    pub fn new(n_ctx: usize, seed: u64) -> Result<Self> {
        Self::load(&ModelParams::new().with_n_ctx(n_ctx).with_seed(seed))
    }

    /// Tokens currently positioned in the context.
    pub fn n_past(&self) -> usize {
        self.tokens.len()
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    fn char_token(c: char) -> TokenId {
        match c {
            '\n' => NEWLINE,
            ' '..='~' => FIRST_PRINTABLE + (c as TokenId - ' ' as TokenId),
            _ => FIRST_PRINTABLE + ('?' as TokenId - ' ' as TokenId),
        }
    }

    fn valid_token(token: TokenId) -> bool {
        token >= 0 && (token as usize) < N_VOCAB
    }

    /// Recompute hidden state and logits from the positioned tokens.
    fn forward(&mut self) {
        let mut hidden = vec![0.0f32; N_EMBD];
        for &token in &self.tokens {
            let row = &self.embed[token as usize * N_EMBD..(token as usize + 1) * N_EMBD];
            for (h, e) in hidden.iter_mut().zip(row) {
                *h = *h * DECAY + e;
            }
        }

        let mut logits = vec![0.0f32; N_VOCAB];
        for (d, h) in hidden.iter().enumerate() {
            let row = &self.head[d * N_VOCAB..(d + 1) * N_VOCAB];
            for (l, w) in logits.iter_mut().zip(row) {
                *l += h * w;
            }
        }

        self.logits = Some(logits);
        self.hidden = Some(hidden);
    }

    fn encode_state(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(STATE_MAGIC)?;
        w.write_u32::<LittleEndian>(self.n_ctx as u32)?;
        w.write_u32::<LittleEndian>(self.tokens.len() as u32)?;
        w.write_u8(self.logits.is_some() as u8)?;
        for slot in 0..self.n_ctx {
            w.write_i32::<LittleEndian>(self.tokens.get(slot).copied().unwrap_or(-1))?;
        }
        match &self.logits {
            Some(logits) => {
                for &l in logits {
                    w.write_f32::<LittleEndian>(l)?;
                }
            }
            None => {
                for _ in 0..N_VOCAB {
                    w.write_f32::<LittleEndian>(0.0)?;
                }
            }
        }
        Ok(())
    }

    fn decode_state(&self, r: &mut impl Read) -> std::io::Result<Option<(Vec<TokenId>, Option<Vec<f32>>)>> {
        if r.read_u32::<LittleEndian>()? != STATE_MAGIC {
            return Ok(None);
        }
        if r.read_u32::<LittleEndian>()? as usize != self.n_ctx {
            return Ok(None);
        }
        let n_past = r.read_u32::<LittleEndian>()? as usize;
        if n_past > self.n_ctx {
            return Ok(None);
        }
        let has_logits = r.read_u8()? != 0;

        let mut tokens = Vec::with_capacity(n_past);
        for slot in 0..self.n_ctx {
            let token = r.read_i32::<LittleEndian>()?;
            if slot < n_past {
                if !Self::valid_token(token) {
                    return Ok(None);
                }
                tokens.push(token);
            }
        }

        let mut logits = vec![0.0f32; N_VOCAB];
        r.read_f32_into::<LittleEndian>(&mut logits)?;
        Ok(Some((tokens, has_logits.then_some(logits))))
    }
}

impl Runtime for TinyRuntime {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.chars().map(Self::char_token));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String> {
        match token {
            BOS | EOS => Ok(String::new()),
            NEWLINE => Ok("\n".into()),
            t if Self::valid_token(t) => {
                let c = (b' ' + (t - FIRST_PRINTABLE) as u8) as char;
                Ok(c.to_string())
            }
            t => Err(LlamaError::Tokenize(format!("unknown token id {t}"))),
        }
    }

    fn decode(&mut self, batch: &[TokenId], n_past: usize) -> Result<()> {
        if batch.is_empty() {
            return Err(LlamaError::Decode("empty batch".into()));
        }
        if n_past > self.tokens.len() {
            return Err(LlamaError::Decode(format!(
                "n_past {n_past} is past the {} positioned tokens",
                self.tokens.len()
            )));
        }
        if n_past + batch.len() > self.n_ctx {
            return Err(LlamaError::Decode(format!(
                "batch of {} at {n_past} exceeds n_ctx {}",
                batch.len(),
                self.n_ctx
            )));
        }
        if let Some(&bad) = batch.iter().find(|&&t| !Self::valid_token(t)) {
            return Err(LlamaError::Decode(format!("token id {bad} out of range")));
        }

        self.tokens.truncate(n_past);
        self.tokens.extend_from_slice(batch);
        self.forward();
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn embeddings(&self) -> Option<&[f32]> {
        if !self.embeddings_enabled {
            return None;
        }
        self.hidden.as_deref()
    }

    fn state_size(&self) -> usize {
        STATE_HEADER + 4 * self.n_ctx + 4 * N_VOCAB
    }

    fn state_get(&self, dst: &mut [u8]) -> usize {
        let size = self.state_size();
        if dst.len() < size {
            return 0;
        }
        let mut w = &mut dst[..size];
        match self.encode_state(&mut w) {
            Ok(()) => size,
            Err(_) => 0,
        }
    }

    fn state_set(&mut self, src: &[u8]) -> usize {
        if src.len() != self.state_size() {
            return 0;
        }
        match self.decode_state(&mut Cursor::new(src)) {
            Ok(Some((tokens, logits))) => {
                self.tokens = tokens;
                if self.tokens.is_empty() {
                    self.hidden = None;
                    self.logits = None;
                } else {
                    self.forward();
                }
                if logits.is_some() {
                    self.logits = logits;
                }
                src.len()
            }
            _ => 0,
        }
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_ctx_train(&self) -> usize {
        N_CTX_TRAIN
    }

    fn n_vocab(&self) -> usize {
        N_VOCAB
    }

    fn n_embd(&self) -> usize {
        N_EMBD
    }

    fn token_bos(&self) -> Option<TokenId> {
        Some(BOS)
    }

    fn add_bos(&self) -> bool {
        true
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn eog_tokens(&self) -> Vec<TokenId> {
        vec![EOS]
    }

    fn embeddings_enabled(&self) -> bool {
        self.embeddings_enabled
    }

    fn set_n_threads(&mut self, n_threads: usize) {
        self.n_threads = n_threads.max(1);
    }

    fn model_info(&self) -> ModelInfo {
        let param_count = (self.embed.len() + self.head.len()) as u64;
        ModelInfo {
            vocab_size: N_VOCAB,
            context_length: N_CTX_TRAIN,
            embedding_size: N_EMBD,
            layer_count: 1,
            model_size: param_count * 4,
            param_count,
            description: "tiny char-level runtime".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> TinyRuntime {
        TinyRuntime::new(32, 7).unwrap()
    }

    #[test]
    fn tokenize_maps_printable_ascii() {
        let rt = tiny();
        let tokens = rt.tokenize("Hi\n", true).unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0], BOS);
        assert_eq!(tokens[3], NEWLINE);

        let text: String = tokens
            .iter()
            .map(|&t| rt.token_to_piece(t).unwrap())
            .collect();
        assert_eq!(text, "Hi\n");
    }

    #[test]
    fn unknown_characters_become_question_marks() {
        let rt = tiny();
        let tokens = rt.tokenize("é", false).unwrap();
        assert_eq!(rt.token_to_piece(tokens[0]).unwrap(), "?");
    }

    #[test]
    fn token_to_piece_rejects_out_of_range() {
        let rt = tiny();
        assert!(rt.token_to_piece(N_VOCAB as TokenId).is_err());
        assert!(rt.token_to_piece(-1).is_err());
    }

    #[test]
    fn same_seed_same_logits() {
        let mut a = tiny();
        let mut b = tiny();
        a.decode(&[BOS, 10, 11], 0).unwrap();
        b.decode(&[BOS, 10, 11], 0).unwrap();
        assert_eq!(a.logits(), b.logits());
        assert_eq!(a.logits().unwrap().len(), N_VOCAB);
    }

    #[test]
    fn decode_overwrites_from_n_past() {
        let mut rt = tiny();
        rt.decode(&[BOS, 10, 11, 12], 0).unwrap();
        rt.decode(&[20], 2).unwrap();
        assert_eq!(rt.n_past(), 3);

        let mut fresh = tiny();
        fresh.decode(&[BOS, 10, 20], 0).unwrap();
        assert_eq!(rt.logits(), fresh.logits());
    }

    #[test]
    fn decode_rejects_gaps_and_overflow() {
        let mut rt = tiny();
        assert!(rt.decode(&[BOS], 1).is_err());
        assert!(rt.decode(&vec![10; 33], 0).is_err());
        assert!(rt.decode(&[999], 0).is_err());
        assert!(rt.decode(&[], 0).is_err());
    }

    #[test]
    fn state_round_trip() {
        let mut rt = tiny();
        rt.decode(&[BOS, 40, 41], 0).unwrap();
        let mut buf = vec![0u8; rt.state_size()];
        assert_eq!(rt.state_get(&mut buf), buf.len());

        let mut other = tiny();
        assert_eq!(other.state_set(&buf), buf.len());
        assert_eq!(other.n_past(), 3);
        assert_eq!(other.logits(), rt.logits());
    }

    #[test]
    fn state_set_rejects_foreign_buffers() {
        let mut rt = tiny();
        let mut buf = vec![0u8; rt.state_size()];
        rt.state_get(&mut buf);

        buf[0] ^= 0xff;
        assert_eq!(rt.state_set(&buf), 0);
        assert_eq!(rt.state_set(&buf[1..]), 0);

        let mut bigger = TinyRuntime::new(64, 7).unwrap();
        let mut ok = vec![0u8; rt.state_size()];
        rt.state_get(&mut ok);
        assert_eq!(bigger.state_set(&ok), 0);
    }

    #[test]
    fn embeddings_only_when_enabled() {
        let mut rt = tiny();
        rt.decode(&[BOS, 40], 0).unwrap();
        assert!(rt.embeddings().is_none());

        let params = ModelParams::new().with_n_ctx(32).with_embeddings(true);
        let mut rt = TinyRuntime::load(&params).unwrap();
        rt.decode(&[BOS, 40], 0).unwrap();
        assert_eq!(rt.embeddings().unwrap().len(), N_EMBD);
    }

    #[test]
    fn load_accepts_device_options() {
        let mut params = ModelParams::new()
            .with_n_ctx(32)
            .with_gpu_layers(99)
            .with_tensor_split("1/1")
            .unwrap();
        params.use_mlock = true;
        params.numa = true;
        let mut rt = TinyRuntime::load(&params).unwrap();
        // same seed, same weights: device options do not change the output
        let mut plain = TinyRuntime::new(32, 0).unwrap();
        rt.decode(&[BOS, 40], 0).unwrap();
        plain.decode(&[BOS, 40], 0).unwrap();
        assert_eq!(rt.logits(), plain.logits());
    }

    #[test]
    fn load_rejects_zero_context_and_lora() {
        assert!(TinyRuntime::load(&ModelParams::new().with_n_ctx(0)).is_err());
        let mut params = ModelParams::new();
        params.lora_adapter = Some("adapter.bin".into());
        assert!(matches!(
            TinyRuntime::load(&params),
            Err(LlamaError::ModelLoad(_))
        ));
    }
}
