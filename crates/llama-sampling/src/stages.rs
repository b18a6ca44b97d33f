//! Sampler stages.
//!
//! Each variant transforms a [`Candidates`] list in place. Filter stages shrink
//! it, penalty stages rescale logits, and the selection stages (`Greedy`,
//! `Dist`, `MirostatV1`, `MirostatV2`) set `selected`. Stateful stages learn
//! from [`SamplerStage::accept`], which the chain calls once per generated token.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use llama_engine::{LogitBias, TokenId};

use crate::grammar::GrammarMatcher;
use crate::{Candidates, SamplingError, SamplingResult, SeededRng};

/// Repeat, frequency and presence penalties over a sliding token window.
#[derive(Debug, Clone)]
pub struct Penalties {
    pub last_n: usize,
    pub repeat: f32,
    pub frequency: f32,
    pub presence: f32,
    window: VecDeque<TokenId>,
}

impl Penalties {
    pub fn new(last_n: usize, repeat: f32, frequency: f32, presence: f32) -> Self {
        Self {
            last_n,
            repeat,
            frequency,
            presence,
            window: VecDeque::with_capacity(last_n),
        }
    }

    fn apply(&self, cur: &mut Candidates) {
        if self.window.is_empty() {
            return;
        }
        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &t in &self.window {
            *counts.entry(t).or_default() += 1;
        }

        for t in &mut cur.data {
            let Some(&count) = counts.get(&t.id) else {
                continue;
            };
            // Dividing a negative logit would raise it, so scale those up instead.
            if t.logit <= 0.0 {
                t.logit *= self.repeat;
            } else {
                t.logit /= self.repeat;
            }
            t.logit -= count as f32 * self.frequency + self.presence;
        }
        cur.sorted = false;
    }

    fn accept(&mut self, token: TokenId) {
        if self.last_n == 0 {
            return;
        }
        self.window.push_back(token);
        while self.window.len() > self.last_n {
            self.window.pop_front();
        }
    }
}

/// "Don't Repeat Yourself": penalizes tokens that would extend a token
/// sequence already seen in the lookback window.
///
/// A candidate that previously followed a match of length `L` against the
/// current suffix is penalized by `multiplier * base^(L - allowed_length)`
/// once `L >= allowed_length`. Matching never extends across a sequence
/// breaker token.
#[derive(Debug, Clone)]
pub struct Dry {
    pub multiplier: f32,
    pub base: f32,
    pub allowed_length: usize,
    pub last_n: usize,
    breakers: Arc<HashSet<TokenId>>,
    history: VecDeque<TokenId>,
}

impl Dry {
    pub fn new(
        multiplier: f32,
        base: f32,
        allowed_length: usize,
        last_n: usize,
        breakers: Arc<HashSet<TokenId>>,
    ) -> Self {
        Self {
            multiplier,
            base,
            allowed_length,
            last_n,
            breakers,
            history: VecDeque::new(),
        }
    }

    /// Longest suffix match preceding each earlier continuation token.
    fn match_lengths(&self) -> HashMap<TokenId, usize> {
        let h = &self.history;
        let n = h.len();
        let mut longest: HashMap<TokenId, usize> = HashMap::new();
        if n < 2 || self.breakers.contains(&h[n - 1]) {
            return longest;
        }

        for i in 1..n {
            let mut k = 0;
            while k < i && h[i - 1 - k] == h[n - 1 - k] && !self.breakers.contains(&h[n - 1 - k]) {
                k += 1;
            }
            if k > 0 {
                let entry = longest.entry(h[i]).or_default();
                *entry = (*entry).max(k);
            }
        }
        longest
    }

    fn apply(&self, cur: &mut Candidates) {
        if self.multiplier <= 0.0 || self.base < 1.0 {
            return;
        }
        let longest = self.match_lengths();
        if longest.is_empty() {
            return;
        }

        let max_exponent = if self.base > 1.0 {
            f32::MAX.ln() / self.base.ln()
        } else {
            f32::MAX
        };
        for t in &mut cur.data {
            let Some(&len) = longest.get(&t.id) else {
                continue;
            };
            if len >= self.allowed_length {
                let exponent = ((len - self.allowed_length) as f32).min(max_exponent);
                t.logit -= self.multiplier * self.base.powf(exponent);
            }
        }
        cur.sorted = false;
    }

    fn accept(&mut self, token: TokenId) {
        if self.last_n == 0 {
            return;
        }
        self.history.push_back(token);
        while self.history.len() > self.last_n {
            self.history.pop_front();
        }
    }
}

/// Adaptive-entropy sampling state shared by both mirostat versions.
#[derive(Debug, Clone)]
pub struct Mirostat {
    pub tau: f32,
    pub eta: f32,
    /// Tokens used to estimate `s_hat` (v1 only).
    pub m: usize,
    pub n_vocab: usize,
    mu: f32,
    rng: SeededRng,
}

impl Mirostat {
    pub fn new(tau: f32, eta: f32, m: usize, n_vocab: usize, seed: u64) -> Self {
        Self {
            tau,
            eta,
            m,
            n_vocab,
            mu: 2.0 * tau,
            rng: SeededRng::new(seed),
        }
    }

    pub fn mu(&self) -> f32 {
        self.mu
    }

    fn select_and_update(&mut self, cur: &mut Candidates) -> SamplingResult<()> {
        cur.softmax();
        let idx = cur.sample_index(self.rng.next_f32())?;
        let observed_surprise = -cur.data[idx].p.log2();
        self.mu -= self.eta * (observed_surprise - self.tau);
        cur.selected = Some(idx);
        Ok(())
    }

    fn apply_v1(&mut self, cur: &mut Candidates) -> SamplingResult<()> {
        cur.softmax();
        let n = cur.len();
        if n == 0 {
            return Err(SamplingError::NoValidTokens);
        }

        // Estimate the Zipf exponent from the top-m probabilities.
        let m = self.m.min(n);
        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..m.saturating_sub(1) {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (cur.data[i].p / cur.data[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;
        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2f32.powf(self.mu))
            / (1.0 - (self.n_vocab as f32).powf(-epsilon_hat)))
        .powf(1.0 / s_hat);

        let k = if k.is_finite() && k >= 1.0 {
            (k as usize).min(n)
        } else if k.is_finite() {
            1
        } else {
            n
        };
        cur.truncate(k);
        self.select_and_update(cur)
    }

    fn apply_v2(&mut self, cur: &mut Candidates) -> SamplingResult<()> {
        cur.softmax();
        let cut = cur
            .data
            .iter()
            .position(|t| -t.p.log2() > self.mu)
            .unwrap_or(cur.len())
            .max(1);
        cur.truncate(cut);
        self.select_and_update(cur)
    }
}

/// Exclude Top Choices: with some probability, drop every token above the
/// threshold except the least likely of them.
#[derive(Debug, Clone)]
pub struct Xtc {
    pub probability: f32,
    pub threshold: f32,
    pub min_keep: usize,
    rng: SeededRng,
}

impl Xtc {
    pub fn new(probability: f32, threshold: f32, min_keep: usize, seed: u64) -> Self {
        Self {
            probability,
            threshold,
            min_keep,
            rng: SeededRng::new(seed),
        }
    }

    fn apply(&mut self, cur: &mut Candidates) {
        if self.probability <= 0.0 || self.threshold > 0.5 || cur.len() < 2 {
            return;
        }
        if self.rng.next_f32() > self.probability {
            return;
        }

        cur.softmax();
        let mut pos_last = 0;
        for (i, t) in cur.data.iter().enumerate() {
            if t.p >= self.threshold {
                pos_last = i;
            } else {
                break;
            }
        }
        if pos_last > 0 && cur.len() - pos_last >= self.min_keep {
            cur.data.drain(..pos_last);
        }
    }
}

/// Grammar-constrained terminal stage.
#[derive(Debug, Clone)]
pub struct GrammarStage {
    matcher: GrammarMatcher,
    pieces: Arc<[String]>,
    eog: Arc<HashSet<TokenId>>,
}

impl GrammarStage {
    pub fn new(matcher: GrammarMatcher, pieces: Arc<[String]>, eog: Arc<HashSet<TokenId>>) -> Self {
        Self {
            matcher,
            pieces,
            eog,
        }
    }

    /// Whether `token` keeps the output inside the grammar.
    ///
    /// End-of-generation is only allowed once the grammar is complete; tokens
    /// with an empty rendering never advance it and are rejected.
    pub fn allows(&self, token: TokenId) -> bool {
        if self.eog.contains(&token) {
            return self.matcher.is_complete();
        }
        match self.pieces.get(token as usize) {
            Some(piece) if !piece.is_empty() => self.matcher.accepts(piece),
            _ => false,
        }
    }

    /// Remove every grammar-invalid candidate.
    fn apply(&self, cur: &mut Candidates) -> SamplingResult<()> {
        cur.retain(|t| self.allows(t.id));
        if cur.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }
        Ok(())
    }

    fn accept(&mut self, token: TokenId) -> SamplingResult<()> {
        if self.eog.contains(&token) {
            return Ok(());
        }
        let piece = self
            .pieces
            .get(token as usize)
            .ok_or(SamplingError::GrammarRejected(token))?;
        if self.matcher.accept(piece) {
            Ok(())
        } else {
            Err(SamplingError::GrammarRejected(token))
        }
    }

}

/// One step of a [`SamplerChain`](crate::SamplerChain).
#[derive(Debug, Clone)]
pub enum SamplerStage {
    /// Arg-max selection.
    Greedy,
    LogitBias(Vec<LogitBias>),
    Dry(Dry),
    Penalties(Penalties),
    Temperature(f32),
    MirostatV1(Mirostat),
    MirostatV2(Mirostat),
    TopNSigma(f32),
    TopK(i32),
    Typical { p: f32, min_keep: usize },
    TopP { p: f32, min_keep: usize },
    MinP { p: f32, min_keep: usize },
    Xtc(Xtc),
    /// Seeded draw from the softmax distribution.
    Dist(SeededRng),
    Grammar(GrammarStage),
}

impl SamplerStage {
    pub fn name(&self) -> &'static str {
        match self {
            SamplerStage::Greedy => "greedy",
            SamplerStage::LogitBias(_) => "logit-bias",
            SamplerStage::Dry(_) => "dry",
            SamplerStage::Penalties(_) => "penalties",
            SamplerStage::Temperature(_) => "temp",
            SamplerStage::MirostatV1(_) => "mirostat",
            SamplerStage::MirostatV2(_) => "mirostat-v2",
            SamplerStage::TopNSigma(_) => "top-n-sigma",
            SamplerStage::TopK(_) => "top-k",
            SamplerStage::Typical { .. } => "typical",
            SamplerStage::TopP { .. } => "top-p",
            SamplerStage::MinP { .. } => "min-p",
            SamplerStage::Xtc(_) => "xtc",
            SamplerStage::Dist(_) => "dist",
            SamplerStage::Grammar(_) => "grammar",
        }
    }

    /// Whether this stage picks the token.
    pub fn is_selection(&self) -> bool {
        matches!(
            self,
            SamplerStage::Greedy
                | SamplerStage::Dist(_)
                | SamplerStage::MirostatV1(_)
                | SamplerStage::MirostatV2(_)
        )
    }

    pub fn apply(&mut self, cur: &mut Candidates) -> SamplingResult<()> {
        match self {
            SamplerStage::Greedy => {
                cur.selected = Some(cur.argmax().ok_or(SamplingError::NoValidTokens)?);
            }
            SamplerStage::LogitBias(biases) => apply_logit_bias(cur, biases),
            SamplerStage::Dry(dry) => dry.apply(cur),
            SamplerStage::Penalties(pen) => pen.apply(cur),
            SamplerStage::Temperature(t) => {
                for d in &mut cur.data {
                    d.logit /= *t;
                }
            }
            SamplerStage::MirostatV1(m) => m.apply_v1(cur)?,
            SamplerStage::MirostatV2(m) => m.apply_v2(cur)?,
            SamplerStage::TopNSigma(n) => apply_top_n_sigma(cur, *n),
            SamplerStage::TopK(k) => apply_top_k(cur, *k),
            SamplerStage::Typical { p, min_keep } => apply_typical(cur, *p, *min_keep),
            SamplerStage::TopP { p, min_keep } => apply_top_p(cur, *p, *min_keep),
            SamplerStage::MinP { p, min_keep } => apply_min_p(cur, *p, *min_keep),
            SamplerStage::Xtc(xtc) => xtc.apply(cur),
            SamplerStage::Dist(rng) => {
                cur.softmax();
                cur.selected = Some(cur.sample_index(rng.next_f32())?);
            }
            SamplerStage::Grammar(g) => g.apply(cur)?,
        }
        Ok(())
    }

    /// Record a generated token.
    pub fn accept(&mut self, token: TokenId) -> SamplingResult<()> {
        match self {
            SamplerStage::Dry(dry) => dry.accept(token),
            SamplerStage::Penalties(pen) => pen.accept(token),
            SamplerStage::Grammar(g) => g.accept(token)?,
            _ => {}
        }
        Ok(())
    }
}

fn apply_logit_bias(cur: &mut Candidates, biases: &[LogitBias]) {
    for bias in biases {
        // Fast path: candidates are still in vocabulary order.
        let idx = match cur.data.get(bias.token as usize) {
            Some(t) if t.id == bias.token => Some(bias.token as usize),
            _ => cur.data.iter().position(|t| t.id == bias.token),
        };
        if let Some(i) = idx {
            cur.data[i].logit += bias.bias;
        }
    }
    cur.sorted = false;
}

fn apply_top_k(cur: &mut Candidates, k: i32) {
    if k <= 0 {
        return;
    }
    let k = (k as usize).min(cur.len());
    cur.sort_by_logit();
    cur.truncate(k);
}

fn apply_top_p(cur: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    cur.softmax();

    let mut cumsum = 0.0;
    let mut last_idx = cur.len();
    for (i, t) in cur.data.iter().enumerate() {
        cumsum += t.p;
        if cumsum >= p && i + 1 >= min_keep {
            last_idx = i + 1;
            break;
        }
    }
    cur.truncate(last_idx);
}

fn apply_min_p(cur: &mut Candidates, p: f32, min_keep: usize) {
    if p <= 0.0 || cur.is_empty() {
        return;
    }
    cur.sort_by_logit();

    let min_logit = cur.data[0].logit + p.ln();
    let keep = cur
        .data
        .iter()
        .position(|t| t.logit < min_logit)
        .unwrap_or(cur.len())
        .max(min_keep);
    cur.truncate(keep);
}

fn apply_typical(cur: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    cur.softmax();

    let entropy: f32 = cur
        .data
        .iter()
        .filter(|t| t.p > 0.0)
        .map(|t| -t.p * t.p.ln())
        .sum();

    let mut order: Vec<(f32, usize)> = cur
        .data
        .iter()
        .enumerate()
        .map(|(i, t)| ((-t.p.ln() - entropy).abs(), i))
        .collect();
    order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut last_idx = order.len();
    for (i, &(_, idx)) in order.iter().enumerate() {
        cumsum += cur.data[idx].p;
        if cumsum > p && i + 1 >= min_keep {
            last_idx = i + 1;
            break;
        }
    }

    cur.data = order[..last_idx].iter().map(|&(_, idx)| cur.data[idx]).collect();
    cur.sorted = false;
}

fn apply_top_n_sigma(cur: &mut Candidates, n: f32) {
    if n <= 0.0 {
        return;
    }
    let finite: Vec<f32> = cur
        .data
        .iter()
        .map(|t| t.logit)
        .filter(|l| l.is_finite())
        .collect();
    if finite.is_empty() {
        return;
    }

    let max = finite.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = finite.iter().sum::<f32>() / finite.len() as f32;
    let var = finite.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / finite.len() as f32;
    let threshold = max - n * var.sqrt();

    cur.retain(|t| t.logit >= threshold);
}
