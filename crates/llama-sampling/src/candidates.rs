//! The candidate list every sampler stage operates on.

use llama_engine::TokenId;

use crate::{SamplingError, SamplingResult};

/// One vocabulary entry under consideration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    /// Probability, valid only after [`Candidates::softmax`].
    pub p: f32,
}

/// Candidate tokens for the next position.
///
/// Filters shrink `data`; `sorted` tracks whether it is in descending logit
/// order; `selected` is set by the selection stage.
#[derive(Debug, Clone)]
pub struct Candidates {
    pub data: Vec<TokenData>,
    pub sorted: bool,
    pub selected: Option<usize>,
}

impl Candidates {
    /// Build a candidate per logit, id = index.
    pub fn from_logits(logits: &[f32]) -> SamplingResult<Self> {
        if logits.is_empty() || logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::InvalidLogits);
        }
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenData {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Ok(Self {
            data,
            sorted: false,
            selected: None,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sort_by_logit(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Sort descending and fill `p` with the softmax of the logits.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_by_logit();

        let max_logit = self.data[0].logit;
        if max_logit == f32::NEG_INFINITY {
            for t in &mut self.data {
                t.p = 0.0;
            }
            return;
        }

        let mut sum = 0.0f32;
        for t in &mut self.data {
            t.p = (t.logit - max_logit).exp();
            sum += t.p;
        }
        for t in &mut self.data {
            t.p /= sum;
        }
    }

    /// Drop everything past the first `n` entries.
    pub fn truncate(&mut self, n: usize) {
        self.data.truncate(n);
    }

    /// Keep only candidates satisfying `keep`, preserving order.
    pub fn retain(&mut self, keep: impl FnMut(&TokenData) -> bool) {
        self.data.retain(keep);
        self.selected = None;
    }

    /// Index of the highest logit; ties resolve to the earliest entry.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, t) in self.data.iter().enumerate() {
            match best {
                Some(b) if self.data[b].logit >= t.logit => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Draw an index from the `p` distribution given a uniform `r` in [0, 1).
    pub fn sample_index(&self, r: f32) -> SamplingResult<usize> {
        let total: f32 = self.data.iter().map(|t| t.p).sum();
        if total.is_nan() || total <= 0.0 {
            return Err(SamplingError::NoValidTokens);
        }

        let target = r * total;
        let mut cumsum = 0.0;
        for (i, t) in self.data.iter().enumerate() {
            cumsum += t.p;
            if target < cumsum {
                return Ok(i);
            }
        }

        // Fallback to last token with nonzero probability
        self.data
            .iter()
            .rposition(|t| t.p > 0.0)
            .ok_or(SamplingError::NoValidTokens)
    }

    /// The token picked by the selection stage.
    pub fn selected_token(&self) -> SamplingResult<TokenId> {
        self.selected
            .and_then(|i| self.data.get(i))
            .map(|t| t.id)
            .ok_or(SamplingError::NoValidTokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_nan() {
        assert_eq!(
            Candidates::from_logits(&[]).unwrap_err(),
            SamplingError::InvalidLogits
        );
        assert_eq!(
            Candidates::from_logits(&[1.0, f32::NAN]).unwrap_err(),
            SamplingError::InvalidLogits
        );
    }

    #[test]
    fn softmax_sorts_and_normalizes() {
        let mut c = Candidates::from_logits(&[1.0, 3.0, 2.0]).unwrap();
        c.softmax();
        let ids: Vec<TokenId> = c.data.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 0]);
        let sum: f32 = c.data.iter().map(|t| t.p).sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn softmax_with_masked_logits() {
        let mut c = Candidates::from_logits(&[f32::NEG_INFINITY, 0.0]).unwrap();
        c.softmax();
        assert_eq!(c.data[0].id, 1);
        assert!((c.data[0].p - 1.0).abs() < 1e-6);
        assert_eq!(c.data[1].p, 0.0);
    }

    #[test]
    fn argmax_prefers_first_tie() {
        let c = Candidates::from_logits(&[2.0, 5.0, 5.0, 1.0]).unwrap();
        assert_eq!(c.argmax(), Some(1));
    }

    #[test]
    fn sample_index_respects_cumulative_mass() {
        let mut c = Candidates::from_logits(&[0.0, 0.0]).unwrap();
        c.softmax();
        assert_eq!(c.sample_index(0.1).unwrap(), 0);
        assert_eq!(c.sample_index(0.9).unwrap(), 1);
    }

    #[test]
    fn selected_token_requires_selection() {
        let mut c = Candidates::from_logits(&[0.0, 1.0]).unwrap();
        assert!(c.selected_token().is_err());
        c.selected = Some(1);
        assert_eq!(c.selected_token().unwrap(), 1);
    }
}
