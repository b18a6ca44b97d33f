//! # llama-kv
//!
//! Bookkeeping for the runtime's working set (its KV cache) during a
//! generation call.
//!
//! Supports:
//! - **TokenHistory**: the tokens currently positioned in the runtime, in order.
//!   Its length is the next decode position (`n_past`).
//! - **ContextWindow**: the overflow policy. When the next batch would not fit,
//!   the history is cut back to a retained prefix and part of the discarded
//!   region is queued for re-decoding.
//!
//! ## Lossy window
//!
//! The shift keeps the first `keep = max(1, n_keep)` tokens, then re-feeds
//! the slice `[keep, keep + n_left / 2)` of the history and drops everything
//! after it. The re-fed slice is the earlier half of the non-retained tokens.
//! The usual prose for this policy says the older half is discarded; the index
//! formula above is the one llama.cpp bindings implement, and it wins over
//! that prose here. Anything dropped is gone from the runtime's attention
//! state for good. This is an approximate sliding window, not unbounded
//! memory.

use std::fmt;

use llama_engine::TokenId;
use tracing::debug;

/// Error type for working-set operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },
}

impl From<KVError> for llama_engine::LlamaError {
    fn from(err: KVError) -> Self {
        llama_engine::LlamaError::Decode(err.to_string())
    }
}

/// Tokens occupying the runtime's working set.
///
/// Grows by appends; only [`ContextWindow::fit`] shortens it. Never reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHistory {
    tokens: Vec<TokenId>,
    capacity: usize,
}

impl TokenHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of positioned tokens, i.e. `n_past`.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.tokens.len()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Record a decoded batch.
    pub fn extend(&mut self, batch: &[TokenId]) -> Result<(), KVError> {
        let seq_len = self.tokens.len() + batch.len();
        if seq_len > self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len,
                max: self.capacity,
            });
        }
        self.tokens.extend_from_slice(batch);
        Ok(())
    }
}

/// Outcome of a window shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShift {
    pub n_past_before: usize,
    pub n_past_after: usize,
    /// Tokens moved from the history back into the pending batch.
    pub n_refed: usize,
    /// Tokens dropped for good.
    pub n_discarded: usize,
}

impl fmt::Display for WindowShift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n_past {} -> {} (re-fed {}, discarded {})",
            self.n_past_before, self.n_past_after, self.n_refed, self.n_discarded
        )
    }
}

/// The bounded-truncation overflow policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    n_ctx: usize,
    n_keep: usize,
}

impl ContextWindow {
    /// `n_keep` should already be clamped to the prompt length by the caller;
    /// [`ContextWindow::for_prompt`] does that.
    pub fn new(n_ctx: usize, n_keep: usize) -> Self {
        Self { n_ctx, n_keep }
    }

    /// Window whose retained prefix never reaches past the prompt.
    pub fn for_prompt(n_ctx: usize, n_keep: usize, prompt_len: usize) -> Self {
        Self::new(n_ctx, n_keep.min(prompt_len))
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_keep(&self) -> usize {
        self.n_keep
    }

    /// Make room for `pending` if it would overflow the context.
    ///
    /// With `n_past + pending > n_ctx`: keep `k = min(n_keep, n_past)` tokens,
    /// set `n_past = max(1, k)`, prepend history
    /// `[n_past, n_past + (old_n_past - n_past) / 2)` to `pending` and truncate
    /// the history to `n_past`. Returns `None` when nothing had to move.
    ///
    /// Fails with [`KVError::CapacityExceeded`] if the batch still does not fit
    /// afterwards (a retained prefix or a single batch as large as the context).
    pub fn fit(
        &self,
        history: &mut TokenHistory,
        pending: &mut Vec<TokenId>,
    ) -> Result<Option<WindowShift>, KVError> {
        let n_past = history.len();
        if n_past + pending.len() <= self.n_ctx {
            return Ok(None);
        }

        let n_keep = self.n_keep.min(n_past);
        let new_n_past = n_keep.max(1).min(n_past);
        let n_left = n_past - new_n_past;
        let refed_end = (new_n_past + n_left / 2).min(n_past);

        let refed: Vec<TokenId> = history.tokens[new_n_past..refed_end].to_vec();
        pending.splice(0..0, refed.iter().copied());
        history.tokens.truncate(new_n_past);

        let shift = WindowShift {
            n_past_before: n_past,
            n_past_after: new_n_past,
            n_refed: refed.len(),
            n_discarded: n_past - new_n_past - refed.len(),
        };
        debug!(%shift, n_keep, pending = pending.len(), "context window shifted");

        let seq_len = history.len() + pending.len();
        if seq_len > self.n_ctx {
            return Err(KVError::CapacityExceeded {
                seq_len,
                max: self.n_ctx,
            });
        }
        Ok(Some(shift))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize, capacity: usize) -> TokenHistory {
        let mut h = TokenHistory::new(capacity);
        let tokens: Vec<TokenId> = (0..n as TokenId).collect();
        h.extend(&tokens).unwrap();
        h
    }

    #[test]
    fn history_respects_capacity() {
        let mut h = TokenHistory::new(4);
        h.extend(&[1, 2, 3]).unwrap();
        assert_eq!(h.remaining(), 1);
        assert_eq!(
            h.extend(&[4, 5]),
            Err(KVError::CapacityExceeded { seq_len: 5, max: 4 })
        );
        assert_eq!(h.tokens(), &[1, 2, 3]);
    }

    #[test]
    fn no_shift_when_batch_fits() {
        let window = ContextWindow::new(8, 2);
        let mut h = history(7, 8);
        let mut pending = vec![100];
        assert_eq!(window.fit(&mut h, &mut pending).unwrap(), None);
        assert_eq!(h.len(), 7);
        assert_eq!(pending, vec![100]);
    }

    #[test]
    fn shift_keeps_prefix_and_refeeds_half() {
        let window = ContextWindow::new(10, 2);
        let mut h = history(10, 10);
        let mut pending = vec![100];

        let shift = window.fit(&mut h, &mut pending).unwrap().unwrap();
        // n_left = 8, re-feed [2, 6)
        assert_eq!(h.tokens(), &[0, 1]);
        assert_eq!(pending, vec![2, 3, 4, 5, 100]);
        assert_eq!(
            shift,
            WindowShift {
                n_past_before: 10,
                n_past_after: 2,
                n_refed: 4,
                n_discarded: 4,
            }
        );
    }

    #[test]
    fn zero_keep_retains_first_token() {
        let window = ContextWindow::new(6, 0);
        let mut h = history(6, 6);
        let mut pending = vec![100];
        window.fit(&mut h, &mut pending).unwrap();
        assert_eq!(h.tokens(), &[0]);
        // n_left = 5, re-feed [1, 3)
        assert_eq!(pending, vec![1, 2, 100]);
    }

    #[test]
    fn keep_larger_than_history_is_clamped() {
        let window = ContextWindow::new(4, 50);
        let mut h = history(4, 4);
        let mut pending = vec![100];
        // keep clamps to n_past, leaving nothing to free
        assert!(matches!(
            window.fit(&mut h, &mut pending),
            Err(KVError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn for_prompt_clamps_keep() {
        let window = ContextWindow::for_prompt(512, 64, 10);
        assert_eq!(window.n_keep(), 10);
    }

    #[test]
    fn oversized_batch_on_empty_history() {
        let window = ContextWindow::new(4, 0);
        let mut h = TokenHistory::new(4);
        let mut pending = vec![1, 2, 3, 4, 5];
        assert_eq!(
            window.fit(&mut h, &mut pending),
            Err(KVError::CapacityExceeded { seq_len: 5, max: 4 })
        );
    }

    #[test]
    fn shift_display() {
        let shift = WindowShift {
            n_past_before: 10,
            n_past_after: 2,
            n_refed: 4,
            n_discarded: 4,
        };
        assert_eq!(shift.to_string(), "n_past 10 -> 2 (re-fed 4, discarded 4)");
    }
}
