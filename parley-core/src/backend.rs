//! Backend seam between the engine and the tensor layer.
//!
//! The engine drives generation through [`ModelBackend`] without knowing how
//! logits are produced: a candle model ([`crate::model::CandleBackend`]), a
//! remote process, or a scripted mock in tests all fit behind the same trait.

use crate::error::Result;

/// A batch of tokens submitted to the backend for one decode call.
///
/// `positions[i]` is the attention position token `i` occupies;
/// `logits_mask[i]` marks the positions whose logits must be retained for
/// sampling. The engine requests logits for the final position only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeBatch {
    pub tokens: Vec<u32>,
    pub positions: Vec<usize>,
    pub logits_mask: Vec<bool>,
}

impl DecodeBatch {
    /// Multi-token prefill starting at `start_pos`, logits on the last token
    /// only when `want_logits` is set.
    pub fn prefill(tokens: &[u32], start_pos: usize, want_logits: bool) -> Self {
        let n = tokens.len();
        let mut logits_mask = vec![false; n];
        if let Some(last) = logits_mask.last_mut() {
            *last = want_logits;
        }
        Self {
            tokens: tokens.to_vec(),
            positions: (start_pos..start_pos + n).collect(),
            logits_mask,
        }
    }

    /// Single-token decode step at `pos`.
    pub fn single(token: u32, pos: usize) -> Self {
        Self {
            tokens: vec![token],
            positions: vec![pos],
            logits_mask: vec![true],
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Abstract model backend consumed by the engine.
///
/// Implementations own the attention state. The engine guarantees that
/// decode calls are sequential and that positions are contiguous: after a
/// successful `decode` of positions `[a, b)`, the next call starts at `b`
/// unless `kv_drop`/`kv_clear` rewound the state first.
pub trait ModelBackend {
    /// Number of entries in the vocabulary.
    fn vocab_size(&self) -> usize;

    /// Model embedding width.
    fn embed_dim(&self) -> usize;

    /// Maximum context length the backend was configured with.
    fn n_ctx(&self) -> usize;

    fn bos_id(&self) -> Option<u32>;
    fn eos_id(&self) -> Option<u32>;
    fn pad_id(&self) -> Option<u32>;

    /// Resolve a vocabulary surface form to its single token id, if any.
    fn token_to_id(&self, text: &str) -> Option<u32>;

    /// Surface piece for a token id. With `render_special` unset, special
    /// tokens render as the empty string.
    fn token_to_piece(&self, id: u32, render_special: bool) -> String;

    /// Convert text to token ids. `allow_special` controls whether marker
    /// strings like `<|im_start|>` map to their dedicated ids or are
    /// tokenized as literal text.
    fn tokenize(&self, text: &str, add_bos: bool, allow_special: bool) -> Result<Vec<u32>>;

    /// Run one forward pass over the batch, materializing its tokens in the
    /// attention state.
    fn decode(&mut self, batch: &DecodeBatch) -> Result<()>;

    /// Logits row for a position marked in the last decoded batch.
    /// Backends may retain only the most recent marked position.
    fn logits_at(&self, pos: usize) -> Result<Vec<f32>>;

    /// Discard attention state for positions `[start, end)`.
    fn kv_drop(&mut self, start: usize, end: usize);

    /// Discard all attention state.
    fn kv_clear(&mut self);
}
