//! KV-cache accounting and the shared-prefix store
//!
//! The backend owns the attention tensors; this module tracks which tokens
//! those tensors represent. [`KvState`] mirrors the backend KV on the token
//! level so the engine can compute how much of a new prompt is already
//! materialized. [`PrefixCache`] is a small LRU store mapping token prefixes
//! to opaque backend blobs, usable across engines behind an external lock.

use std::time::Instant;
use tracing::debug;

/// Token-level mirror of the backend's attention state.
///
/// `cached_tokens` counts tokens the backend has actually accepted; the
/// history may run ahead of it only after a session load, where the history
/// is pre-staged and the cache is empty. `check_reusable` caps at
/// `cached_tokens`, so a stale history never claims reuse the backend
/// cannot serve.
#[derive(Debug, Default)]
pub struct KvState {
    token_history: Vec<u32>,
    cached_tokens: usize,
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_tokens(&self) -> usize {
        self.cached_tokens
    }

    pub fn history(&self) -> &[u32] {
        &self.token_history
    }

    /// Length of the longest common prefix of `new_tokens` and the history,
    /// capped at the number of tokens the backend holds.
    pub fn check_reusable(&self, new_tokens: &[u32]) -> usize {
        let reusable = self
            .token_history
            .iter()
            .zip(new_tokens)
            .take_while(|(a, b)| a == b)
            .count();
        reusable.min(self.cached_tokens)
    }

    /// Replace the history after a prefill: everything in `tokens` is now
    /// materialized in the backend.
    pub fn update(&mut self, tokens: &[u32]) {
        self.token_history = tokens.to_vec();
        self.cached_tokens = tokens.len();
    }

    /// Append one generated token to the history. It does not count as
    /// cached until [`KvState::mark_cached`] confirms the backend took it.
    pub fn push(&mut self, token: u32) {
        self.token_history.push(token);
    }

    pub fn mark_cached(&mut self, n: usize) {
        self.cached_tokens = n;
    }

    /// Shrink both the history and the cached count to at most `length`.
    pub fn truncate(&mut self, length: usize) {
        if length < self.token_history.len() {
            self.token_history.truncate(length);
        }
        self.cached_tokens = self.cached_tokens.min(length);
    }

    /// Stage a restored history with no backing cache; the next generate
    /// re-prefills from scratch.
    pub fn restore(&mut self, tokens: Vec<u32>) {
        self.token_history = tokens;
        self.cached_tokens = 0;
    }

    pub fn clear(&mut self) {
        self.token_history.clear();
        self.cached_tokens = 0;
    }
}

/// One cached prefix: the tokens it covers and the backend's opaque
/// serialized state for them.
#[derive(Debug, Clone)]
pub struct PrefixEntry {
    pub tokens: Vec<u32>,
    pub blob: Vec<u8>,
    pub last_access: Instant,
    pub access_count: u64,
}

/// Bounded store of [`PrefixEntry`] values with LRU eviction.
///
/// Not synchronized; sharing across engines needs an external mutex.
#[derive(Debug)]
pub struct PrefixCache {
    entries: Vec<PrefixEntry>,
    max_entries: usize,
}

impl PrefixCache {
    pub const DEFAULT_MAX_ENTRIES: usize = 10;

    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_entries),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the longest entry whose tokens are a full prefix of
    /// `tokens`. Ties go to the most recently accessed entry.
    pub fn find_prefix(&self, tokens: &[u32]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.tokens.len() > tokens.len() || entry.tokens != tokens[..entry.tokens.len()] {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    let current = &self.entries[b];
                    if entry.tokens.len() > current.tokens.len()
                        || (entry.tokens.len() == current.tokens.len()
                            && entry.last_access > current.last_access)
                    {
                        best = Some(i);
                    }
                }
            }
        }
        best
    }

    /// Insert or refresh a prefix. An entry with identical tokens is
    /// overwritten in place; otherwise the least recently used entry is
    /// evicted once the store is full.
    pub fn add_prefix(&mut self, tokens: Vec<u32>, blob: Vec<u8>) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.tokens == tokens) {
            existing.blob = blob;
            existing.last_access = Instant::now();
            existing.access_count += 1;
            return;
        }

        if self.entries.len() >= self.max_entries {
            self.evict_lru();
        }

        self.entries.push(PrefixEntry {
            tokens,
            blob,
            last_access: Instant::now(),
            access_count: 1,
        });
    }

    /// Fetch an entry, refreshing its access stamp and count. The read is
    /// logically const; the touch is why this takes `&mut self`.
    pub fn get_entry(&mut self, index: usize) -> Option<&PrefixEntry> {
        let entry = self.entries.get_mut(index)?;
        entry.last_access = Instant::now();
        entry.access_count += 1;
        Some(&*entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_lru(&mut self) {
        let Some(lru) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(i, _)| i)
        else {
            return;
        };
        let evicted = self.entries.remove(lru);
        debug!(tokens = evicted.tokens.len(), "evicted LRU prefix entry");
    }
}

impl Default for PrefixCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ENTRIES)
    }
}
