//! Inference engine - orchestrates the format→encode→prefill→decode loop
//!
//! One engine drives one model through one generation at a time. Across
//! turns it keeps a token-level mirror of the backend's attention state so
//! that the shared prefix of consecutive prompts is decoded only once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{DecodeBatch, ModelBackend};
use crate::error::{EngineError, Result};
use crate::kv_cache::KvState;
use crate::sampler::{Sampler, SamplerConfig};
use crate::session;
use crate::template::{ChatTemplate, Message};
use crate::tokenizer::Tokenizer;
use crate::tools::{FunctionCall, ToolCallParser};

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model location: a HuggingFace model id or a local directory.
    pub model_path: String,
    /// Context window in tokens.
    pub n_ctx: usize,
    /// Maximum tokens per prefill batch.
    pub n_batch: usize,
    /// Layers to offload to the accelerator; 0 keeps everything on CPU.
    pub n_gpu_layers: i32,
    /// CPU threads for the backend.
    pub n_threads: usize,
    /// Memory-map model weights instead of reading them into buffers.
    pub use_mmap: bool,
    /// Pin model memory.
    pub use_mlock: bool,
    /// Explicit chat template; `None` auto-detects from the vocabulary.
    pub chat_template: Option<ChatTemplate>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            n_ctx: 4096,
            n_batch: 512,
            n_gpu_layers: 35,
            n_threads: 4,
            use_mmap: true,
            use_mlock: false,
            chat_template: None,
        }
    }
}

impl EngineConfig {
    pub fn with_model(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Default::default()
        }
    }
}

/// Per-call generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub max_tokens: usize,
    pub repeat_penalty: f32,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 512,
            repeat_penalty: 1.1,
            stop_sequences: vec![
                "<|im_end|>".to_string(),
                "<|endoftext|>".to_string(),
                "</s>".to_string(),
            ],
        }
    }
}

impl From<&GenerationConfig> for SamplerConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repeat_penalty: config.repeat_penalty,
            ..Default::default()
        }
    }
}

/// Throughput counters for the most recent generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub tokens_generated: usize,
    pub generation_time_ms: f32,
    pub tokens_per_second: f32,
    pub prompt_tokens: usize,
    pub context_tokens: usize,
}

/// Cloneable handle that cancels an in-flight generation from any thread.
/// The loop observes the flag at iteration boundaries; cancellation never
/// interrupts a backend call.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Conversational inference engine over an abstract [`ModelBackend`].
pub struct Engine {
    backend: Box<dyn ModelBackend>,
    tokenizer: Tokenizer,
    config: EngineConfig,
    sampler: Sampler,
    kv: KvState,
    stats: EngineStats,
    stop_flag: Arc<AtomicBool>,
    tool_parser: ToolCallParser,
    function_schema: Option<String>,
}

impl Engine {
    /// Load the candle backend described by `config` and build an engine
    /// around it.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let backend = crate::model::CandleBackend::load(&config)?;
        Self::with_backend(Box::new(backend), config)
    }

    /// Build an engine over an already-constructed backend.
    pub fn with_backend(backend: Box<dyn ModelBackend>, config: EngineConfig) -> Result<Self> {
        if config.n_ctx == 0 {
            return Err(EngineError::Init("context size must be nonzero".into()));
        }

        let tokenizer = Tokenizer::from_backend(backend.as_ref(), config.chat_template.clone());
        info!(
            n_ctx = config.n_ctx,
            vocab = backend.vocab_size(),
            "engine ready"
        );

        Ok(Self {
            backend,
            tokenizer,
            config,
            sampler: Sampler::new(SamplerConfig::default()),
            kv: KvState::new(),
            stats: EngineStats::default(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            tool_parser: ToolCallParser::new(),
            function_schema: None,
        })
    }

    /// Generate a reply, streaming each decoded piece through `callback`.
    ///
    /// The callback receives every emitted piece with `is_end = false`, in
    /// emission order, then exactly one `("", true)` call. The returned
    /// string is the concatenation of the emitted pieces (stop-sequence
    /// matches are truncated away before emission).
    pub fn generate_stream<F>(
        &mut self,
        messages: &[Message],
        mut callback: F,
        config: &GenerationConfig,
    ) -> Result<String>
    where
        F: FnMut(&str, bool),
    {
        self.generate_inner(messages, Some(&mut callback), config)
    }

    /// Generate a reply without streaming.
    pub fn generate(&mut self, messages: &[Message], config: &GenerationConfig) -> Result<String> {
        self.generate_inner(messages, None, config)
    }

    fn generate_inner(
        &mut self,
        messages: &[Message],
        mut callback: Option<&mut dyn FnMut(&str, bool)>,
        config: &GenerationConfig,
    ) -> Result<String> {
        self.stop_flag.store(false, Ordering::SeqCst);
        let start = Instant::now();

        let prompt = self.tokenizer.render(messages, true);
        let tokens = self.tokenizer.encode(self.backend.as_ref(), &prompt, true)?;
        self.stats.prompt_tokens = tokens.len();

        let n_ctx = self.config.n_ctx;
        if tokens.len() >= n_ctx {
            return Err(EngineError::ContextOverflow {
                prompt_tokens: tokens.len(),
                n_ctx,
            });
        }

        // Drop cache entries past the shared prefix, then prefill the rest.
        let reusable = self.kv.check_reusable(&tokens);
        let n_past = self.kv.cached_tokens();
        if reusable < n_past {
            self.backend.kv_drop(reusable, n_past);
            self.kv.truncate(reusable);
        }
        debug!(
            prompt_tokens = tokens.len(),
            reused = reusable,
            "starting generation"
        );

        let mut n_past = self.kv.cached_tokens();
        if tokens.len() > n_past {
            let n_batch = self.config.n_batch.max(1);
            while n_past < tokens.len() {
                let end = (n_past + n_batch).min(tokens.len());
                let batch = DecodeBatch::prefill(&tokens[n_past..end], n_past, end == tokens.len());
                if let Err(err) = self.backend.decode(&batch) {
                    // Keep the history aligned with the chunks the backend
                    // actually accepted before surfacing the failure.
                    self.kv.update(&tokens[..n_past]);
                    return Err(err);
                }
                n_past = end;
            }
        }
        self.kv.update(&tokens);

        self.sampler.update_config(SamplerConfig::from(config));

        let mut result = String::new();
        let mut generated: Vec<u32> = Vec::new();

        for _ in 0..config.max_tokens {
            if self.stop_flag.load(Ordering::SeqCst) {
                debug!("generation cancelled");
                break;
            }
            // Keep prompt + generated within the context window.
            if n_past >= n_ctx {
                break;
            }
            let Some(last_pos) = n_past.checked_sub(1) else {
                break;
            };

            let mut logits = self.backend.logits_at(last_pos)?;
            let token = self.sampler.sample(&mut logits, &generated);

            if self.tokenizer.is_eos(token) {
                break;
            }

            let piece = self.tokenizer.piece(self.backend.as_ref(), token);
            result.push_str(&piece);

            let mut should_stop = false;
            for stop_seq in &config.stop_sequences {
                if let Some(pos) = result.find(stop_seq.as_str()) {
                    result.truncate(pos);
                    should_stop = true;
                    break;
                }
            }

            if !should_stop {
                if let Some(cb) = callback.as_mut() {
                    cb(&piece, false);
                }
            }

            generated.push(token);
            self.kv.push(token);

            let batch = DecodeBatch::single(token, n_past);
            if let Err(err) = self.backend.decode(&batch) {
                warn!(error = %err, "backend refused batch mid-generation");
                self.kv.truncate(n_past);
                break;
            }
            n_past += 1;
            self.kv.mark_cached(n_past);

            if should_stop {
                break;
            }
        }

        if let Some(cb) = callback.as_mut() {
            cb("", true);
        }

        let elapsed = start.elapsed().as_secs_f64();
        self.stats.tokens_generated = generated.len();
        self.stats.generation_time_ms = (elapsed * 1000.0) as f32;
        self.stats.tokens_per_second = if elapsed > 0.0 {
            (generated.len() as f64 / elapsed) as f32
        } else {
            0.0
        };
        self.stats.context_tokens = n_past;

        Ok(result)
    }

    /// Flag the in-flight generation to end at the next loop boundary.
    pub fn stop_generation(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Handle for cancelling from another thread while `generate_stream`
    /// holds the engine borrow.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop_flag),
        }
    }

    /// Drop all cached state, forcing the next generation to prefill from
    /// scratch.
    pub fn clear_cache(&mut self) {
        self.backend.kv_clear();
        self.kv.clear();
    }

    /// Persist the current token history.
    pub fn save_session(&self, path: &Path) -> Result<()> {
        session::write_history(path, self.kv.history())
    }

    /// Restore a token history. The backend cache is cleared; the next
    /// generation re-prefills against the restored history.
    pub fn load_session(&mut self, path: &Path) -> Result<()> {
        let tokens = session::read_history(path)?;
        self.backend.kv_clear();
        self.kv.restore(tokens);
        Ok(())
    }

    /// Store a JSON tool schema for upstream prompt builders to surface to
    /// the model. The engine does not re-render prompts from it.
    pub fn set_function_schema(&mut self, schema: impl Into<String>) {
        self.function_schema = Some(schema.into());
    }

    pub fn function_schema(&self) -> Option<&str> {
        self.function_schema.as_deref()
    }

    /// Extract a tool invocation from a completed response, if present.
    pub fn parse_function_call(&self, response: &str) -> Option<FunctionCall> {
        self.tool_parser.parse(response)
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = EngineStats::default();
    }

    /// Tokens currently materialized in the backend cache.
    pub fn context_usage(&self) -> usize {
        self.kv.cached_tokens()
    }

    pub fn max_context(&self) -> usize {
        self.config.n_ctx
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Human-readable model summary.
    pub fn model_info(&self) -> String {
        format!(
            "Model: {}\nContext size: {}\nVocab size: {}\nEmbedding size: {}",
            self.config.model_path,
            self.config.n_ctx,
            self.backend.vocab_size(),
            self.backend.embed_dim(),
        )
    }
}
