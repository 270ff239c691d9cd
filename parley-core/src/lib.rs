//! Parley Core - conversational LLM inference runtime
//!
//! This crate implements the generation pipeline for a chat assistant:
//! - Chat-template rendering (ChatML, Llama-2, Llama-3)
//! - Tokenization over an abstract model backend
//! - KV-cache prefix reuse across conversation turns
//! - Streaming decode loop with stop sequences and cancellation
//! - Sampling stack: penalties, temperature, top-k/top-p, greedy, Mirostat-2
//! - Tool-call extraction from generated text
//!
//! The tensor layer is behind the [`ModelBackend`] trait; a candle-based
//! implementation ships in [`model`].

pub mod backend;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod model;
pub mod sampler;
pub mod session;
pub mod template;
pub mod tokenizer;
pub mod tools;

pub use backend::{DecodeBatch, ModelBackend};
pub use engine::{Engine, EngineConfig, EngineStats, GenerationConfig, StopHandle};
pub use error::{EngineError, Result};
pub use kv_cache::{KvState, PrefixCache, PrefixEntry};
pub use model::CandleBackend;
pub use sampler::{GreedySampler, MirostatSampler, Sampler, SamplerConfig};
pub use template::{ChatTemplate, Message};
pub use tokenizer::Tokenizer;
pub use tools::{FunctionCall, ToolCallParser};
