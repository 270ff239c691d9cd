//! Error types for the inference runtime

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to initialize model: {0}")]
    Init(String),

    #[error("prompt of {prompt_tokens} tokens does not fit context window of {n_ctx}")]
    ContextOverflow { prompt_tokens: usize, n_ctx: usize },

    #[error("backend refused batch: {0}")]
    Decode(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("session I/O error: {0}")]
    SessionIo(#[from] std::io::Error),

    #[error("session file corrupt: {0}")]
    SessionFormat(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
