//! Text⇄token conversion bound to a model backend
//!
//! The heavy lifting (vocabulary, merges) lives behind [`ModelBackend`];
//! this layer adds what the chat runtime needs on top: special-token ids
//! resolved once at startup, chat-template selection, and EOS detection.

use tracing::debug;

use crate::backend::ModelBackend;
use crate::error::Result;
use crate::template::{ChatTemplate, Message};

/// Special-token ids resolved from the vocabulary. Any of them may be
/// absent depending on the model family.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Option<u32>,
    pub pad: Option<u32>,
    pub im_start: Option<u32>,
    pub im_end: Option<u32>,
}

/// Tokenizer facade over a [`ModelBackend`].
pub struct Tokenizer {
    special: SpecialTokens,
    template: ChatTemplate,
}

impl Tokenizer {
    /// Probe the backend's vocabulary for marker tokens and pick a chat
    /// template. An explicit `template` skips auto-detection.
    pub fn from_backend(backend: &dyn ModelBackend, template: Option<ChatTemplate>) -> Self {
        let special = SpecialTokens {
            bos: backend.bos_id(),
            eos: backend.eos_id(),
            pad: backend.pad_id(),
            im_start: backend.token_to_id("<|im_start|>"),
            im_end: backend.token_to_id("<|im_end|>"),
        };

        let template = template.unwrap_or_else(|| detect_template(backend, &special));
        debug!(?template, "chat template selected");

        Self { special, template }
    }

    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    pub fn set_template(&mut self, template: ChatTemplate) {
        self.template = template;
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    /// Render a conversation to a prompt string using the active template.
    pub fn render(&self, messages: &[Message], add_generation_prompt: bool) -> String {
        self.template.render(messages, add_generation_prompt)
    }

    /// Encode text to token ids. With `special` set, marker strings in the
    /// input map to their dedicated ids; otherwise they tokenize as literal
    /// text.
    pub fn encode(
        &self,
        backend: &dyn ModelBackend,
        text: &str,
        special: bool,
    ) -> Result<Vec<u32>> {
        backend.tokenize(text, false, special)
    }

    /// Decode token ids back to text. With `skip_special` set, BOS/EOS/PAD
    /// and the ChatML markers are filtered out.
    pub fn decode(&self, backend: &dyn ModelBackend, tokens: &[u32], skip_special: bool) -> String {
        let mut out = String::new();
        for &tok in tokens {
            if skip_special && self.is_special(tok) {
                continue;
            }
            out.push_str(&backend.token_to_piece(tok, true));
        }
        out
    }

    /// Surface piece for a single generated token.
    pub fn piece(&self, backend: &dyn ModelBackend, token: u32) -> String {
        backend.token_to_piece(token, true)
    }

    pub fn is_special(&self, token: u32) -> bool {
        let s = &self.special;
        [s.bos, s.eos, s.pad, s.im_start, s.im_end]
            .iter()
            .any(|id| *id == Some(token))
    }

    /// A token is terminal iff it is the model EOS or the ChatML turn-end.
    pub fn is_eos(&self, token: u32) -> bool {
        self.special.eos == Some(token) || self.special.im_end == Some(token)
    }
}

fn detect_template(backend: &dyn ModelBackend, special: &SpecialTokens) -> ChatTemplate {
    if special.im_start.is_some() && special.im_end.is_some() {
        return ChatTemplate::ChatMl;
    }
    if backend.token_to_id("<|start_header_id|>").is_some() {
        return ChatTemplate::Llama3;
    }
    if backend.token_to_id("[INST]").is_some() {
        return ChatTemplate::Llama2;
    }
    ChatTemplate::ChatMl
}
