//! Chat messages and chat-template rendering
//!
//! Renders a conversation into the single prompt string a given model family
//! expects. Three families are supported: ChatML (Qwen, OpenHermes, Yi),
//! Llama-2 (`[INST]`/`<<SYS>>`) and Llama-3 (header-id tokens). Custom
//! template strings are accepted but currently render as ChatML.

use serde::{Deserialize, Serialize};

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user", "assistant" or "tool"
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new("tool", content)
    }
}

/// Prompt format used to serialize a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|im_start|>role\ncontent<|im_end|>\n` — also used by Qwen.
    ChatMl,
    /// `<s>[INST] ... [/INST]` with an optional `<<SYS>>` block.
    Llama2,
    /// `<|begin_of_text|>` + header-id framing.
    Llama3,
    /// Caller-supplied template string. No template engine is embedded, so
    /// rendering falls back to ChatML.
    Custom(String),
}

impl ChatTemplate {
    /// Render `messages` into a prompt. When `add_generation_prompt` is set,
    /// the assistant-turn opener is appended so the model continues as the
    /// assistant.
    pub fn render(&self, messages: &[Message], add_generation_prompt: bool) -> String {
        match self {
            ChatTemplate::ChatMl | ChatTemplate::Custom(_) => {
                render_chatml(messages, add_generation_prompt)
            }
            ChatTemplate::Llama2 => render_llama2(messages),
            ChatTemplate::Llama3 => render_llama3(messages, add_generation_prompt),
        }
    }
}

fn render_chatml(messages: &[Message], add_generation_prompt: bool) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str("<|im_start|>");
        out.push_str(&msg.role);
        out.push('\n');
        out.push_str(&msg.content);
        out.push_str("<|im_end|>\n");
    }
    if add_generation_prompt {
        out.push_str("<|im_start|>assistant\n");
    }
    out
}

fn render_llama2(messages: &[Message]) -> String {
    let mut out = String::new();
    let mut system_msg = String::new();
    let mut first_user = true;

    for msg in messages {
        match msg.role.as_str() {
            "system" => system_msg = msg.content.clone(),
            "user" => {
                out.push_str("<s>[INST] ");
                if first_user && !system_msg.is_empty() {
                    out.push_str("<<SYS>>\n");
                    out.push_str(&system_msg);
                    out.push_str("\n<</SYS>>\n\n");
                }
                out.push_str(&msg.content);
                out.push_str(" [/INST]");
                first_user = false;
            }
            "assistant" => {
                out.push(' ');
                out.push_str(&msg.content);
                out.push_str(" </s>");
            }
            _ => {}
        }
    }
    out
}

fn render_llama3(messages: &[Message], add_generation_prompt: bool) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for msg in messages {
        out.push_str("<|start_header_id|>");
        out.push_str(&msg.role);
        out.push_str("<|end_header_id|>\n\n");
        out.push_str(&msg.content);
        out.push_str("<|eot_id|>");
    }
    if add_generation_prompt {
        out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    }
    out
}
