//! Inference engine adapter.
//!
//! The supervisor talks to a causal language model only through
//! [`InferenceEngine`]: a pull-based token stream plus save/restore of the
//! engine's single working cache. Swapping that cache is the only way two
//! transcripts share one engine instance.

pub mod llama_server;
pub mod scripted;
pub mod snapshots;

use serde::{Deserialize, Serialize};

use crate::error::PenelopeResult;

pub use llama_server::LlamaServerEngine;
pub use scripted::{ScriptStep, ScriptedEngine};
pub use snapshots::{SnapshotLedger, StateHandle};

/// One generated token as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    pub text: String,
    /// Natural-log probability of the sampled token. `None` when the engine
    /// did not report one.
    pub log_probability: Option<f64>,
}

impl TokenChunk {
    pub fn new(text: impl Into<String>, log_probability: f64) -> Self {
        Self {
            text: text.into(),
            log_probability: Some(log_probability),
        }
    }

    pub fn unscored(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            log_probability: None,
        }
    }
}

/// Lazy, finite token sequence. Each element is produced on demand, so the
/// consumer controls pacing; dropping the stream abandons the request.
pub type TokenStream = Box<dyn Iterator<Item = PenelopeResult<TokenChunk>> + Send>;

/// Character-exclusion constraint on generated text.
///
/// The first generated character may not be a newline; no generated
/// character may be one of `excluded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grammar {
    pub excluded: Vec<char>,
}

impl Grammar {
    pub fn excluding(chars: impl IntoIterator<Item = char>) -> Self {
        Self {
            excluded: chars.into_iter().collect(),
        }
    }

    pub fn permits(&self, text: &str) -> bool {
        !text.chars().any(|c| self.excluded.contains(&c))
    }

    /// Render as a llama.cpp GBNF grammar.
    pub fn to_gbnf(&self) -> String {
        let class: String = self
            .excluded
            .iter()
            .map(|c| format!("\\u{:04X}", *c as u32))
            .collect();
        format!("root ::= [^\\n{class}] [^{class}]*")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
    pub grammar: Option<Grammar>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 20,
            repeat_penalty: 1.15,
            grammar: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    pub sampling: SamplingConfig,
    pub want_logprobs: bool,
}

pub trait InferenceEngine: Send {
    /// Start a streaming completion of `request.prompt`.
    fn generate(&mut self, request: &GenerateRequest) -> PenelopeResult<TokenStream>;

    /// Snapshot the active cache.
    fn save_state(&mut self) -> PenelopeResult<StateHandle>;

    /// Replace the active cache with a previously saved snapshot. Fails with
    /// `StateHandleInvalid` for stale or foreign handles.
    fn load_state(&mut self, handle: &StateHandle) -> PenelopeResult<()>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn generate(&mut self, request: &GenerateRequest) -> PenelopeResult<TokenStream> {
        (**self).generate(request)
    }

    fn save_state(&mut self) -> PenelopeResult<StateHandle> {
        (**self).save_state()
    }

    fn load_state(&mut self, handle: &StateHandle) -> PenelopeResult<()> {
        (**self).load_state(handle)
    }
}
