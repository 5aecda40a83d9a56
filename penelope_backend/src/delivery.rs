//! Shapes a response stream for spoken delivery.
//!
//! Hesitation shows up as filler: a long ponder run before a token becomes a
//! filler word, a shorter one a pause mark. Text is released to the
//! downstream pipeline a sentence at a time, or at a comma when the pipeline
//! has nothing left to say. None of this feeds back into generation.

use serde::{Deserialize, Serialize};

use crate::error::{PenelopeError, PenelopeResult};
use crate::supervisor::StreamToken;

/// Whatever consumes utterances (a speech queue, a terminal writer).
pub trait Downstream {
    /// Utterances queued but not yet delivered.
    fn queue_depth(&self) -> usize;

    /// Currently delivering something.
    fn is_busy(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Print reflection tokens in the front end.
    #[serde(default)]
    pub show_thoughts: bool,
    /// Emit ambient cues while the downstream is idle.
    #[serde(default = "default_true")]
    pub cues: bool,
    #[serde(default = "default_filler_mark_intensity")]
    pub filler_mark_intensity: f64,
    #[serde(default = "default_filler_word_intensity")]
    pub filler_word_intensity: f64,
    #[serde(default = "default_filler_mark")]
    pub filler_mark: String,
    #[serde(default = "default_filler_words")]
    pub filler_words: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_filler_mark_intensity() -> f64 {
    0.3
}

fn default_filler_word_intensity() -> f64 {
    0.9
}

fn default_filler_mark() -> String {
    "—".to_string()
}

fn default_filler_words() -> Vec<String> {
    [", am,", ", um,", ", well,", ", erh,"]
        .iter()
        .map(|w| w.to_string())
        .collect()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            show_thoughts: false,
            cues: true,
            filler_mark_intensity: default_filler_mark_intensity(),
            filler_word_intensity: default_filler_word_intensity(),
            filler_mark: default_filler_mark(),
            filler_words: default_filler_words(),
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> PenelopeResult<()> {
        if self.filler_words.is_empty() {
            return Err(PenelopeError::Config(
                "delivery.filler_words must not be empty".to_string(),
            ));
        }
        if self.filler_mark_intensity > self.filler_word_intensity {
            return Err(PenelopeError::Config(
                "delivery.filler_mark_intensity must not exceed filler_word_intensity".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    GentleThought,
    ThinkHard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Cue(Cue),
    /// Filler inserted before the next token.
    Filler(String),
    /// Text ready to be spoken.
    Utterance(String),
}

pub struct DeliveryShaper {
    config: DeliveryConfig,
    pending: String,
    next_filler: usize,
}

impl DeliveryShaper {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            pending: String::new(),
            next_filler: 0,
        }
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn feed(&mut self, token: &StreamToken, downstream: &dyn Downstream) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();

        if self.config.cues && !downstream.is_busy() {
            events.push(DeliveryEvent::Cue(if token.is_thought {
                Cue::ThinkHard
            } else {
                Cue::GentleThought
            }));
        }

        if token.is_thought {
            return events;
        }

        if !self.ends_in_pause() {
            let filler = if token.ponder_intensity > self.config.filler_word_intensity {
                Some(self.take_filler_word())
            } else if token.ponder_intensity > self.config.filler_mark_intensity {
                Some(self.config.filler_mark.clone())
            } else {
                None
            };
            if let Some(filler) = filler {
                self.pending.push_str(&filler);
                events.push(DeliveryEvent::Filler(filler));
            }
        }

        self.pending.push_str(&token.token);

        let sentence_end = self.pending.ends_with(|c: char| matches!(c, '.' | '!' | '?'));
        let idle_comma = self.pending.ends_with(',') && downstream.queue_depth() < 1;
        if sentence_end || idle_comma {
            events.push(DeliveryEvent::Utterance(std::mem::take(&mut self.pending)));
        }
        events
    }

    /// Release whatever is left at the end of a turn.
    pub fn finish(&mut self) -> Option<DeliveryEvent> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            None
        } else {
            Some(DeliveryEvent::Utterance(rest))
        }
    }

    fn ends_in_pause(&self) -> bool {
        let mark_pause = format!("{} ", self.config.filler_mark);
        self.pending.ends_with(',') || self.pending.ends_with(", ") || self.pending.ends_with(&mark_pause)
    }

    fn take_filler_word(&mut self) -> String {
        let words = &self.config.filler_words;
        if words.is_empty() {
            return self.config.filler_mark.clone();
        }
        let word = words[self.next_filler % words.len()].clone();
        self.next_filler = self.next_filler.wrapping_add(1);
        word
    }
}
