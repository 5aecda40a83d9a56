//! Reflection episodes.
//!
//! When pondering runs out of room, generation is handed to the reflecting
//! transcript for a short burst of private thought. The thought and a recap of
//! the interrupted answer are then spliced into the speaking transcript before
//! the speaking slot resumes. Everything is staged into the turn draft, so an
//! abandoned turn leaves the committed transcripts untouched.

use regex_lite::Regex;

use crate::compute::{ComputeSlots, Slot, SlotCheckpoint};
use crate::config::{PersonaConfig, ReflectionConfig, SamplerConfig};
use crate::engine::{GenerateRequest, Grammar, InferenceEngine, SamplingConfig, TokenChunk, TokenStream};
use crate::error::{PenelopeError, PenelopeResult};
use crate::policy::ReflectReason;
use crate::transcript::{
    literal_text, ChatTemplate, Dialect, Glyphs, Piece, Role, Segment, TranscriptStore, TurnDraft,
};

const SENTENCE_BREAK: &str = r"[.!?] +";

/// Split after terminal punctuation followed by spaces. The punctuation stays
/// with its sentence; the spaces are dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let Ok(sentence_break) = Regex::new(SENTENCE_BREAK) else {
        return vec![text];
    };
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in sentence_break.find_iter(text) {
        sentences.push(&text[start..m.start() + 1]);
        start = m.end();
    }
    sentences.push(&text[start..]);
    sentences
}

/// The last `n` sentences of `text`, space-joined. Shorter texts come back
/// whole.
pub fn last_n_sentences(text: &str, n: usize) -> String {
    let sentences = split_sentences(text);
    let from = sentences.len().saturating_sub(n);
    sentences[from..].join(" ")
}

/// What a finished episode produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionSummary {
    pub reason: ReflectReason,
    pub thought: String,
    pub tokens: u32,
    /// Segments staged into the speaking draft.
    pub spliced: usize,
}

/// One in-flight reflection.
///
/// Holds the slot checkpoint taken before the reflecting slot was activated,
/// so the episode can be unwound if the turn is dropped or fails.
pub struct ReflectionEpisode {
    reason: ReflectReason,
    checkpoint: SlotCheckpoint,
    interrupted: Vec<Piece>,
    thought: String,
    tokens: u32,
    stream: Option<TokenStream>,
    glyphs: Glyphs,
}

impl ReflectionEpisode {
    pub fn reason(&self) -> ReflectReason {
        self.reason
    }

    pub fn thought(&self) -> &str {
        &self.thought
    }

    /// Pull the next thought token. `None` once the stream has ended.
    ///
    /// A grammar violation ends the thought early; any other error is
    /// returned and ends the stream.
    pub fn next_thought(&mut self) -> Option<PenelopeResult<TokenChunk>> {
        let stream = self.stream.as_mut()?;
        match stream.next() {
            Some(Ok(mut chunk)) => {
                chunk.text = self.glyphs.strip(&chunk.text);
                self.thought.push_str(&chunk.text);
                self.tokens += 1;
                Some(Ok(chunk))
            }
            Some(Err(PenelopeError::GrammarViolation(message))) => {
                tracing::warn!("Reflection stopped on grammar violation: {}", message);
                self.stream = None;
                None
            }
            Some(Err(e)) => {
                self.stream = None;
                Some(Err(e))
            }
            None => {
                self.stream = None;
                None
            }
        }
    }
}

pub struct ReflectionController {
    config: ReflectionConfig,
    sampler: SamplerConfig,
    template: ChatTemplate,
    stop: Vec<String>,
    grammar: Grammar,
    glyphs: Glyphs,
}

impl ReflectionController {
    pub fn new(
        config: ReflectionConfig,
        sampler: SamplerConfig,
        dialect: &Dialect,
        persona: &PersonaConfig,
        glyphs: Glyphs,
    ) -> Self {
        let stop = config
            .stop
            .iter()
            .map(|s| persona.expand_names(s))
            .collect();
        Self {
            template: ChatTemplate::new(dialect, persona, glyphs),
            grammar: Grammar::excluding(glyphs.reserved()),
            config,
            sampler,
            stop,
            glyphs,
        }
    }

    /// Prompt for reflecting on `interrupted`, including anything already
    /// staged this turn.
    pub fn prompt(&self, store: &TranscriptStore, draft: &TurnDraft, interrupted: &[Piece]) -> String {
        let opening = [
            Segment::new(Role::Assistant, interrupted.to_vec()),
            Segment::control(Role::ReflectionOpen),
        ];
        self.template.render(
            store
                .reflecting()
                .segments()
                .iter()
                .chain(draft.reflecting.iter())
                .chain(opening.iter()),
        )
    }

    /// Activate the reflecting slot and open the thought stream.
    ///
    /// The caller must have dropped any speaking stream first.
    pub fn begin<E: InferenceEngine + ?Sized>(
        &self,
        engine: &mut E,
        slots: &mut ComputeSlots,
        store: &TranscriptStore,
        draft: &TurnDraft,
        interrupted: Vec<Piece>,
        reason: ReflectReason,
    ) -> PenelopeResult<ReflectionEpisode> {
        let checkpoint = slots.checkpoint();
        slots.activate(engine, Slot::Reflecting)?;

        let request = GenerateRequest {
            prompt: self.prompt(store, draft, &interrupted),
            max_tokens: self.config.max_tokens,
            stop: self.stop.clone(),
            sampling: SamplingConfig {
                temperature: self.config.temperature,
                top_p: self.sampler.top_p,
                top_k: self.sampler.top_k,
                repeat_penalty: self.sampler.repeat_penalty,
                grammar: Some(self.grammar.clone()),
            },
            want_logprobs: true,
        };

        let stream = match engine.generate(&request) {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(restore_err) = slots.restore(engine, checkpoint) {
                    tracing::error!("Failed to restore compute slots: {}", restore_err);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Reflection started ({:?}) after {} chars",
            reason,
            literal_text(&interrupted).len()
        );
        Ok(ReflectionEpisode {
            reason,
            checkpoint,
            interrupted,
            thought: String::new(),
            tokens: 0,
            stream: Some(stream),
            glyphs: self.glyphs,
        })
    }

    /// Stage the splice into `draft` and switch back to the speaking slot.
    pub fn finish<E: InferenceEngine + ?Sized>(
        &self,
        engine: &mut E,
        slots: &mut ComputeSlots,
        mut episode: ReflectionEpisode,
        draft: &mut TurnDraft,
    ) -> PenelopeResult<ReflectionSummary> {
        episode.stream = None;
        if let Err(e) = slots.activate(engine, Slot::Speaking) {
            self.abort_with(engine, slots, episode.checkpoint);
            return Err(e);
        }

        let recap = last_n_sentences(&literal_text(&episode.interrupted), self.config.recap_sentences);
        let thought = episode.thought.clone();

        let mut speaking = vec![
            Segment::new(Role::Assistant, episode.interrupted.clone()),
            Segment::control(Role::ReflectionOpen),
            Segment::literal(Role::Assistant, thought.clone()),
            Segment::control(Role::ReflectionClose),
        ];
        if self.config.include_recap {
            speaking.push(Segment::literal(Role::Recap, recap));
        }
        let spliced = speaking.len();
        draft.speaking.extend(speaking);
        draft.reflecting.extend([
            Segment::new(Role::Assistant, episode.interrupted),
            Segment::control(Role::ReflectionOpen),
            Segment::literal(Role::Assistant, thought.clone()),
            Segment::control(Role::ReflectionClose),
        ]);

        tracing::info!(
            "Reflection finished ({:?}): {} tokens, {} segments staged",
            episode.reason,
            episode.tokens,
            spliced
        );
        Ok(ReflectionSummary {
            reason: episode.reason,
            thought,
            tokens: episode.tokens,
            spliced,
        })
    }

    /// Unwind an unfinished episode: drop its stream and return to the
    /// slot assignment from before it began.
    pub fn abort<E: InferenceEngine + ?Sized>(
        &self,
        engine: &mut E,
        slots: &mut ComputeSlots,
        mut episode: ReflectionEpisode,
    ) {
        episode.stream = None;
        tracing::warn!(
            "Reflection abandoned after {} tokens",
            episode.tokens
        );
        self.abort_with(engine, slots, episode.checkpoint);
    }

    fn abort_with<E: InferenceEngine + ?Sized>(
        &self,
        engine: &mut E,
        slots: &mut ComputeSlots,
        checkpoint: SlotCheckpoint,
    ) {
        if let Err(e) = slots.restore(engine, checkpoint) {
            tracing::error!("Failed to restore compute slots: {}", e);
        }
    }
}
