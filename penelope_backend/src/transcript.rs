//! Conversation transcripts and their prompt rendering.
//!
//! Two logs are kept: the *speaking* transcript the model answers from, and
//! the *reflecting* transcript used for side-channel reflection. Segments
//! carry tagged pieces, so control markers are never confused with literal
//! text; glyphs only appear once a transcript is rendered into a prompt.

use serde::{Deserialize, Serialize};

use crate::config::PersonaConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ReflectionOpen,
    ReflectionClose,
    Recap,
}

/// In-band control signal inserted by the pondering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    /// Slow down: the next words are too uncertain.
    Ponder,
    /// Stop hedging and answer now.
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Piece {
    Text(String),
    Marker(Marker),
}

/// Parse a configured string where `{ponder}` and `{force}` stand for markers.
///
/// Only trusted configuration goes through here; user and model text is
/// always literal.
pub fn parse_pieces(source: &str) -> Vec<Piece> {
    const PONDER: &str = "{ponder}";
    const FORCE: &str = "{force}";

    let mut pieces = Vec::new();
    let mut rest = source;
    loop {
        let next = [(rest.find(PONDER), PONDER, Marker::Ponder), (rest.find(FORCE), FORCE, Marker::Force)]
            .into_iter()
            .filter_map(|(at, token, marker)| at.map(|at| (at, token, marker)))
            .min_by_key(|(at, _, _)| *at);

        match next {
            Some((at, token, marker)) => {
                if at > 0 {
                    pieces.push(Piece::Text(rest[..at].to_string()));
                }
                pieces.push(Piece::Marker(marker));
                rest = &rest[at + token.len()..];
            }
            None => {
                if !rest.is_empty() {
                    pieces.push(Piece::Text(rest.to_string()));
                }
                return pieces;
            }
        }
    }
}

/// Literal text of a piece sequence, markers skipped.
pub fn literal_text(pieces: &[Piece]) -> String {
    pieces
        .iter()
        .filter_map(|piece| match piece {
            Piece::Text(text) => Some(text.as_str()),
            Piece::Marker(_) => None,
        })
        .collect()
}

/// Trim trailing whitespace from the literal tail of `pieces`.
pub fn trim_trailing_whitespace(mut pieces: Vec<Piece>) -> Vec<Piece> {
    while let Some(Piece::Text(text)) = pieces.last_mut() {
        let trimmed_len = text.trim_end().len();
        if trimmed_len == 0 {
            pieces.pop();
        } else {
            text.truncate(trimmed_len);
            break;
        }
    }
    pieces
}

/// Characters used to render markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Glyphs {
    pub ponder: char,
    pub force: char,
}

impl Default for Glyphs {
    fn default() -> Self {
        Self {
            ponder: '‣',
            force: '⬳',
        }
    }
}

impl Glyphs {
    pub fn glyph(&self, marker: Marker) -> char {
        match marker {
            Marker::Ponder => self.ponder,
            Marker::Force => self.force,
        }
    }

    pub fn reserved(&self) -> [char; 2] {
        [self.ponder, self.force]
    }

    /// Remove reserved glyphs from literal text.
    pub fn strip(&self, text: &str) -> String {
        text.chars()
            .filter(|c| *c != self.ponder && *c != self.force)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub role: Role,
    pub body: Vec<Piece>,
}

impl Segment {
    pub fn new(role: Role, body: Vec<Piece>) -> Self {
        Self { role, body }
    }

    pub fn literal(role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let body = if text.is_empty() {
            Vec::new()
        } else {
            vec![Piece::Text(text)]
        };
        Self { role, body }
    }

    pub fn control(role: Role) -> Self {
        Self {
            role,
            body: Vec::new(),
        }
    }

    /// Literal content, markers excluded.
    pub fn text(&self) -> String {
        literal_text(&self.body)
    }

    pub fn marker_count(&self) -> usize {
        self.body
            .iter()
            .filter(|piece| matches!(piece, Piece::Marker(_)))
            .count()
    }
}

/// Ordered segment log whose first segment is always the system segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    segments: Vec<Segment>,
}

impl Transcript {
    pub fn new(system: Vec<Piece>) -> Self {
        Self {
            segments: vec![Segment::new(Role::System, system)],
        }
    }

    pub fn push(&mut self, segment: Segment) {
        debug_assert!(segment.role != Role::System, "only the seed may be a system segment");
        self.segments.push(segment);
    }

    pub fn extend<I: IntoIterator<Item = Segment>>(&mut self, segments: I) {
        for segment in segments {
            self.push(segment);
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }
}

/// Cue strings for one transcript. `{ponder}`/`{force}` become markers,
/// `{assistant}`/`{user}` become persona names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialect {
    #[serde(default)]
    pub system_prefix: String,
    #[serde(default)]
    pub system_suffix: String,
    #[serde(default)]
    pub user_prefix: String,
    #[serde(default)]
    pub assistant_prefix: String,
    #[serde(default)]
    pub reflection_open: String,
    #[serde(default)]
    pub reflection_close: String,
    #[serde(default)]
    pub recap_prefix: String,
}

impl Dialect {
    /// ChatML rendering of the speaking transcript.
    pub fn speaking() -> Self {
        Self {
            system_prefix: "<|im_start|>system\n".to_string(),
            system_suffix: String::new(),
            user_prefix: "<|im_end|>\n<|im_start|>user\n".to_string(),
            assistant_prefix: "<|im_end|>\n<|im_start|>assistant\n".to_string(),
            reflection_open: "\n{ponder}{ponder}{ponder}{force}\n<|im_end|>\n<|im_start|>assistant\nAn interruption by thought engine: \n".to_string(),
            reflection_close: "<|im_end|>\n<|im_start|>assistant\nContinuation: \n".to_string(),
            recap_prefix: "...".to_string(),
        }
    }

    /// The reflecting transcript narrates the dialogue inside one user turn
    /// and asks for thoughts in the assistant turn.
    pub fn reflecting() -> Self {
        Self {
            system_prefix: "<|im_start|>system\n".to_string(),
            system_suffix: "<|im_end|>\n<|im_start|>user\n".to_string(),
            user_prefix: "\n{user} says: \n".to_string(),
            assistant_prefix: "\n{assistant} says: \n".to_string(),
            reflection_open: "... \n<|im_end|>\n<|im_start|>assistant\n{assistant}'s step-by-step thoughts: \n".to_string(),
            reflection_close: "<|im_end|>\n<|im_start|>assistant\n".to_string(),
            recap_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledCue(Vec<Piece>);

impl CompiledCue {
    fn compile(source: &str, persona: &PersonaConfig) -> Self {
        Self(parse_pieces(&persona.expand_names(source)))
    }
}

/// Renders a transcript into prompt text.
///
/// Assistant segments continue the current assistant turn; the assistant
/// prefix is only written when the turn changes hands (after a system or
/// user segment).
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    glyphs: Glyphs,
    system_prefix: CompiledCue,
    system_suffix: CompiledCue,
    user_prefix: CompiledCue,
    assistant_prefix: CompiledCue,
    reflection_open: CompiledCue,
    reflection_close: CompiledCue,
    recap_prefix: CompiledCue,
}

impl ChatTemplate {
    pub fn new(dialect: &Dialect, persona: &PersonaConfig, glyphs: Glyphs) -> Self {
        Self {
            glyphs,
            system_prefix: CompiledCue::compile(&dialect.system_prefix, persona),
            system_suffix: CompiledCue::compile(&dialect.system_suffix, persona),
            user_prefix: CompiledCue::compile(&dialect.user_prefix, persona),
            assistant_prefix: CompiledCue::compile(&dialect.assistant_prefix, persona),
            reflection_open: CompiledCue::compile(&dialect.reflection_open, persona),
            reflection_close: CompiledCue::compile(&dialect.reflection_close, persona),
            recap_prefix: CompiledCue::compile(&dialect.recap_prefix, persona),
        }
    }

    pub fn render<'a, I>(&self, segments: I) -> String
    where
        I: IntoIterator<Item = &'a Segment>,
    {
        let mut out = String::new();
        let mut previous: Option<Role> = None;
        for segment in segments {
            self.render_segment(&mut out, segment, previous);
            previous = Some(segment.role);
        }
        out
    }

    pub fn render_pieces(&self, out: &mut String, pieces: &[Piece]) {
        for piece in pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Marker(marker) => out.push(self.glyphs.glyph(*marker)),
            }
        }
    }

    fn render_segment(&self, out: &mut String, segment: &Segment, previous: Option<Role>) {
        match segment.role {
            Role::System => {
                self.render_pieces(out, &self.system_prefix.0);
                self.render_pieces(out, &segment.body);
                self.render_pieces(out, &self.system_suffix.0);
            }
            Role::User => {
                self.render_pieces(out, &self.user_prefix.0);
                self.render_pieces(out, &segment.body);
            }
            Role::Assistant => {
                if matches!(previous, None | Some(Role::System) | Some(Role::User)) {
                    self.render_pieces(out, &self.assistant_prefix.0);
                }
                self.render_pieces(out, &segment.body);
            }
            Role::ReflectionOpen => {
                self.render_pieces(out, &self.reflection_open.0);
                self.render_pieces(out, &segment.body);
            }
            Role::ReflectionClose => {
                self.render_pieces(out, &self.reflection_close.0);
                self.render_pieces(out, &segment.body);
            }
            Role::Recap => {
                self.render_pieces(out, &self.recap_prefix.0);
                self.render_pieces(out, &segment.body);
            }
        }
    }
}

/// In-progress text of the current turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBuffer {
    pieces: Vec<Piece>,
}

impl ResponseBuffer {
    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.pieces.last_mut() {
            Some(Piece::Text(last)) => last.push_str(text),
            _ => self.pieces.push(Piece::Text(text.to_string())),
        }
    }

    pub fn push_marker(&mut self, marker: Marker) {
        self.pieces.push(Piece::Marker(marker));
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn text(&self) -> String {
        literal_text(&self.pieces)
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Number of markers at the end of the buffer.
    pub fn trailing_markers(&self) -> usize {
        self.pieces
            .iter()
            .rev()
            .take_while(|piece| matches!(piece, Piece::Marker(_)))
            .count()
    }

    /// Whether the literal text ends on a space or terminal punctuation.
    pub fn ends_at_boundary(&self) -> bool {
        let last = self.pieces.iter().rev().find_map(|piece| match piece {
            Piece::Text(text) => text.chars().last(),
            Piece::Marker(_) => None,
        });
        matches!(last, Some(' ' | '.' | '?' | '!'))
    }

    pub fn take(&mut self) -> Vec<Piece> {
        std::mem::take(&mut self.pieces)
    }
}

/// Segments staged during a turn, applied only when the turn completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnDraft {
    pub speaking: Vec<Segment>,
    pub reflecting: Vec<Segment>,
}

/// Both conversation logs plus the seeds they are reset to.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    glyphs: Glyphs,
    speaking: Transcript,
    reflecting: Transcript,
    speaking_seed: Transcript,
    reflecting_seed: Transcript,
}

impl TranscriptStore {
    pub fn new(speaking_seed: Transcript, reflecting_seed: Transcript, glyphs: Glyphs) -> Self {
        Self {
            glyphs,
            speaking: speaking_seed.clone(),
            reflecting: reflecting_seed.clone(),
            speaking_seed,
            reflecting_seed,
        }
    }

    /// Seed both transcripts from the persona: the speaking side opens with
    /// the system prompt and the seed greeting, the reflecting side with its
    /// own system prompt.
    pub fn from_persona(persona: &PersonaConfig, glyphs: Glyphs) -> Self {
        let pieces = |source: &str| parse_pieces(&persona.expand_names(source));
        let mut speaking = Transcript::new(pieces(&persona.system_prompt));
        let greeting = pieces(&persona.seed_greeting);
        if !greeting.is_empty() {
            speaking.push(Segment::new(Role::Assistant, greeting));
        }
        let reflecting = Transcript::new(pieces(&persona.reflection_system_prompt));
        Self::new(speaking, reflecting, glyphs)
    }

    pub fn reset(&mut self) {
        self.speaking = self.speaking_seed.clone();
        self.reflecting = self.reflecting_seed.clone();
    }

    /// Append the user message and open an assistant turn on both sides.
    pub fn add_user_message(&mut self, text: &str) {
        let text = self.glyphs.strip(text);
        for transcript in [&mut self.speaking, &mut self.reflecting] {
            transcript.push(Segment::literal(Role::User, text.clone()));
            transcript.push(Segment::control(Role::Assistant));
        }
    }

    /// Append finalized assistant text, trailing whitespace trimmed.
    pub fn commit_assistant_turn(&mut self, text: &str) {
        let text = self.glyphs.strip(text);
        self.commit_turn(TurnDraft::default(), vec![Piece::Text(text)]);
    }

    /// Apply a turn's staged segments and its final response in one step.
    pub fn commit_turn(&mut self, draft: TurnDraft, response: Vec<Piece>) {
        let response = trim_trailing_whitespace(response);
        self.speaking.extend(draft.speaking);
        self.reflecting.extend(draft.reflecting);
        self.speaking
            .push(Segment::new(Role::Assistant, response.clone()));
        self.reflecting.push(Segment::new(Role::Assistant, response));
    }

    pub fn speaking(&self) -> &Transcript {
        &self.speaking
    }

    pub fn reflecting(&self) -> &Transcript {
        &self.reflecting
    }

    pub fn glyphs(&self) -> Glyphs {
        self.glyphs
    }
}
