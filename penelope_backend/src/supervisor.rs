//! Turn-level generation control.
//!
//! A turn alternates between streaming the speaking transcript and running
//! reflection episodes, until the engine stops on its own. The caller sees a
//! single pull-based sequence of [`StreamToken`]s. Nothing is written to the
//! transcripts until the stream finishes cleanly; dropping it early, or a
//! fault, leaves the committed state exactly as it was before the turn.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::compute::{ComputeSlots, Slot, SlotCheckpoint};
use crate::config::{PenelopeConfig, SamplerConfig, TurnConfig};
use crate::cycle::CycleDetector;
use crate::engine::{GenerateRequest, Grammar, InferenceEngine, SamplingConfig, TokenChunk, TokenStream};
use crate::error::{PenelopeError, PenelopeResult};
use crate::policy::{Decision, PonderCounters, PonderPolicy, ReflectReason, TokenObservation};
use crate::reflection::{ReflectionController, ReflectionEpisode, ReflectionSummary};
use crate::transcript::{ChatTemplate, Glyphs, Marker, ResponseBuffer, TranscriptStore, TurnDraft};

/// One item of a response stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamToken {
    pub token: String,
    /// How hard the model had to ponder before this token, roughly 0..1.
    pub ponder_intensity: f64,
    /// Part of a reflection, not of the spoken answer.
    pub is_thought: bool,
    pub log_probability: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    /// Pondering and reflection enabled.
    Reflective,
    /// Straight sampling at the base temperature.
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    InProgress,
    Completed,
    Abandoned,
    Failed,
}

/// Bookkeeping for one turn, kept after it ends.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub id: Uuid,
    pub mode: TurnMode,
    pub outcome: TurnOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tokens: usize,
    pub thought_tokens: usize,
    pub ponder_markers: usize,
    pub force_markers: usize,
    pub longest_marker_run: usize,
    pub reflections: usize,
    pub cycles: usize,
    pub restarts: usize,
    /// Text of each finished reflection, in order.
    pub thoughts: Vec<String>,
}

impl TurnReport {
    fn start(mode: TurnMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            outcome: TurnOutcome::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            tokens: 0,
            thought_tokens: 0,
            ponder_markers: 0,
            force_markers: 0,
            longest_marker_run: 0,
            reflections: 0,
            cycles: 0,
            restarts: 0,
            thoughts: Vec::new(),
        }
    }

    fn note_reflection(&mut self, summary: ReflectionSummary) {
        self.reflections += 1;
        self.thoughts.push(summary.thought);
    }

    fn note_marker(&mut self, marker: Marker, run: usize) {
        match marker {
            Marker::Ponder => self.ponder_markers += 1,
            Marker::Force => self.force_markers += 1,
        }
        self.longest_marker_run = self.longest_marker_run.max(run);
    }
}

pub struct Supervisor<E: InferenceEngine> {
    engine: E,
    slots: ComputeSlots,
    store: TranscriptStore,
    speaking_template: ChatTemplate,
    reflection: ReflectionController,
    policy: PonderPolicy,
    cycle: CycleDetector,
    turn: TurnConfig,
    sampler: SamplerConfig,
    grammar: Grammar,
    glyphs: Glyphs,
    last_report: Option<TurnReport>,
}

impl<E: InferenceEngine> Supervisor<E> {
    pub fn new(mut engine: E, config: &PenelopeConfig) -> PenelopeResult<Self> {
        config.validate()?;
        let slots = ComputeSlots::new(&mut engine)?;
        let glyphs = config.glyphs;
        Ok(Self {
            store: TranscriptStore::from_persona(&config.persona, glyphs),
            speaking_template: ChatTemplate::new(&config.template.speaking, &config.persona, glyphs),
            reflection: ReflectionController::new(
                config.reflection.clone(),
                config.sampling.clone(),
                &config.template.reflecting,
                &config.persona,
                glyphs,
            ),
            policy: PonderPolicy::new(config.ponder),
            cycle: config.cycle,
            turn: config.turn.clone(),
            sampler: config.sampling.clone(),
            grammar: Grammar::excluding(glyphs.reserved()),
            glyphs,
            engine,
            slots,
            last_report: None,
        })
    }

    /// Return both transcripts and both compute slots to their seed state.
    pub fn reset_memory(&mut self) -> PenelopeResult<()> {
        self.store.reset();
        self.slots.reset(&mut self.engine)?;
        tracing::info!("Memory reset to seed transcripts");
        Ok(())
    }

    pub fn add_user_message(&mut self, text: &str) {
        tracing::debug!("User message: {} chars", text.len());
        self.store.add_user_message(text);
    }

    /// Stream the assistant's answer with pondering and reflection.
    pub fn generate_response(&mut self) -> ResponseStream<'_, E> {
        ResponseStream::new(self, TurnMode::Reflective)
    }

    /// Stream an answer at the base temperature without pondering or
    /// reflection. Committed the same way as a reflective turn.
    pub fn generate_plain_response(&mut self) -> ResponseStream<'_, E> {
        ResponseStream::new(self, TurnMode::Plain)
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.store
    }

    pub fn active_slot(&self) -> Slot {
        self.slots.active()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn last_report(&self) -> Option<&TurnReport> {
        self.last_report.as_ref()
    }

    pub fn policy(&self) -> &PonderPolicy {
        &self.policy
    }

    /// The committed speaking transcript as the engine sees it.
    pub fn speaking_prompt(&self) -> String {
        self.speaking_template.render(self.store.speaking().segments())
    }
}

enum Phase {
    /// A new speaking stream must be opened.
    Open,
    Streaming(TokenStream),
    Reflecting(ReflectionEpisode),
    Done,
}

/// A turn in progress. Holds the supervisor exclusively until dropped.
pub struct ResponseStream<'a, E: InferenceEngine> {
    sup: &'a mut Supervisor<E>,
    mode: TurnMode,
    phase: Phase,
    buffer: ResponseBuffer,
    draft: TurnDraft,
    counters: PonderCounters,
    pondering: bool,
    pending: VecDeque<StreamToken>,
    report: TurnReport,
    /// Slot assignment from before the turn; discarded on commit.
    rollback: Option<SlotCheckpoint>,
    finished: bool,
}

impl<'a, E: InferenceEngine> ResponseStream<'a, E> {
    fn new(sup: &'a mut Supervisor<E>, mode: TurnMode) -> Self {
        let counters = sup.policy.initial_counters();
        let rollback = Some(sup.slots.checkpoint());
        let report = TurnReport::start(mode);
        tracing::debug!("Turn {} started ({:?})", report.id, mode);
        Self {
            sup,
            mode,
            phase: Phase::Open,
            buffer: ResponseBuffer::default(),
            draft: TurnDraft::default(),
            counters,
            pondering: mode == TurnMode::Reflective,
            pending: VecDeque::new(),
            report,
            rollback,
            finished: false,
        }
    }

    /// Text of the current turn so far, markers excluded.
    pub fn response_so_far(&self) -> String {
        self.buffer.text()
    }

    pub fn report(&self) -> &TurnReport {
        &self.report
    }

    fn open_stream(&mut self) -> PenelopeResult<TokenStream> {
        let sup = &*self.sup;
        let mut prompt = sup
            .speaking_template
            .render(sup.store.speaking().segments().iter().chain(self.draft.speaking.iter()));
        sup.speaking_template.render_pieces(&mut prompt, self.buffer.pieces());

        let temperature = match self.mode {
            TurnMode::Reflective => sup.policy.temperature(&self.counters),
            TurnMode::Plain => sup.policy.config().base_temperature,
        };
        let request = GenerateRequest {
            prompt,
            max_tokens: sup.turn.max_tokens,
            stop: sup.turn.stop.clone(),
            sampling: SamplingConfig {
                temperature,
                top_p: sup.sampler.top_p,
                top_k: sup.sampler.top_k,
                repeat_penalty: sup.sampler.repeat_penalty,
                grammar: sup
                    .turn
                    .constrain_main_generation
                    .then(|| sup.grammar.clone()),
            },
            want_logprobs: self.mode == TurnMode::Reflective,
        };

        tracing::debug!(
            "Opening speaking stream at temperature {:.3} ({} ponders)",
            temperature,
            self.counters.consecutive_ponders
        );
        self.report.restarts += 1;
        self.sup.engine.generate(&request)
    }

    fn emit_spoken(&mut self, text: String, intensity: f64, log_probability: Option<f64>) {
        self.buffer.push_text(&text);
        if text.is_empty() {
            return;
        }
        self.report.tokens += 1;
        self.pending.push_back(StreamToken {
            token: text,
            ponder_intensity: intensity,
            is_thought: false,
            log_probability,
        });
    }

    fn on_speaking_token(&mut self, chunk: TokenChunk, stream: TokenStream) -> PenelopeResult<()> {
        let text = self.sup.glyphs.strip(&chunk.text);

        if self.mode == TurnMode::Plain {
            self.emit_spoken(text, 0.0, chunk.log_probability);
            self.phase = Phase::Streaming(stream);
            return Ok(());
        }

        let observation = TokenObservation {
            text: &text,
            log_probability: if self.pondering {
                chunk.log_probability
            } else {
                None
            },
            cycle_detected: self.sup.cycle.detect(&self.buffer.text()),
            at_boundary: self.buffer.ends_at_boundary(),
        };
        let decision = self.sup.policy.decide(&observation, &mut self.counters);

        match decision {
            Decision::Accept {
                leading_space,
                intensity,
                stop_pondering,
            } => {
                if stop_pondering && self.pondering {
                    self.pondering = false;
                    tracing::debug!("Engine reports no log-probabilities; pondering off for this turn");
                }
                if leading_space {
                    self.emit_spoken(" ".to_string(), intensity, None);
                }
                self.emit_spoken(text, intensity, chunk.log_probability);
                self.phase = Phase::Streaming(stream);
            }
            Decision::Mark(marker) => {
                drop(stream);
                self.buffer.push_marker(marker);
                let run = self.buffer.trailing_markers();
                self.report.note_marker(marker, run);
                tracing::debug!(
                    "{:?} marker after {:?} (lp {:?}), run {}",
                    marker,
                    text,
                    chunk.log_probability,
                    run
                );
                self.phase = Phase::Open;
            }
            Decision::Reflect(reason) => {
                drop(stream);
                self.begin_reflection(reason)?;
            }
        }
        Ok(())
    }

    fn begin_reflection(&mut self, reason: ReflectReason) -> PenelopeResult<()> {
        if reason == ReflectReason::Cycle {
            self.report.cycles += 1;
            tracing::warn!("Response is repeating itself; reflecting");
        }
        let interrupted = self.buffer.take();
        let sup = &mut *self.sup;
        let episode = sup.reflection.begin(
            &mut sup.engine,
            &mut sup.slots,
            &sup.store,
            &self.draft,
            interrupted,
            reason,
        )?;
        self.phase = Phase::Reflecting(episode);
        Ok(())
    }

    fn complete(&mut self) {
        let response = self.buffer.take();
        let draft = std::mem::take(&mut self.draft);
        self.sup.store.commit_turn(draft, response);
        self.rollback = None;
        self.phase = Phase::Done;
        self.finish_report(TurnOutcome::Completed);
        tracing::info!(
            "Turn {} committed: {} tokens, {} reflections, {} markers",
            self.report.id,
            self.report.tokens,
            self.report.reflections,
            self.report.ponder_markers + self.report.force_markers
        );
    }

    fn fail(&mut self, error: PenelopeError) -> PenelopeError {
        tracing::error!("Turn {} failed: {}", self.report.id, error);
        self.phase = Phase::Done;
        self.pending.clear();
        self.roll_back_slots();
        self.finish_report(TurnOutcome::Failed);
        error
    }

    /// Put the compute slots back where they were before the turn, so a
    /// reflection finished earlier in the turn does not outlive it.
    fn roll_back_slots(&mut self) {
        let Some(checkpoint) = self.rollback.take() else {
            return;
        };
        let sup = &mut *self.sup;
        if let Err(e) = sup.slots.restore(&mut sup.engine, checkpoint) {
            tracing::error!("Failed to roll back compute slots: {}", e);
        }
    }

    fn finish_report(&mut self, outcome: TurnOutcome) {
        self.finished = true;
        self.report.outcome = outcome;
        self.report.finished_at = Some(Utc::now());
        self.sup.last_report = Some(self.report.clone());
    }
}

impl<E: InferenceEngine> Iterator for ResponseStream<'_, E> {
    type Item = PenelopeResult<StreamToken>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(token));
            }

            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Open => match self.open_stream() {
                    Ok(stream) => self.phase = Phase::Streaming(stream),
                    Err(e) => return Some(Err(self.fail(e))),
                },
                Phase::Streaming(mut stream) => match stream.next() {
                    Some(Ok(chunk)) => {
                        if let Err(e) = self.on_speaking_token(chunk, stream) {
                            return Some(Err(self.fail(e)));
                        }
                    }
                    Some(Err(PenelopeError::GrammarViolation(message))) => {
                        tracing::warn!("Speaking stream hit a grammar violation: {}", message);
                        if self.mode == TurnMode::Plain {
                            drop(stream);
                            self.complete();
                            continue;
                        }
                        // Treated as an empty, unusable token.
                        let empty = TokenChunk::new("", f64::NEG_INFINITY);
                        if let Err(e) = self.on_speaking_token(empty, stream) {
                            return Some(Err(self.fail(e)));
                        }
                    }
                    Some(Err(e)) => {
                        drop(stream);
                        return Some(Err(self.fail(e)));
                    }
                    None => {
                        drop(stream);
                        self.complete();
                    }
                },
                Phase::Reflecting(mut episode) => match episode.next_thought() {
                    Some(Ok(chunk)) => {
                        self.report.thought_tokens += 1;
                        self.phase = Phase::Reflecting(episode);
                        return Some(Ok(StreamToken {
                            token: chunk.text,
                            ponder_intensity: 0.0,
                            is_thought: true,
                            log_probability: chunk.log_probability,
                        }));
                    }
                    Some(Err(e)) => {
                        let sup = &mut *self.sup;
                        sup.reflection.abort(&mut sup.engine, &mut sup.slots, episode);
                        return Some(Err(self.fail(e)));
                    }
                    None => {
                        let sup = &mut *self.sup;
                        match sup
                            .reflection
                            .finish(&mut sup.engine, &mut sup.slots, episode, &mut self.draft)
                        {
                            Ok(summary) => {
                                self.report.note_reflection(summary);
                                self.phase = Phase::Open;
                            }
                            Err(e) => return Some(Err(self.fail(e))),
                        }
                    }
                },
            }
        }
    }
}

impl<E: InferenceEngine> Drop for ResponseStream<'_, E> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Reflecting(episode) => {
                let sup = &mut *self.sup;
                sup.reflection.abort(&mut sup.engine, &mut sup.slots, episode);
            }
            Phase::Streaming(stream) => drop(stream),
            Phase::Open | Phase::Done => {}
        }
        self.roll_back_slots();
        tracing::warn!(
            "Turn {} abandoned after {} tokens; nothing committed",
            self.report.id,
            self.report.tokens
        );
        self.finish_report(TurnOutcome::Abandoned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::script;
    use crate::engine::{ScriptStep, ScriptedEngine};
    use crate::transcript::{Piece, Role};

    fn supervisor<I>(scripts: I) -> Supervisor<ScriptedEngine>
    where
        I: IntoIterator<Item = Vec<ScriptStep>>,
    {
        Supervisor::new(ScriptedEngine::with_scripts(scripts), &PenelopeConfig::default()).unwrap()
    }

    fn low_streams(n: usize) -> Vec<Vec<ScriptStep>> {
        (0..n).map(|_| script(&["hm"], -5.0)).collect()
    }

    fn segment_counts<E: InferenceEngine>(sup: &Supervisor<E>) -> (usize, usize) {
        (
            sup.transcripts().speaking().len(),
            sup.transcripts().reflecting().len(),
        )
    }

    #[test]
    fn confident_answer_streams_and_commits() {
        let mut sup = supervisor([script(&["4", " ", "is", " ", "the", " ", "answer"], -0.1)]);
        sup.add_user_message("What is 2+2?");

        let tokens: Vec<StreamToken> = sup.generate_response().map(|t| t.unwrap()).collect();
        assert_eq!(tokens.len(), 7);
        assert!(tokens.iter().all(|t| !t.is_thought && t.ponder_intensity == 0.0));

        let last = sup.transcripts().speaking().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), "4 is the answer");
        assert_eq!(sup.transcripts().reflecting().last().unwrap().text(), "4 is the answer");
        assert_eq!(sup.last_report().unwrap().outcome, TurnOutcome::Completed);
    }

    #[test]
    fn sustained_low_confidence_forces_one_reflection() {
        let mut scripts = low_streams(15);
        scripts.push(script(&["I", " should", " just", " answer"], -0.2));
        scripts.push(script(&["Four", "."], -0.1));
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");
        let before = segment_counts(&sup);

        let tokens: Vec<StreamToken> = sup.generate_response().map(|t| t.unwrap()).collect();
        let thoughts: Vec<&str> = tokens
            .iter()
            .filter(|t| t.is_thought)
            .map(|t| t.token.as_str())
            .collect();
        assert_eq!(thoughts, vec!["I", " should", " just", " answer"]);
        assert!(tokens.iter().filter(|t| t.is_thought).all(|t| t.ponder_intensity == 0.0));

        let spoken: String = tokens
            .iter()
            .filter(|t| !t.is_thought)
            .map(|t| t.token.as_str())
            .collect();
        assert_eq!(spoken, " Four.");

        let report = sup.last_report().unwrap();
        assert_eq!(report.reflections, 1);
        assert_eq!(report.longest_marker_run, 14);
        assert_eq!(report.ponder_markers, 11);
        assert_eq!(report.force_markers, 3);

        // Five spliced segments plus the final answer.
        let after = segment_counts(&sup);
        assert_eq!(after.0, before.0 + 6);
        assert_eq!(after.1, before.1 + 5);
        let speaking = sup.transcripts().speaking().segments();
        assert_eq!(speaking[before.0].marker_count(), 14);
        assert_eq!(speaking[before.0 + 1].role, Role::ReflectionOpen);
        assert_eq!(speaking[before.0 + 2].text(), "I should just answer");
        assert_eq!(speaking[before.0 + 3].role, Role::ReflectionClose);
        assert_eq!(speaking[before.0 + 4].role, Role::Recap);
        assert_eq!(speaking[before.0 + 5].text(), " Four.");
        assert_eq!(sup.active_slot(), Slot::Speaking);
    }

    #[test]
    fn fourteen_low_steps_alone_do_not_reflect() {
        let mut scripts = low_streams(14);
        scripts.push(script(&["Four", "."], -0.1));
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");
        sup.generate_response().for_each(|t| {
            t.unwrap();
        });

        let report = sup.last_report().unwrap();
        assert_eq!(report.reflections, 0);
        assert_eq!(report.ponder_markers + report.force_markers, 14);
        assert_eq!(sup.engine().requests().len(), 15);
        assert_eq!(sup.engine().requests()[14].sampling.temperature, 0.0);
        assert_eq!(sup.transcripts().speaking().last().unwrap().text(), " Four.");
    }

    #[test]
    fn finished_reflection_records_its_thought() {
        let mut scripts = low_streams(15);
        scripts.push(script(&["Just", " say", " it"], -0.2));
        scripts.push(script(&["Four."], -0.1));
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");
        sup.generate_response().for_each(|t| {
            t.unwrap();
        });
        assert_eq!(sup.last_report().unwrap().thoughts, vec!["Just say it".to_string()]);
    }

    #[test]
    fn fault_after_reflection_restores_reflecting_slot() {
        let mut scripts = low_streams(15);
        scripts.push(script(&["thinking"], -0.2));
        scripts.push(vec![ScriptStep::Fault("connection reset".to_string())]);
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");
        let snapshots_before = sup.engine_mut().live_snapshots();

        let items: Vec<_> = sup.generate_response().collect();
        assert!(matches!(items.last(), Some(Err(PenelopeError::ModelFault(_)))));
        assert_eq!(sup.active_slot(), Slot::Speaking);
        assert_eq!(sup.engine_mut().live_snapshots(), snapshots_before);

        let Supervisor { engine, slots, .. } = &mut sup;
        slots.activate(engine, Slot::Reflecting).unwrap();
        assert_eq!(engine.cached_prompt(), "");
    }

    #[test]
    fn abandoning_after_reflection_restores_reflecting_slot() {
        let mut scripts = low_streams(15);
        scripts.push(script(&["thinking"], -0.2));
        scripts.push(script(&["Four", " is", " it"], -0.1));
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");

        {
            let mut stream = sup.generate_response();
            let mut spoken = 0;
            while spoken < 2 {
                if !stream.next().unwrap().unwrap().is_thought {
                    spoken += 1;
                }
            }
        }

        assert_eq!(sup.last_report().unwrap().outcome, TurnOutcome::Abandoned);
        let Supervisor { engine, slots, .. } = &mut sup;
        slots.activate(engine, Slot::Reflecting).unwrap();
        assert_eq!(engine.cached_prompt(), "");
    }

    #[test]
    fn sampling_anneals_across_restarts() {
        let mut scripts = low_streams(15);
        scripts.push(script(&["thinking"], -0.2));
        scripts.push(script(&["Four."], -0.1));
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");
        sup.generate_response().for_each(|t| {
            t.unwrap();
        });

        let requests = sup.engine().requests();
        assert_eq!(requests.len(), 17);
        assert!((requests[0].sampling.temperature - 0.7).abs() < 1e-12);
        assert!((requests[13].sampling.temperature - 0.05).abs() < 1e-9);
        assert_eq!(requests[14].sampling.temperature, 0.0);
        assert!(requests[14].prompt.ends_with("‣‣‣‣‣‣‣‣‣‣‣⬳⬳⬳"));
        assert_eq!(requests[15].max_tokens, 256);
        assert_eq!(requests[16].sampling.temperature, 0.0);
        assert!(requests[16].prompt.contains("Continuation: \n..."));
    }

    #[test]
    fn abandoning_a_turn_commits_nothing() {
        let mut sup = supervisor([script(&["The", " answer", " is", " four"], -0.1)]);
        sup.add_user_message("What is 2+2?");
        let before = segment_counts(&sup);

        {
            let mut stream = sup.generate_response();
            for _ in 0..2 {
                stream.next().unwrap().unwrap();
            }
        }

        assert_eq!(segment_counts(&sup), before);
        assert_eq!(sup.active_slot(), Slot::Speaking);
        assert_eq!(sup.engine().live_streams(), 0);
        assert_eq!(sup.last_report().unwrap().outcome, TurnOutcome::Abandoned);
    }

    #[test]
    fn abandoning_mid_reflection_restores_speaking_slot() {
        let mut scripts = low_streams(15);
        scripts.push(script(&["hmm", " let", " me", " see"], -0.2));
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");
        let before = segment_counts(&sup);

        {
            let mut stream = sup.generate_response();
            let first = stream.next().unwrap().unwrap();
            assert!(first.is_thought);
        }

        assert_eq!(segment_counts(&sup), before);
        assert_eq!(sup.active_slot(), Slot::Speaking);
        assert_eq!(sup.engine().live_streams(), 0);
    }

    #[test]
    fn fault_propagates_and_leaves_store_unchanged() {
        let mut sup = supervisor([vec![
            ScriptStep::token("4", -0.1),
            ScriptStep::Fault("connection reset".to_string()),
        ]]);
        sup.add_user_message("What is 2+2?");
        let before = segment_counts(&sup);

        let mut stream = sup.generate_response();
        assert_eq!(stream.next().unwrap().unwrap().token, "4");
        assert!(matches!(
            stream.next(),
            Some(Err(PenelopeError::ModelFault(_)))
        ));
        assert!(stream.next().is_none());
        drop(stream);

        assert_eq!(segment_counts(&sup), before);
        assert_eq!(sup.last_report().unwrap().outcome, TurnOutcome::Failed);
    }

    #[test]
    fn fault_during_reflection_restores_speaking_slot() {
        let mut scripts = low_streams(15);
        scripts.push(vec![
            ScriptStep::token("so", -0.2),
            ScriptStep::Fault("out of memory".to_string()),
        ]);
        let mut sup = supervisor(scripts);
        sup.add_user_message("What is 2+2?");
        let before = segment_counts(&sup);

        let items: Vec<_> = sup.generate_response().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].as_ref().unwrap().is_thought);
        assert!(matches!(items[1], Err(PenelopeError::ModelFault(_))));
        assert_eq!(segment_counts(&sup), before);
        assert_eq!(sup.active_slot(), Slot::Speaking);
    }

    #[test]
    fn repeating_output_triggers_reflection() {
        let mut sup = supervisor([
            script(&["abcdef", "abcdef", "abcdef", "abcdef"], -0.1),
            script(&["stuck"], -0.2),
            script(&["Done."], -0.1),
        ]);
        sup.add_user_message("Say something");
        let tokens: Vec<StreamToken> = sup.generate_response().map(|t| t.unwrap()).collect();

        let report = sup.last_report().unwrap();
        assert_eq!(report.cycles, 1);
        assert_eq!(report.reflections, 1);
        assert_eq!(tokens.iter().filter(|t| t.is_thought).count(), 1);
        let speaking = sup.transcripts().speaking().segments();
        let interrupted = &speaking[speaking.len() - 6];
        assert_eq!(interrupted.text(), "abcdefabcdefabcdef");
        assert_eq!(speaking.last().unwrap().text(), " Done.");
    }

    #[test]
    fn ponder_markers_stay_out_of_spoken_tokens() {
        let mut sup = supervisor([
            script(&["Um"], -6.0),
            script(&["Yes", "."], -0.1),
        ]);
        sup.add_user_message("Really?");
        let tokens: Vec<StreamToken> = sup.generate_response().map(|t| t.unwrap()).collect();
        let spoken: Vec<&str> = tokens.iter().map(|t| t.token.as_str()).collect();
        assert_eq!(spoken, vec![" ", "Yes", "."]);
        assert!((tokens[1].ponder_intensity - 1.0 / 14.0).abs() < 1e-12);

        let committed = &sup.transcripts().speaking().last().unwrap().body;
        assert_eq!(
            committed,
            &vec![
                Piece::Marker(Marker::Ponder),
                Piece::Text(" Yes.".to_string())
            ]
        );
    }

    #[test]
    fn grammar_violation_counts_as_low_confidence() {
        let mut sup = supervisor([
            vec![ScriptStep::GrammarViolation],
            script(&["ok"], -0.1),
        ]);
        sup.add_user_message("hi");
        sup.generate_response().for_each(|t| {
            t.unwrap();
        });
        let report = sup.last_report().unwrap();
        assert_eq!(report.ponder_markers, 1);
        assert_eq!(sup.transcripts().speaking().last().unwrap().text(), " ok");
    }

    #[test]
    fn missing_log_probabilities_disable_pondering() {
        let mut sup = supervisor([vec![
            ScriptStep::unscored("hi"),
            ScriptStep::token(" there", -9.0),
        ]]);
        sup.add_user_message("hello");
        let tokens: Vec<StreamToken> = sup.generate_response().map(|t| t.unwrap()).collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(sup.transcripts().speaking().last().unwrap().text(), "hi there");
        assert_eq!(sup.engine().requests().len(), 1);
    }

    #[test]
    fn plain_turn_ignores_confidence() {
        let mut sup = supervisor([script(&["Sure", "."], -9.0)]);
        sup.add_user_message("Can you?");
        let tokens: Vec<StreamToken> = sup.generate_plain_response().map(|t| t.unwrap()).collect();
        assert_eq!(tokens.len(), 2);

        let request = &sup.engine().requests()[0];
        assert!((request.sampling.temperature - 0.7).abs() < 1e-12);
        assert!(!request.want_logprobs);
        assert_eq!(sup.transcripts().speaking().last().unwrap().text(), "Sure.");
        assert_eq!(sup.last_report().unwrap().mode, TurnMode::Plain);
    }

    #[test]
    fn main_request_carries_turn_settings() {
        let mut sup = supervisor([script(&["ok"], -0.1)]);
        sup.add_user_message("hi");
        sup.generate_response().for_each(|t| {
            t.unwrap();
        });
        let request = &sup.engine().requests()[0];
        assert_eq!(request.max_tokens, 8128);
        assert_eq!(request.stop, vec!["<|im_end|>".to_string()]);
        assert_eq!(request.sampling.top_k, 20);
        assert!(request.sampling.grammar.is_some());
        assert!(request.prompt.ends_with("<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"));
    }

    #[test]
    fn reset_restores_seed_transcripts_and_slot() {
        let mut scripts = low_streams(15);
        scripts.push(script(&["hmm"], -0.2));
        scripts.push(script(&["Four."], -0.1));
        let mut sup = supervisor(scripts);
        let seed = segment_counts(&sup);
        sup.add_user_message("What is 2+2?");
        sup.generate_response().for_each(|t| {
            t.unwrap();
        });
        assert_ne!(segment_counts(&sup), seed);

        sup.reset_memory().unwrap();
        assert_eq!(segment_counts(&sup), seed);
        assert_eq!(sup.active_slot(), Slot::Speaking);
        assert_eq!(sup.engine().cached_prompt(), "");
    }
}
