//! Deterministic in-process engine.
//!
//! Replays queued scripts, one per `generate` call, and records every request
//! it receives. The prefix cache is modelled as the last prompt evaluated, so
//! save/restore behaves like a real engine from the supervisor's point of view.
//! Used by the test suite and by the front end's `--scripted` demo mode.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{GenerateRequest, InferenceEngine, SnapshotLedger, StateHandle, TokenChunk, TokenStream};
use crate::error::{PenelopeError, PenelopeResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Token(TokenChunk),
    /// Stream fails with a model fault at this point.
    Fault(String),
    /// Stream reports an unsatisfiable grammar at this point.
    GrammarViolation,
}

impl ScriptStep {
    pub fn token(text: &str, log_probability: f64) -> Self {
        ScriptStep::Token(TokenChunk::new(text, log_probability))
    }

    pub fn unscored(text: &str) -> Self {
        ScriptStep::Token(TokenChunk::unscored(text))
    }
}

/// Build a script where every token shares one log-probability.
pub fn script(tokens: &[&str], log_probability: f64) -> Vec<ScriptStep> {
    tokens
        .iter()
        .map(|t| ScriptStep::token(t, log_probability))
        .collect()
}

pub struct ScriptedEngine {
    scripts: VecDeque<Vec<ScriptStep>>,
    requests: Vec<GenerateRequest>,
    cache: String,
    snapshots: SnapshotLedger<String>,
    live_streams: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            scripts: VecDeque::new(),
            requests: Vec::new(),
            cache: String::new(),
            snapshots: SnapshotLedger::new(),
            live_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_scripts<I>(scripts: I) -> Self
    where
        I: IntoIterator<Item = Vec<ScriptStep>>,
    {
        let mut engine = Self::new();
        engine.scripts.extend(scripts);
        engine
    }

    pub fn push_script(&mut self, steps: Vec<ScriptStep>) {
        self.scripts.push_back(steps);
    }

    pub fn remaining_scripts(&self) -> usize {
        self.scripts.len()
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> &[GenerateRequest] {
        &self.requests
    }

    /// Prompt currently held in the working cache.
    pub fn cached_prompt(&self) -> &str {
        &self.cache
    }

    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    /// Drop a snapshot so that later loads of `handle` are rejected as stale.
    pub fn invalidate(&mut self, handle: &StateHandle) {
        self.snapshots.revoke(handle);
    }

    /// Snapshots still reachable through some handle.
    pub fn live_snapshots(&mut self) -> usize {
        self.snapshots.collect();
        self.snapshots.len()
    }

    fn ensure_idle(&self, operation: &str) -> PenelopeResult<()> {
        if self.live_streams() > 0 {
            return Err(PenelopeError::fault(format!(
                "{operation} while a generation is still in flight"
            )));
        }
        Ok(())
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn generate(&mut self, request: &GenerateRequest) -> PenelopeResult<TokenStream> {
        self.ensure_idle("generate")?;
        self.requests.push(request.clone());
        self.cache = request.prompt.clone();

        let steps = self.scripts.pop_front().unwrap_or_default();
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedStream {
            steps: steps.into_iter(),
            remaining: request.max_tokens,
            finished: false,
            live: self.live_streams.clone(),
        }))
    }

    fn save_state(&mut self) -> PenelopeResult<StateHandle> {
        self.ensure_idle("save_state")?;
        self.snapshots.collect();
        Ok(self.snapshots.issue(self.cache.clone()))
    }

    fn load_state(&mut self, handle: &StateHandle) -> PenelopeResult<()> {
        self.ensure_idle("load_state")?;
        self.cache = self.snapshots.get(handle)?.clone();
        Ok(())
    }
}

struct ScriptedStream {
    steps: std::vec::IntoIter<ScriptStep>,
    remaining: u32,
    finished: bool,
    live: Arc<AtomicUsize>,
}

impl Iterator for ScriptedStream {
    type Item = PenelopeResult<TokenChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.remaining == 0 {
            return None;
        }
        match self.steps.next()? {
            ScriptStep::Token(chunk) => {
                self.remaining -= 1;
                Some(Ok(chunk))
            }
            ScriptStep::Fault(message) => {
                self.finished = true;
                Some(Err(PenelopeError::ModelFault(message)))
            }
            ScriptStep::GrammarViolation => {
                self.finished = true;
                Some(Err(PenelopeError::GrammarViolation(
                    "scripted grammar violation".to_string(),
                )))
            }
        }
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
