//! Engine adapter for a llama.cpp HTTP server.
//!
//! Completions stream over `POST /completion` as server-sent events; the body
//! is read line by line from a blocking response, so each `next()` pulls at
//! most one event off the socket. Compute states map onto the server's slot
//! save/restore endpoints (the server must run with `--slot-save-path`).
//! Slot files are numbered and a number is reused once every handle to its
//! snapshot is gone, so the save directory stays as small as the set of live
//! handles.

use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{GenerateRequest, InferenceEngine, SnapshotLedger, StateHandle, TokenChunk, TokenStream};
use crate::config::EngineConfig;
use crate::error::{PenelopeError, PenelopeResult};
use crate::http_client::build_http_client;

/// Slot file numbers, recycled.
#[derive(Debug, Default)]
struct SlotFiles {
    free: Vec<u32>,
    next: u32,
}

impl SlotFiles {
    fn claim(&mut self) -> u32 {
        self.free.pop().unwrap_or_else(|| {
            let file = self.next;
            self.next += 1;
            file
        })
    }

    fn release(&mut self, file: u32) {
        self.free.push(file);
    }

    /// Distinct files ever written.
    fn written(&self) -> u32 {
        self.next
    }
}

pub struct LlamaServerEngine {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    slot_id: u32,
    slot_file_prefix: String,
    n_probs: u32,
    snapshots: SnapshotLedger<u32>,
    files: SlotFiles,
    in_flight: Arc<AtomicBool>,
}

impl LlamaServerEngine {
    pub fn new(config: &EngineConfig) -> PenelopeResult<Self> {
        let timeout = config.request_timeout_secs.map(Duration::from_secs);
        let client = build_http_client(timeout)
            .map_err(|e| PenelopeError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            slot_id: config.slot_id,
            slot_file_prefix: config.slot_file_prefix.clone(),
            n_probs: config.n_probs.max(1),
            snapshots: SnapshotLedger::new(),
            files: SlotFiles::default(),
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    fn post(&self, url: &str, body: &Value) -> PenelopeResult<Response> {
        let mut req = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        Ok(req.send()?)
    }

    fn slot_filename(&self, file: u32) -> String {
        format!("{}-{}-{}.bin", self.slot_file_prefix, self.slot_id, file)
    }

    /// Pick the file for the next save, reusing those of reclaimed snapshots.
    fn next_slot_file(&mut self) -> u32 {
        for file in self.snapshots.collect() {
            tracing::trace!("Slot file {} reclaimed", file);
            self.files.release(file);
        }
        self.files.claim()
    }

    fn slot_action(&self, action: &str, filename: &str) -> PenelopeResult<()> {
        let url = format!(
            "{}/slots/{}?action={}",
            self.api_url, self.slot_id, action
        );
        let response = self.post(&url, &json!({ "filename": filename }))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        if action == "restore" && status == StatusCode::NOT_FOUND {
            return Err(PenelopeError::StateHandleInvalid(format!(
                "server has no slot file {}: {}",
                filename, body
            )));
        }
        Err(PenelopeError::fault(format!(
            "slot {} returned {}: {}",
            action, status, body
        )))
    }

    fn ensure_idle(&self, operation: &str) -> PenelopeResult<()> {
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(PenelopeError::fault(format!(
                "{operation} while a completion is still streaming"
            )));
        }
        Ok(())
    }
}

impl InferenceEngine for LlamaServerEngine {
    fn generate(&mut self, request: &GenerateRequest) -> PenelopeResult<TokenStream> {
        self.ensure_idle("generate")?;
        let url = format!("{}/completion", self.api_url);
        let body = completion_body(request, self.slot_id, self.n_probs);

        tracing::debug!(
            "Opening completion stream (prompt {} chars, max_tokens {}, temperature {:.3})",
            request.prompt.len(),
            request.max_tokens,
            request.sampling.temperature
        );

        let response = self.post(&url, &body)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(PenelopeError::fault(format!(
                "completion API error {}: {}",
                status, body
            )));
        }

        self.in_flight.store(true, Ordering::SeqCst);
        Ok(Box::new(SseTokenStream {
            reader: BufReader::new(response),
            line: String::new(),
            done: false,
            in_flight: self.in_flight.clone(),
        }))
    }

    fn save_state(&mut self) -> PenelopeResult<StateHandle> {
        self.ensure_idle("save_state")?;
        let file = self.next_slot_file();
        if let Err(e) = self.slot_action("save", &self.slot_filename(file)) {
            self.files.release(file);
            return Err(e);
        }
        Ok(self.snapshots.issue(file))
    }

    fn load_state(&mut self, handle: &StateHandle) -> PenelopeResult<()> {
        self.ensure_idle("load_state")?;
        let file = *self.snapshots.get(handle)?;
        self.slot_action("restore", &self.slot_filename(file))
    }
}

fn completion_body(request: &GenerateRequest, slot_id: u32, n_probs: u32) -> Value {
    let sampling = &request.sampling;
    let mut body = json!({
        "prompt": request.prompt,
        "n_predict": request.max_tokens,
        "stop": request.stop,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
        "top_k": sampling.top_k,
        "repeat_penalty": sampling.repeat_penalty,
        "stream": true,
        "cache_prompt": true,
        "id_slot": slot_id,
    });

    if request.want_logprobs {
        body["n_probs"] = json!(n_probs);
    }
    if let Some(grammar) = &sampling.grammar {
        body["grammar"] = json!(grammar.to_gbnf());
    }
    body
}

#[derive(Debug, Clone, PartialEq)]
enum StreamEvent {
    Token(TokenChunk),
    /// Last event of the stream, possibly carrying a final token.
    Final(Option<TokenChunk>),
}

fn parse_stream_event(payload: &str) -> PenelopeResult<StreamEvent> {
    let value: Value = serde_json::from_str(payload).map_err(|e| {
        PenelopeError::fault(format!("failed to parse stream payload {}: {}", payload, e))
    })?;

    if let Some(error) = value.get("error") {
        let message = error["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        if message.to_ascii_lowercase().contains("grammar") {
            return Err(PenelopeError::GrammarViolation(message));
        }
        return Err(PenelopeError::ModelFault(message));
    }

    let content = value["content"].as_str().unwrap_or_default();
    let chunk = TokenChunk {
        text: content.to_string(),
        log_probability: extract_log_probability(&value, content),
    };

    if value["stop"].as_bool().unwrap_or(false) {
        return Ok(StreamEvent::Final((!content.is_empty()).then_some(chunk)));
    }
    Ok(StreamEvent::Token(chunk))
}

/// Log-probability of the sampled token.
///
/// Current servers report `logprob` directly. Older servers report the top
/// `n_probs` candidates as plain probabilities; when the sampled token is not
/// among them, the unlisted probability mass bounds it from above.
fn extract_log_probability(event: &Value, content: &str) -> Option<f64> {
    let entry = event["completion_probabilities"].as_array()?.first()?;

    if let Some(logprob) = entry["logprob"].as_f64() {
        return Some(logprob);
    }

    let candidates = entry["probs"].as_array()?;
    let sampled = entry["content"].as_str().unwrap_or(content);
    let mut listed_mass = 0.0;
    for candidate in candidates {
        let prob = candidate["prob"].as_f64().unwrap_or(0.0);
        if candidate["tok_str"].as_str() == Some(sampled) {
            return Some(prob.max(f64::MIN_POSITIVE).ln());
        }
        listed_mass += prob;
    }
    Some((1.0 - listed_mass).max(f64::MIN_POSITIVE).ln())
}

struct SseTokenStream {
    reader: BufReader<Response>,
    line: String,
    done: bool,
    in_flight: Arc<AtomicBool>,
}

impl Iterator for SseTokenStream {
    type Item = PenelopeResult<TokenChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(PenelopeError::fault(format!(
                        "failed reading streaming chunk: {e}"
                    ))));
                }
            }

            let line = self.line.trim();
            if line.is_empty() || line.starts_with(':') || !line.starts_with("data:") {
                continue;
            }

            let payload = line[5..].trim();
            if payload == "[DONE]" {
                self.done = true;
                return None;
            }

            match parse_stream_event(payload) {
                Ok(StreamEvent::Token(chunk)) => return Some(Ok(chunk)),
                Ok(StreamEvent::Final(chunk)) => {
                    self.done = true;
                    return chunk.map(Ok);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

impl Drop for SseTokenStream {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{Grammar, SamplingConfig};

    fn request() -> GenerateRequest {
        GenerateRequest {
            prompt: "<|im_start|>system\nhi".to_string(),
            max_tokens: 256,
            stop: vec!["<|im_end|>".to_string()],
            sampling: SamplingConfig {
                grammar: Some(Grammar::excluding(['‣'])),
                ..SamplingConfig::default()
            },
            want_logprobs: true,
        }
    }

    #[test]
    fn completion_body_carries_sampling_and_grammar() {
        let body = completion_body(&request(), 1, 10);
        assert_eq!(body["n_predict"], 256);
        assert_eq!(body["stream"], true);
        assert_eq!(body["id_slot"], 1);
        assert_eq!(body["n_probs"], 10);
        assert_eq!(body["top_k"], 20);
        assert_eq!(body["stop"][0], "<|im_end|>");
        assert!(body["grammar"].as_str().unwrap().starts_with("root ::="));
    }

    #[test]
    fn completion_body_omits_probs_when_not_wanted() {
        let mut req = request();
        req.want_logprobs = false;
        req.sampling.grammar = None;
        let body = completion_body(&req, 0, 10);
        assert!(body.get("n_probs").is_none());
        assert!(body.get("grammar").is_none());
    }

    #[test]
    fn parses_current_logprob_format() {
        let payload = r#"{"content":" the","stop":false,"completion_probabilities":[{"id":279,"token":" the","logprob":-0.25,"top_logprobs":[]}]}"#;
        match parse_stream_event(payload).unwrap() {
            StreamEvent::Token(chunk) => {
                assert_eq!(chunk.text, " the");
                assert_eq!(chunk.log_probability, Some(-0.25));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn parses_legacy_probability_format() {
        let payload = r#"{"content":"4","stop":false,"completion_probabilities":[{"content":"4","probs":[{"tok_str":"4","prob":0.5},{"tok_str":"5","prob":0.25}]}]}"#;
        match parse_stream_event(payload).unwrap() {
            StreamEvent::Token(chunk) => {
                let lp = chunk.log_probability.unwrap();
                assert!((lp - 0.5f64.ln()).abs() < 1e-12);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn unlisted_legacy_token_uses_remaining_mass() {
        let payload = r#"{"content":"x","stop":false,"completion_probabilities":[{"content":"x","probs":[{"tok_str":"y","prob":0.75}]}]}"#;
        match parse_stream_event(payload).unwrap() {
            StreamEvent::Token(chunk) => {
                let lp = chunk.log_probability.unwrap();
                assert!((lp - 0.25f64.ln()).abs() < 1e-12);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn missing_probabilities_are_unscored() {
        match parse_stream_event(r#"{"content":"hi","stop":false}"#).unwrap() {
            StreamEvent::Token(chunk) => assert_eq!(chunk.log_probability, None),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn stop_event_without_content_is_final() {
        let event = parse_stream_event(r#"{"content":"","stop":true,"stopped_word":true}"#).unwrap();
        assert_eq!(event, StreamEvent::Final(None));
    }

    #[test]
    fn error_payloads_are_faults() {
        let err = parse_stream_event(r#"{"error":{"code":500,"message":"context overflow"}}"#)
            .unwrap_err();
        assert!(matches!(err, PenelopeError::ModelFault(_)));

        let err = parse_stream_event(r#"{"error":{"message":"failed to parse grammar"}}"#)
            .unwrap_err();
        assert!(matches!(err, PenelopeError::GrammarViolation(_)));
    }

    #[test]
    fn slot_files_are_recycled_across_swaps() {
        let mut engine = LlamaServerEngine::new(&EngineConfig::default()).unwrap();
        let save = |engine: &mut LlamaServerEngine| {
            let file = engine.next_slot_file();
            engine.snapshots.issue(file)
        };

        // Seed plus one parked slot, swapped the way compute slots do it.
        let seed = save(&mut engine);
        let mut parked = save(&mut engine);
        for _ in 0..50 {
            parked = save(&mut engine);
        }

        assert_eq!(engine.files.written(), 3);
        engine.snapshots.collect();
        assert_eq!(engine.snapshots.len(), 2);
        assert_eq!(engine.slot_filename(0), "penelope-0-0.bin");
        drop((seed, parked));
    }
}
