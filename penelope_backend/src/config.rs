use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cycle::CycleDetector;
use crate::delivery::DeliveryConfig;
use crate::error::{PenelopeError, PenelopeResult};
use crate::policy::PonderConfig;
use crate::transcript::{Dialect, Glyphs};

const CONFIG_FILE_NAME: &str = "penelope_config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the llama.cpp server.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Server slot holding the working cache.
    #[serde(default)]
    pub slot_id: u32,
    /// Prefix for slot snapshot files written by the server.
    #[serde(default = "default_slot_file_prefix")]
    pub slot_file_prefix: String,
    /// Whole-request timeout; unset means streams may run as long as needed.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Candidates requested per token for log-probability lookup.
    #[serde(default = "default_n_probs")]
    pub n_probs: u32,
}

fn default_api_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_slot_file_prefix() -> String {
    "penelope".to_string()
}

fn default_n_probs() -> u32 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            slot_id: 0,
            slot_file_prefix: default_slot_file_prefix(),
            request_timeout_secs: None,
            n_probs: default_n_probs(),
        }
    }
}

/// Sampler settings shared by every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f64,
}

fn default_top_p() -> f64 {
    0.9
}

fn default_top_k() -> u32 {
    20
}

fn default_repeat_penalty() -> f64 {
    1.15
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            top_p: default_top_p(),
            top_k: default_top_k(),
            repeat_penalty: default_repeat_penalty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_turn_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_turn_stop")]
    pub stop: Vec<String>,
    /// Apply the glyph-excluding grammar to the speaking stream as well.
    #[serde(default = "default_true")]
    pub constrain_main_generation: bool,
}

fn default_turn_max_tokens() -> u32 {
    8128
}

fn default_turn_stop() -> Vec<String> {
    vec!["<|im_end|>".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_turn_max_tokens(),
            stop: default_turn_stop(),
            constrain_main_generation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_reflection_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_reflection_temperature")]
    pub temperature: f64,
    /// `{assistant}`/`{user}` expand to persona names.
    #[serde(default = "default_reflection_stop")]
    pub stop: Vec<String>,
    /// Sentences of the interrupted response repeated after a reflection.
    #[serde(default = "default_recap_sentences")]
    pub recap_sentences: usize,
    #[serde(default = "default_true")]
    pub include_recap: bool,
}

fn default_reflection_max_tokens() -> u32 {
    256
}

fn default_reflection_temperature() -> f64 {
    0.7
}

fn default_reflection_stop() -> Vec<String> {
    vec![
        "<|im_end|>".to_string(),
        "\n{assistant} says: \n".to_string(),
        "\n{user} says: \n".to_string(),
        "\n\n".to_string(),
    ]
}

fn default_recap_sentences() -> usize {
    2
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_reflection_max_tokens(),
            temperature: default_reflection_temperature(),
            stop: default_reflection_stop(),
            recap_sentences: default_recap_sentences(),
            include_recap: true,
        }
    }
}

/// Names and prompts. `{ponder}`/`{force}` become markers and
/// `{assistant}`/`{user}` become the configured names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_reflection_system_prompt")]
    pub reflection_system_prompt: String,
    /// Opening assistant line of the speaking transcript.
    #[serde(default = "default_seed_greeting")]
    pub seed_greeting: String,
}

fn default_assistant_name() -> String {
    "Penelope".to_string()
}

fn default_user_name() -> String {
    "Human".to_string()
}

fn default_system_prompt() -> String {
    "You are {assistant}, talking out loud with {user}. A thinking engine listens \
     while you speak. When it writes {ponder}, slow down and weigh your next words. \
     When it writes {force}, stop hesitating and say it plainly. Sometimes the engine \
     interrupts you with its own thoughts; take them into account and pick up where \
     you left off. Keep answers short and conversational."
        .to_string()
}

fn default_reflection_system_prompt() -> String {
    "You are the thinking engine behind {assistant}. You read the conversation \
     between {user} and {assistant} and write down {assistant}'s private thoughts \
     about what to say next, step by step. Be brief and concrete. Never speak to \
     {user} directly."
        .to_string()
}

fn default_seed_greeting() -> String {
    "{ponder}{ponder}{ponder}{ponder} Okay, I'll{ponder}{ponder}{ponder} do my best!".to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            user_name: default_user_name(),
            system_prompt: default_system_prompt(),
            reflection_system_prompt: default_reflection_system_prompt(),
            seed_greeting: default_seed_greeting(),
        }
    }
}

impl PersonaConfig {
    pub fn expand_names(&self, source: &str) -> String {
        source
            .replace("{assistant}", &self.assistant_name)
            .replace("{user}", &self.user_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "Dialect::speaking")]
    pub speaking: Dialect,
    #[serde(default = "Dialect::reflecting")]
    pub reflecting: Dialect,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            speaking: Dialect::speaking(),
            reflecting: Dialect::reflecting(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PenelopeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sampling: SamplerConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub ponder: PonderConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub cycle: CycleDetector,
    #[serde(default)]
    pub glyphs: Glyphs,
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl PenelopeConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Config file next to the executable.
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Per-user config file, e.g. `~/.config/penelope/penelope_config.toml`.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("penelope").join(CONFIG_FILE_NAME))
    }

    /// Load from the executable's directory, then the user config directory,
    /// falling back to defaults plus environment variables.
    pub fn load() -> Self {
        let candidates = std::iter::once(Self::config_path()).chain(Self::user_config_path());
        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to load {:?}: {:#}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {:?}", path))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("PENELOPE_LLM_URL") {
            if !url.trim().is_empty() {
                config.engine.api_url = url;
            }
        }

        if let Ok(key) = env::var("PENELOPE_LLM_API_KEY") {
            config.engine.api_key = Some(key);
        }

        if let Ok(slot) = env::var("PENELOPE_SLOT_ID") {
            if let Ok(slot) = slot.parse() {
                config.engine.slot_id = slot;
            }
        }

        if let Ok(timeout) = env::var("PENELOPE_REQUEST_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                config.engine.request_timeout_secs = Some(seconds);
            }
        }

        if let Ok(enabled) = env::var("PENELOPE_SHOW_THOUGHTS") {
            config.delivery.show_thoughts = parse_flag(&enabled);
        }

        if let Ok(name) = env::var("PENELOPE_ASSISTANT_NAME") {
            if !name.trim().is_empty() {
                config.persona.assistant_name = name;
            }
        }

        if let Ok(name) = env::var("PENELOPE_USER_NAME") {
            if !name.trim().is_empty() {
                config.persona.user_name = name;
            }
        }

        config
    }

    pub fn validate(&self) -> PenelopeResult<()> {
        let invalid = |message: &str| Err(PenelopeError::Config(message.to_string()));

        if self.engine.api_url.trim().is_empty() {
            return invalid("engine.api_url must not be empty");
        }
        if self.turn.max_tokens == 0 {
            return invalid("turn.max_tokens must be positive");
        }
        if self.reflection.max_tokens == 0 {
            return invalid("reflection.max_tokens must be positive");
        }
        if !(self.ponder.temperature_step > 0.0) {
            return invalid("ponder.temperature_step must be positive");
        }
        if !(self.ponder.base_temperature >= 0.0) {
            return invalid("ponder.base_temperature must not be negative");
        }
        if !(self.ponder.cooldown_decay > 0.0) {
            return invalid("ponder.cooldown_decay must be positive");
        }
        if self.cycle.min_unit_length == 0 || self.cycle.min_repeats == 0 {
            return invalid("cycle.min_unit_length and cycle.min_repeats must be positive");
        }
        if self.glyphs.ponder == self.glyphs.force {
            return invalid("glyphs.ponder and glyphs.force must differ");
        }
        if self.glyphs.reserved().iter().any(|c| c.is_whitespace()) {
            return invalid("glyphs must not be whitespace");
        }
        if self.persona.assistant_name.trim().is_empty() || self.persona.user_name.trim().is_empty()
        {
            return invalid("persona names must not be empty");
        }
        self.delivery.validate()
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = PenelopeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.turn.max_tokens, 8128);
        assert_eq!(config.reflection.max_tokens, 256);
        assert_eq!(config.reflection.stop.len(), 4);
        assert_eq!(config.glyphs, Glyphs::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
[engine]
api_url = "http://gpu-box:9000"

[ponder]
confidence_floor = 2.5

[cycle]
counting = "tail_runs"
"#,
        )
        .unwrap();

        let config = PenelopeConfig::load_from(&path).unwrap();
        assert_eq!(config.engine.api_url, "http://gpu-box:9000");
        assert_eq!(config.engine.slot_id, 0);
        assert_eq!(config.ponder.confidence_floor, 2.5);
        assert_eq!(config.ponder.base_temperature, 0.7);
        assert_eq!(config.cycle.min_unit_length, 6);
        assert_eq!(config.cycle.counting, crate::cycle::CycleCounting::TailRuns);
        assert_eq!(config.template.speaking, Dialect::speaking());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = PenelopeConfig::default();
        config.persona.assistant_name = "Ada".to_string();
        config.reflection.include_recap = false;
        config.save_to(&path).unwrap();

        let loaded = PenelopeConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn rejects_identical_glyphs() {
        let mut config = PenelopeConfig::default();
        config.glyphs.force = config.glyphs.ponder;
        assert!(matches!(config.validate(), Err(PenelopeError::Config(_))));
    }

    #[test]
    fn rejects_zero_temperature_step() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[ponder]\ntemperature_step = 0.0\n").unwrap();
        assert!(PenelopeConfig::load_from(&path).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[engine\napi_url = ").unwrap();
        assert!(PenelopeConfig::load_from(&path).is_err());
    }

    #[test]
    fn persona_names_expand() {
        let persona = PersonaConfig::default();
        assert_eq!(
            persona.expand_names("{user} asks {assistant}"),
            "Human asks Penelope"
        );
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("YES"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("off"));
    }
}
