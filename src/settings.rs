use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_ms: u32,
    #[serde(default = "default_conversation_silence_ms")]
    pub silence_duration_ms: u32,
    /// Let the backend start its response as soon as it detects end of turn.
    #[serde(default = "default_true")]
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_conversation_silence_ms(),
            create_response: true,
        }
    }
}

/// Persisted, non-secret preferences. API keys never land in this file; they
/// come from the process environment (see `config::SessionConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default = "default_openai_voice")]
    pub openai_voice: String,
    #[serde(default = "default_gemini_voice")]
    pub gemini_voice: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub turn_detection: TurnDetection,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_transcription_prompt")]
    pub transcription_prompt: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_transcription_turn_detection")]
    pub transcription_turn_detection: TurnDetection,
    /// "near_field" or "far_field".
    #[serde(default = "default_noise_reduction")]
    pub noise_reduction: String,
    /// Caption the agent's own voice through a second transcription socket.
    #[serde(default = "default_true")]
    pub dual_captions: bool,
    #[serde(default)]
    pub mic_device: String,
    #[serde(default)]
    pub speaker_device: String,
    /// Endpoint overrides; empty means the vendor default.
    #[serde(default)]
    pub openai_url: String,
    #[serde(default)]
    pub gemini_url: String,
    #[serde(default)]
    pub transcription_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            openai_model: default_openai_model(),
            gemini_model: default_gemini_model(),
            openai_voice: default_openai_voice(),
            gemini_voice: default_gemini_voice(),
            instructions: String::new(),
            turn_detection: TurnDetection::default(),
            transcription_model: default_transcription_model(),
            transcription_prompt: default_transcription_prompt(),
            language: default_language(),
            transcription_turn_detection: default_transcription_turn_detection(),
            noise_reduction: default_noise_reduction(),
            dual_captions: true,
            mic_device: String::new(),
            speaker_device: String::new(),
            openai_url: String::new(),
            gemini_url: String::new(),
            transcription_url: String::new(),
        }
    }
}

fn default_provider() -> String {
    "openai".into()
}
fn default_openai_model() -> String {
    "gpt-4o-realtime-preview-2024-12-17".into()
}
fn default_gemini_model() -> String {
    "models/gemini-2.0-flash-exp".into()
}
fn default_openai_voice() -> String {
    "alloy".into()
}
fn default_gemini_voice() -> String {
    "Puck".into()
}
fn default_transcription_model() -> String {
    "whisper-1".into()
}
fn default_transcription_prompt() -> String {
    "Transcribe my audio as is.".into()
}
fn default_language() -> String {
    "en".into()
}
fn default_noise_reduction() -> String {
    "near_field".into()
}
fn default_vad_threshold() -> f32 {
    0.5
}
fn default_prefix_padding_ms() -> u32 {
    300
}
fn default_conversation_silence_ms() -> u32 {
    200
}
fn default_true() -> bool {
    true
}
fn default_transcription_turn_detection() -> TurnDetection {
    TurnDetection {
        silence_duration_ms: 500,
        create_response: false,
        ..TurnDetection::default()
    }
}

pub fn settings_path() -> AgentResult<PathBuf> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("LiveAgent").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".live-agent").join("settings.json"));
    }
    Err(AgentError::Config("Failed to resolve data directory".into()))
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_from(path: &Path) -> Settings {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Settings::default(),
    };
    match serde_json::from_str(&text) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("[settings] ignoring corrupt {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

pub fn save(settings: &Settings) -> AgentResult<()> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> AgentResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AgentError::Config(format!("Failed to create settings dir: {}", e)))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| AgentError::Config(format!("Failed to serialize settings: {}", e)))?;
    fs::write(path, json)
        .map_err(|e| AgentError::Config(format!("Failed to write settings: {}", e)))?;
    Ok(())
}
