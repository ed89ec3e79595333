//! Immutable per-process session configuration.
//!
//! Built once at startup from the persisted [`Settings`] and the process
//! environment, then shared as `Arc<SessionConfig>`. Nothing below the
//! orchestrator reads the environment.

use crate::error::{AgentError, AgentResult};
use crate::settings::{Settings, TurnDetection};
use std::fmt;

pub const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const OPENAI_TRANSCRIPTION_URL: &str = "wss://api.openai.com/v1/realtime?intent=transcription";
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const ENV_PROVIDER: &str = "LIVE_AGENT_PROVIDER";
pub const ENV_OPENAI_KEY: &str = "OPENAI_API_KEY";
pub const ENV_GEMINI_KEY: &str = "GEMINI_API_KEY";
pub const ENV_OPENAI_ORG: &str = "OPENAI_ORG_ID";
pub const ENV_OPENAI_PROJECT: &str = "OPENAI_PROJECT_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

impl ProviderKind {
    pub fn id(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "openai" | "gpt" => Some(ProviderKind::OpenAi),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct TranscriptionConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub prompt: String,
    pub language: String,
    pub turn_detection: TurnDetection,
    pub noise_reduction: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Clone, PartialEq)]
pub struct SessionConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub turn_detection: TurnDetection,
    pub endpoint: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub transcription: TranscriptionConfig,
    pub dual_captions: bool,
    pub mic_device: Option<String>,
    pub speaker_device: Option<String>,
}

impl SessionConfig {
    pub fn from_env(settings: &Settings) -> AgentResult<Self> {
        Self::from_lookup(settings, |name| std::env::var(name).ok())
    }

    /// Same as [`SessionConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(settings: &Settings, lookup: F) -> AgentResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider_id = var(ENV_PROVIDER).unwrap_or_else(|| settings.provider.clone());
        let provider = ProviderKind::parse(&provider_id)
            .ok_or_else(|| AgentError::Config(format!("unknown provider '{}'", provider_id)))?;

        let openai_key = var(ENV_OPENAI_KEY);
        let (api_key, model, voice, endpoint) = match provider {
            ProviderKind::OpenAi => (
                openai_key.clone(),
                settings.openai_model.clone(),
                settings.openai_voice.clone(),
                non_empty_or(&settings.openai_url, OPENAI_REALTIME_URL),
            ),
            ProviderKind::Gemini => (
                var(ENV_GEMINI_KEY),
                settings.gemini_model.clone(),
                settings.gemini_voice.clone(),
                non_empty_or(&settings.gemini_url, GEMINI_LIVE_URL),
            ),
        };
        let api_key = api_key.ok_or_else(|| {
            AgentError::Config(format!("no API key configured for {}", provider.id()))
        })?;

        let org_id = var(ENV_OPENAI_ORG);
        let project_id = var(ENV_OPENAI_PROJECT);

        // Captions always go through the OpenAI transcription endpoint.
        let transcription = TranscriptionConfig {
            api_key: openai_key.unwrap_or_default(),
            endpoint: non_empty_or(&settings.transcription_url, OPENAI_TRANSCRIPTION_URL),
            model: settings.transcription_model.clone(),
            prompt: settings.transcription_prompt.clone(),
            language: settings.language.clone(),
            turn_detection: settings.transcription_turn_detection.clone(),
            noise_reduction: settings.noise_reduction.clone(),
            org_id: org_id.clone(),
            project_id: project_id.clone(),
        };

        Ok(Self {
            provider,
            api_key,
            model,
            voice,
            system_instruction: settings.instructions.clone(),
            turn_detection: settings.turn_detection.clone(),
            endpoint,
            org_id,
            project_id,
            transcription,
            dual_captions: settings.dual_captions,
            mic_device: non_empty(&settings.mic_device),
            speaker_device: non_empty(&settings.speaker_device),
        })
    }

    pub fn captions_enabled(&self) -> bool {
        !self.transcription.api_key.is_empty()
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    non_empty(value).unwrap_or_else(|| fallback.to_string())
}

fn redact(key: &str) -> &'static str {
    if key.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("provider", &self.provider)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("endpoint", &self.endpoint)
            .field("turn_detection", &self.turn_detection)
            .field("transcription", &self.transcription)
            .field("dual_captions", &self.dual_captions)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for TranscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscriptionConfig")
            .field("api_key", &redact(&self.api_key))
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn environment_selects_provider_and_key() {
        let settings = Settings::default();
        let config = SessionConfig::from_lookup(
            &settings,
            env(&[(ENV_PROVIDER, "gemini"), (ENV_GEMINI_KEY, "g-key"), (ENV_OPENAI_KEY, "o-key")]),
        )
        .unwrap();
        assert_eq!(config.provider, ProviderKind::Gemini);
        assert_eq!(config.api_key, "g-key");
        assert_eq!(config.voice, "Puck");
        assert_eq!(config.endpoint, GEMINI_LIVE_URL);
        assert_eq!(config.transcription.api_key, "o-key");
        assert!(config.captions_enabled());
    }

    #[test]
    fn missing_key_for_selected_provider_is_config_error() {
        let settings = Settings::default();
        let err = SessionConfig::from_lookup(&settings, env(&[(ENV_GEMINI_KEY, "g")])).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let settings = Settings::default();
        let err = SessionConfig::from_lookup(&settings, env(&[(ENV_PROVIDER, "acme")])).unwrap_err();
        assert_eq!(err, AgentError::Config("unknown provider 'acme'".into()));
    }

    #[test]
    fn endpoint_overrides_and_redacted_debug() {
        let mut settings = Settings::default();
        settings.openai_url = "ws://127.0.0.1:9000/rt".into();
        settings.mic_device = "  ".into();
        let config =
            SessionConfig::from_lookup(&settings, env(&[(ENV_OPENAI_KEY, "sk-secret")])).unwrap();
        assert_eq!(config.endpoint, "ws://127.0.0.1:9000/rt");
        assert_eq!(config.mic_device, None);
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
