pub mod conversation;
pub mod gemini;
pub mod openai;
pub mod session;
pub mod transcription;

use crate::config::{ProviderKind, SessionConfig};
use crate::error::{AgentError, AgentResult};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Events produced by parsing a provider's WebSocket messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Handshake acknowledged; the session may start streaming.
    SetupComplete,
    TextDelta(String),
    /// Decoded PCM16 LE bytes.
    Audio(Vec<u8>),
    AudioDone,
    Done,
    /// The backend abandoned the current response (user barged in).
    Interrupted,
    /// Provider-level error.
    Error(String),
    /// Informational status (logged, not acted upon).
    Status(String),
    /// Message that should be silently ignored.
    Ignore,
}

/// One piece of media queued for the realtime input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

impl MediaChunk {
    pub fn pcm16(sample_rate: u32, data: impl Into<String>) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", sample_rate),
            data: data.into(),
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// Everything needed to establish and configure a provider WebSocket connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Sent in order right after the socket opens, ahead of anything queued.
    pub init_messages: Vec<Value>,
    /// Hold the session in `Connecting` until the dialect sees a setup ack.
    pub await_setup: bool,
}

/// Trait that each conversational backend implements.
pub trait RealtimeProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Rate of the PCM16 audio this backend expects on its input stream.
    fn input_sample_rate(&self) -> u32;
    fn connection_config(&self, model: &str, config: &SessionConfig) -> AgentResult<ConnectionConfig>;
    fn parse_event(&self, text: &str) -> Vec<ProviderEvent>;
    /// `None` when the backend has no wire form for this chunk.
    fn encode_input(&self, chunk: &MediaChunk) -> Option<Value>;
    fn commit_message(&self) -> Option<Value>;
    /// Backends that respond on their own return `None`.
    fn response_message(&self) -> Option<Value> {
        None
    }
}

pub fn create_provider(kind: ProviderKind) -> Arc<dyn RealtimeProvider> {
    match kind {
        ProviderKind::Gemini => Arc::new(gemini::GeminiProvider),
        ProviderKind::OpenAi => Arc::new(openai::OpenAiProvider),
    }
}

/// Append `key=value` to an endpoint URL. A bare host gets the `/` path the
/// websocket request line needs.
pub(crate) fn with_query(endpoint: &str, key: &str, value: &str) -> AgentResult<String> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| AgentError::Config(format!("Invalid endpoint URL {}: {}", loggable_url(endpoint), e)))?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url.into())
}

/// Strip the query string so keys passed as URL parameters never reach logs.
pub(crate) fn loggable_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
