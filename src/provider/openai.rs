use super::{with_query, ConnectionConfig, MediaChunk, ProviderEvent, RealtimeProvider};
use crate::config::SessionConfig;
use crate::error::AgentResult;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

/// OpenAI's `pcm16` format is fixed at 24 kHz mono.
pub const OPENAI_SAMPLE_RATE: u32 = 24_000;

pub struct OpenAiProvider;

/// Headers shared by every OpenAI realtime socket.
pub(crate) fn auth_headers(
    api_key: &str,
    org_id: Option<&str>,
    project_id: Option<&str>,
) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Authorization".into(), format!("Bearer {}", api_key)),
        ("OpenAI-Beta".into(), "realtime=v1".into()),
    ];
    if let Some(org) = org_id {
        headers.push(("OpenAI-Organization".into(), org.to_string()));
    }
    if let Some(project) = project_id {
        headers.push(("OpenAI-Project".into(), project.to_string()));
    }
    headers
}

/// Pull `error.message` out of an OpenAI error frame.
pub(crate) fn error_message(event: &Value) -> String {
    event
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .or_else(|| event.get("message").and_then(|m| m.as_str()))
        .unwrap_or("OpenAI error")
        .to_string()
}

impl RealtimeProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn input_sample_rate(&self) -> u32 {
        OPENAI_SAMPLE_RATE
    }

    fn connection_config(&self, model: &str, config: &SessionConfig) -> AgentResult<ConnectionConfig> {
        let vad = &config.turn_detection;
        let mut session = json!({
            "modalities": ["text", "audio"],
            "voice": config.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "turn_detection": {
                "type": "server_vad",
                "threshold": vad.threshold,
                "prefix_padding_ms": vad.prefix_padding_ms,
                "silence_duration_ms": vad.silence_duration_ms,
                "create_response": vad.create_response,
            },
        });
        if !config.system_instruction.trim().is_empty() {
            session["instructions"] = Value::String(config.system_instruction.clone());
        }

        Ok(ConnectionConfig {
            url: with_query(&config.endpoint, "model", model)?,
            headers: auth_headers(
                &config.api_key,
                config.org_id.as_deref(),
                config.project_id.as_deref(),
            ),
            init_messages: vec![json!({ "type": "session.update", "session": session })],
            await_setup: false,
        })
    }

    fn parse_event(&self, text: &str) -> Vec<ProviderEvent> {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![ProviderEvent::Status(format!("unparseable frame: {}", e))],
        };

        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "response.text.delta" => match event.get("delta").and_then(|d| d.as_str()) {
                Some(delta) => vec![ProviderEvent::TextDelta(delta.to_string())],
                None => vec![ProviderEvent::Ignore],
            },
            "response.audio.delta" => {
                let Some(delta) = event.get("delta").and_then(|d| d.as_str()) else {
                    return vec![ProviderEvent::Ignore];
                };
                match BASE64.decode(delta) {
                    Ok(bytes) => vec![ProviderEvent::Audio(bytes)],
                    Err(e) => vec![ProviderEvent::Status(format!("bad audio payload: {}", e))],
                }
            }
            "response.audio.done" => vec![ProviderEvent::AudioDone],
            "response.done" => vec![ProviderEvent::Done],
            // Server VAD heard the user start talking over the response.
            "input_audio_buffer.speech_started" => vec![ProviderEvent::Interrupted],
            "error" => vec![ProviderEvent::Error(error_message(&event))],
            "" => vec![ProviderEvent::Status(format!("event missing type: {}", event))],
            _ => vec![ProviderEvent::Status(event_type.to_string())],
        }
    }

    fn encode_input(&self, chunk: &MediaChunk) -> Option<Value> {
        if !chunk.is_audio() {
            return None;
        }
        Some(json!({ "type": "input_audio_buffer.append", "audio": chunk.data }))
    }

    fn commit_message(&self) -> Option<Value> {
        Some(json!({ "type": "input_audio_buffer.commit" }))
    }

    fn response_message(&self) -> Option<Value> {
        Some(json!({ "type": "response.create" }))
    }
}
