use super::{with_query, ConnectionConfig, MediaChunk, ProviderEvent, RealtimeProvider};
use crate::audio::CAPTURE_SAMPLE_RATE;
use crate::config::SessionConfig;
use crate::error::AgentResult;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

pub struct GeminiProvider;

impl GeminiProvider {
    fn parse_server_content(content: &Value, events: &mut Vec<ProviderEvent>) {
        let parts = content
            .get("modelTurn")
            .and_then(|t| t.get("parts"))
            .and_then(|p| p.as_array());
        for part in parts.into_iter().flatten() {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                events.push(ProviderEvent::TextDelta(text.to_string()));
            }
            if let Some(data) = part
                .get("inlineData")
                .and_then(|d| d.get("data"))
                .and_then(|d| d.as_str())
            {
                match BASE64.decode(data) {
                    Ok(bytes) => events.push(ProviderEvent::Audio(bytes)),
                    Err(e) => events.push(ProviderEvent::Status(format!("bad audio payload: {}", e))),
                }
            }
        }

        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ProviderEvent::Interrupted);
        }
        // Gemini has one end-of-turn marker for both audio and the response.
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ProviderEvent::AudioDone);
            events.push(ProviderEvent::Done);
        }
    }
}

impl RealtimeProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn input_sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }

    fn connection_config(&self, model: &str, config: &SessionConfig) -> AgentResult<ConnectionConfig> {
        let vad = &config.turn_detection;
        let mut setup = json!({
            "model": model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": config.voice } }
                },
            },
            "realtimeInputConfig": {
                "automaticActivityDetection": {
                    "prefixPaddingMs": vad.prefix_padding_ms,
                    "silenceDurationMs": vad.silence_duration_ms,
                }
            },
        });
        if !config.system_instruction.trim().is_empty() {
            setup["systemInstruction"] = json!({ "parts": [{ "text": config.system_instruction }] });
        }

        Ok(ConnectionConfig {
            url: with_query(&config.endpoint, "key", &config.api_key)?,
            headers: Vec::new(),
            init_messages: vec![json!({ "setup": setup })],
            await_setup: true,
        })
    }

    fn parse_event(&self, text: &str) -> Vec<ProviderEvent> {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![ProviderEvent::Status(format!("unparseable frame: {}", e))],
        };

        if event.get("setupComplete").is_some() {
            return vec![ProviderEvent::SetupComplete];
        }

        let mut events = Vec::new();
        if let Some(content) = event.get("serverContent") {
            Self::parse_server_content(content, &mut events);
        }
        if let Some(error) = event.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("Gemini error");
            events.push(ProviderEvent::Error(message.to_string()));
        }
        if event.get("goAway").is_some() {
            events.push(ProviderEvent::Status("server going away".into()));
        }
        if events.is_empty() {
            events.push(ProviderEvent::Ignore);
        }
        events
    }

    fn encode_input(&self, chunk: &MediaChunk) -> Option<Value> {
        Some(json!({
            "realtimeInput": {
                "mediaChunks": [{ "mimeType": chunk.mime_type, "data": chunk.data }]
            }
        }))
    }

    fn commit_message(&self) -> Option<Value> {
        Some(json!({ "clientContent": { "turns": [], "turnComplete": true } }))
    }
}
