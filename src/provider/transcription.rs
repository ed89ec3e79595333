//! Speech-to-text socket used for captions.
//!
//! One client per direction: the orchestrator runs one on the microphone and,
//! with dual captions on, a second one on the agent's synthesized voice.

use super::openai::{auth_headers, error_message};
use super::session::{ConnectionState, Dialect, QueuePolicy, SocketSession};
use super::ConnectionConfig;
use crate::config::TranscriptionConfig;
use crate::error::AgentResult;
use crate::events::Subscription;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

/// Roughly a minute of 85 ms chunks.
pub const QUEUE_CAPACITY: usize = 750;

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    Open,
    Close,
    Error(String),
    Delta(String),
    /// Backend closed a segment; carries the full segment text.
    Completed(String),
}

struct TranscriptionDialect {
    label: String,
    transcript: Arc<Mutex<String>>,
}

impl Dialect for TranscriptionDialect {
    type Event = TranscriptionEvent;

    fn name(&self) -> &str {
        &self.label
    }

    fn translate(&self, text: &str) -> Vec<TranscriptionEvent> {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[{}] dropping unparseable frame: {}", self.label, e);
                return Vec::new();
            }
        };
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "conversation.item.input_audio_transcription.delta" => {
                let Some(delta) = event.get("delta").and_then(|d| d.as_str()) else {
                    return Vec::new();
                };
                if let Ok(mut transcript) = self.transcript.lock() {
                    transcript.push_str(delta);
                }
                vec![TranscriptionEvent::Delta(delta.to_string())]
            }
            "conversation.item.input_audio_transcription.completed" => {
                let transcript = event
                    .get("transcript")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .trim();
                if transcript.is_empty() {
                    return Vec::new();
                }
                log::info!("[{}] transcript final: \"{}\"", self.label, transcript);
                vec![TranscriptionEvent::Completed(transcript.to_string())]
            }
            "error" => {
                let code = event
                    .get("error")
                    .and_then(|e| e.get("code"))
                    .and_then(|c| c.as_str())
                    .unwrap_or("");
                if code == "input_audio_buffer_commit_empty" {
                    return Vec::new();
                }
                let message = error_message(&event);
                log::error!("[{}] error: {}", self.label, message);
                vec![TranscriptionEvent::Error(message)]
            }
            other => {
                log::debug!("[{}] {}", self.label, other);
                Vec::new()
            }
        }
    }

    fn opened(&self) -> TranscriptionEvent {
        TranscriptionEvent::Open
    }

    fn closed(&self) -> TranscriptionEvent {
        TranscriptionEvent::Close
    }

    fn failed(&self, message: String) -> TranscriptionEvent {
        TranscriptionEvent::Error(message)
    }
}

pub struct TranscriptionClient {
    label: String,
    config: TranscriptionConfig,
    transcript: Arc<Mutex<String>>,
    session: SocketSession<TranscriptionDialect>,
}

impl TranscriptionClient {
    /// `label` tags log lines, e.g. "stt-user".
    pub fn new(label: &str, config: TranscriptionConfig) -> Self {
        let transcript = Arc::new(Mutex::new(String::new()));
        let session = SocketSession::new(
            TranscriptionDialect {
                label: label.to_string(),
                transcript: transcript.clone(),
            },
            QueuePolicy {
                capacity: QUEUE_CAPACITY,
                while_idle: true,
            },
        );
        Self {
            label: label.to_string(),
            config,
            transcript,
            session,
        }
    }

    pub fn subscribe(&self) -> Subscription<TranscriptionEvent> {
        self.session.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn queued(&self) -> usize {
        self.session.pending_len()
    }

    pub async fn connect(&self) -> AgentResult<bool> {
        self.session.connect(self.connection_config()).await
    }

    /// Close the socket and drop audio still held for it, so a later
    /// session never replays frames from this one.
    pub async fn disconnect(&self) -> bool {
        let closed = self.session.disconnect().await;
        let dropped = self.session.clear_pending();
        if dropped > 0 {
            log::debug!("[{}] discarded {} queued frames", self.label, dropped);
        }
        closed
    }

    /// Sends when connected, otherwise holds the chunk for the next open.
    pub fn append_audio(&self, base64_chunk: &str) -> bool {
        let frame = json!({ "type": "input_audio_buffer.append", "audio": base64_chunk });
        self.session.send(frame.to_string())
    }

    pub fn commit_audio(&self) -> bool {
        self.session
            .send_now(json!({ "type": "input_audio_buffer.commit" }).to_string())
    }

    pub fn create_response(&self) -> bool {
        self.session
            .send_now(json!({ "type": "response.create" }).to_string())
    }

    /// Concatenated deltas since the last clear.
    pub fn transcript(&self) -> String {
        self.transcript
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn clear_transcript(&self) {
        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.clear();
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        let config = &self.config;
        let vad = &config.turn_detection;
        let session = json!({
            "input_audio_format": "pcm16",
            "input_audio_transcription": {
                "model": config.model,
                "prompt": config.prompt,
                "language": config.language,
            },
            "turn_detection": {
                "type": "server_vad",
                "threshold": vad.threshold,
                "prefix_padding_ms": vad.prefix_padding_ms,
                "silence_duration_ms": vad.silence_duration_ms,
            },
            "input_audio_noise_reduction": { "type": config.noise_reduction },
        });

        ConnectionConfig {
            url: config.endpoint.clone(),
            headers: auth_headers(
                &config.api_key,
                config.org_id.as_deref(),
                config.project_id.as_deref(),
            ),
            init_messages: vec![json!({ "type": "transcription_session.update", "session": session })],
            await_setup: false,
        }
    }
}
