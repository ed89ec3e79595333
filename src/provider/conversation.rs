//! The conversational socket: streams mic audio up and agent audio/text down.

use super::session::{ConnectionState, Dialect, QueuePolicy, SocketSession};
use super::{MediaChunk, ProviderEvent, RealtimeProvider};
use crate::config::SessionConfig;
use crate::error::AgentResult;
use crate::events::Subscription;
use serde_json::Value;
use std::sync::Arc;

/// Normalized events from any conversational backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Open,
    Close,
    Error(String),
    TextDelta(String),
    /// Raw PCM16 LE at 24 kHz.
    Audio(Vec<u8>),
    AudioDone,
    Done,
    Interrupted,
}

struct ProviderDialect {
    provider: Arc<dyn RealtimeProvider>,
}

impl Dialect for ProviderDialect {
    type Event = ConversationEvent;

    fn name(&self) -> &str {
        self.provider.name()
    }

    fn translate(&self, text: &str) -> Vec<ConversationEvent> {
        let mut out = Vec::new();
        for event in self.provider.parse_event(text) {
            match event {
                ProviderEvent::TextDelta(delta) => out.push(ConversationEvent::TextDelta(delta)),
                ProviderEvent::Audio(bytes) => out.push(ConversationEvent::Audio(bytes)),
                ProviderEvent::AudioDone => out.push(ConversationEvent::AudioDone),
                ProviderEvent::Done => out.push(ConversationEvent::Done),
                ProviderEvent::Interrupted => out.push(ConversationEvent::Interrupted),
                ProviderEvent::Error(message) => {
                    log::error!("[{}] error: {}", self.provider.name(), message);
                    out.push(ConversationEvent::Error(message));
                }
                ProviderEvent::Status(status) => {
                    log::debug!("[{}] {}", self.provider.name(), status)
                }
                ProviderEvent::SetupComplete | ProviderEvent::Ignore => {}
            }
        }
        out
    }

    fn is_setup_ack(&self, text: &str) -> bool {
        self.provider
            .parse_event(text)
            .contains(&ProviderEvent::SetupComplete)
    }

    fn opened(&self) -> ConversationEvent {
        ConversationEvent::Open
    }

    fn closed(&self) -> ConversationEvent {
        ConversationEvent::Close
    }

    fn failed(&self, message: String) -> ConversationEvent {
        ConversationEvent::Error(message)
    }
}

pub struct ConversationClient {
    provider: Arc<dyn RealtimeProvider>,
    session: SocketSession<ProviderDialect>,
}

impl ConversationClient {
    pub fn new(provider: Arc<dyn RealtimeProvider>) -> Self {
        let session = SocketSession::new(
            ProviderDialect {
                provider: provider.clone(),
            },
            QueuePolicy::default(),
        );
        Self { provider, session }
    }

    pub fn provider(&self) -> &Arc<dyn RealtimeProvider> {
        &self.provider
    }

    pub fn subscribe(&self) -> Subscription<ConversationEvent> {
        self.session.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Resolves once the backend accepts the session. `Ok(false)` if a
    /// session is already active or the attempt was cancelled.
    pub async fn connect(&self, model: &str, config: &SessionConfig) -> AgentResult<bool> {
        let conn = self.provider.connection_config(model, config)?;
        self.session.connect(conn).await
    }

    pub async fn disconnect(&self) -> bool {
        self.session.disconnect().await
    }

    /// Queued while connecting, dropped when disconnected. Returns false if
    /// any chunk was not accepted.
    pub fn send_realtime_input(&self, chunks: &[MediaChunk]) -> bool {
        let mut accepted = true;
        for chunk in chunks {
            match self.provider.encode_input(chunk) {
                Some(frame) => accepted &= self.session.send(frame.to_string()),
                None => {
                    log::debug!("[{}] no wire form for {}", self.provider.name(), chunk.mime_type);
                    accepted = false;
                }
            }
        }
        accepted
    }

    pub fn commit_audio(&self) -> bool {
        self.send_control(self.provider.commit_message())
    }

    /// False for backends that respond on their own.
    pub fn create_response(&self) -> bool {
        self.send_control(self.provider.response_message())
    }

    fn send_control(&self, message: Option<Value>) -> bool {
        match message {
            Some(frame) => self.session.send_now(frame.to_string()),
            None => false,
        }
    }
}
