//! Session orchestration: owns the devices and sockets for one live agent and
//! routes events between them.
//!
//! Every session gets a generation number. Work that resolves asynchronously
//! checks its generation against the current one before touching shared
//! state; results from an abandoned session are ignored.

use crate::audio::resample::LinearResampler;
use crate::audio::{f32_from_pcm16, pcm16_from_f32, AudioInput, AudioOutput, CaptureEvent};
use crate::config::SessionConfig;
use crate::error::{AgentError, AgentResult};
use crate::events::Subscription;
use crate::provider::conversation::{ConversationClient, ConversationEvent};
use crate::provider::openai::OPENAI_SAMPLE_RATE;
use crate::provider::session::ConnectionState;
use crate::provider::transcription::{TranscriptionClient, TranscriptionEvent};
use crate::provider::{MediaChunk, RealtimeProvider};
use crate::state::{AgentState, Speaker};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub struct Orchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<SessionConfig>,
    state: Arc<AgentState>,
    capture: Arc<Mutex<Box<dyn AudioInput>>>,
    playback: Arc<dyn AudioOutput>,
    conversation: ConversationClient,
    input_rate: u32,
    user_stt: Option<TranscriptionClient>,
    agent_stt: Option<TranscriptionClient>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<SessionConfig>,
        provider: Arc<dyn RealtimeProvider>,
        capture: Box<dyn AudioInput>,
        playback: Arc<dyn AudioOutput>,
    ) -> Self {
        let (user_stt, agent_stt) = if config.captions_enabled() {
            let user = TranscriptionClient::new("stt-user", config.transcription.clone());
            let agent = config
                .dual_captions
                .then(|| TranscriptionClient::new("stt-agent", config.transcription.clone()));
            (Some(user), agent)
        } else {
            log::info!("[session] captions disabled: no transcription key");
            (None, None)
        };

        Self {
            shared: Arc::new(Shared {
                input_rate: provider.input_sample_rate(),
                conversation: ConversationClient::new(provider),
                config,
                state: Arc::new(AgentState::new()),
                capture: Arc::new(Mutex::new(capture)),
                playback,
                user_stt,
                agent_stt,
                router: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> Arc<AgentState> {
        self.shared.state.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn conversation_state(&self) -> ConnectionState {
        self.shared.conversation.state()
    }

    pub fn capture_active(&self) -> bool {
        self.shared
            .capture
            .lock()
            .map(|c| c.is_active())
            .unwrap_or(false)
    }

    pub fn user_transcriber_state(&self) -> Option<ConnectionState> {
        self.shared.user_stt.as_ref().map(|s| s.state())
    }

    pub fn agent_transcriber_state(&self) -> Option<ConnectionState> {
        self.shared.agent_stt.as_ref().map(|s| s.state())
    }

    /// Start capture and open the conversation. Transcribers follow once the
    /// conversation reports open. `Ok(false)` if a session is already active
    /// or this attempt was superseded by `disconnect`.
    pub async fn connect(&self) -> AgentResult<bool> {
        let shared = &self.shared;
        if !shared.state.begin_connect() {
            log::warn!("[session] connect ignored: already {:?}", shared.state.connection());
            return Ok(false);
        }
        let generation = shared.state.session_gen.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut e) = shared.state.last_error.lock() {
            *e = None;
        }
        log::info!(
            "[session] connecting gen={} provider={}",
            generation,
            shared.conversation.provider().name()
        );

        // Subscribe before anything can emit.
        Shared::spawn_router(shared, generation);

        match shared.start_capture(generation).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                if shared.state.is_current(generation) {
                    log::error!("[session] microphone unavailable: {}", e);
                    shared.state.set_error(e.to_string());
                    shared.abandon(generation).await;
                }
                return Err(e);
            }
        }
        // A disconnect that landed while the microphone was starting has
        // already torn down (or will stop) the device.
        if !shared.state.is_current(generation) {
            log::info!("[session] connect gen={} superseded during capture start", generation);
            return Ok(false);
        }

        let result = shared
            .conversation
            .connect(&shared.config.model, &shared.config)
            .await;
        if !shared.state.is_current(generation) {
            log::info!("[session] stale connect gen={} ignored", generation);
            return Ok(false);
        }
        match result {
            Ok(true) => {
                shared.state.set_connection(ConnectionState::Connected);
                log::info!("[session] live gen={}", generation);
                Ok(true)
            }
            Ok(false) => {
                log::warn!("[session] conversation refused connect gen={}", generation);
                shared.abandon(generation).await;
                Ok(false)
            }
            Err(e) => {
                shared.state.set_error(e.to_string());
                shared.abandon(generation).await;
                Err(e)
            }
        }
    }

    /// End the session. Idempotent; returns false when already disconnected.
    pub async fn disconnect(&self) -> bool {
        let shared = &self.shared;
        if shared.state.connection() == ConnectionState::Disconnected {
            return false;
        }
        let generation = shared.state.session_gen.fetch_add(1, Ordering::SeqCst);
        log::info!("[session] disconnect gen={}", generation);
        shared.teardown().await;
        true
    }

    /// Stop the microphone and captions but keep the conversation open.
    pub async fn mute(&self) -> bool {
        let shared = &self.shared;
        if shared.state.connection() != ConnectionState::Connected
            || shared.state.muted.swap(true, Ordering::SeqCst)
        {
            return false;
        }
        log::info!("[session] muted");
        shared.stop_capture().await;
        shared.set_input_idle();
        shared.disconnect_transcribers().await;
        true
    }

    pub async fn unmute(&self) -> AgentResult<bool> {
        let shared = &self.shared;
        if shared.state.connection() != ConnectionState::Connected
            || !shared.state.muted.load(Ordering::SeqCst)
        {
            return Ok(false);
        }
        let generation = shared.state.session_gen.load(Ordering::SeqCst);
        if !shared.start_capture(generation).await? || !shared.state.is_current(generation) {
            return Ok(false);
        }
        shared.state.muted.store(false, Ordering::SeqCst);
        log::info!("[session] unmuted");
        Shared::start_transcribers(shared, generation);
        Ok(true)
    }

    pub async fn toggle_mute(&self) -> AgentResult<bool> {
        if self.shared.state.muted.load(Ordering::SeqCst) {
            self.unmute().await
        } else {
            Ok(self.mute().await)
        }
    }

    /// Explicit user action: empty the caption log and drafts.
    pub fn clear_transcript(&self) {
        self.shared.state.clear_transcript();
        for stt in self.shared.transcribers() {
            stt.clear_transcript();
        }
    }
}

/// Re-rate one base64 PCM16 chunk. Undecodable chunks are dropped.
fn resample_chunk(resampler: &mut LinearResampler, chunk: &str) -> Option<String> {
    let bytes = match BASE64.decode(chunk) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::debug!("[session] caption chunk not base64: {}", e);
            return None;
        }
    };
    let samples = resampler.process(&f32_from_pcm16(&bytes));
    Some(BASE64.encode(pcm16_from_f32(&samples)))
}

/// Receive from an optional subscription; pends forever when absent.
async fn recv_opt<E>(sub: &mut Option<Subscription<E>>) -> Option<E> {
    match sub {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

impl Shared {
    fn transcribers(&self) -> impl Iterator<Item = &TranscriptionClient> {
        self.user_stt.iter().chain(self.agent_stt.iter())
    }

    /// Start the microphone for `generation`. `Ok(false)` when that session
    /// was superseded before the device lock was taken. The check runs under
    /// the lock, so a teardown's stop always lands after a start it raced.
    async fn start_capture(&self, generation: u64) -> AgentResult<bool> {
        let capture = self.capture.clone();
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut capture = capture
                .lock()
                .map_err(|_| AgentError::DeviceUnavailable("capture lock poisoned".into()))?;
            if !state.is_current(generation) {
                return Ok(false);
            }
            capture.start().map(|()| true)
        })
        .await
        .map_err(|e| AgentError::DeviceUnavailable(format!("capture start panicked: {}", e)))?
    }

    /// Device teardown joins the capture thread, so it runs off the runtime.
    async fn stop_capture(&self) {
        let capture = self.capture.clone();
        let stopped = tokio::task::spawn_blocking(move || {
            if let Ok(mut capture) = capture.lock() {
                capture.stop();
            }
        })
        .await;
        if let Err(e) = stopped {
            log::error!("[session] capture stop panicked: {}", e);
        }
    }

    /// Tear down `generation` unless something else already ended it.
    async fn abandon(&self, generation: u64) {
        if self
            .state
            .session_gen
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.teardown().await;
        }
    }

    fn set_input_idle(&self) {
        self.state.set_input_level(0.0);
        self.state.set_spectrum(&[]);
    }

    async fn disconnect_transcribers(&self) {
        for stt in self.transcribers() {
            stt.disconnect().await;
        }
    }

    fn start_transcribers(shared: &Arc<Shared>, generation: u64) {
        for agent_side in [false, true] {
            let shared = shared.clone();
            tokio::spawn(async move {
                let stt = if agent_side {
                    shared.agent_stt.as_ref()
                } else {
                    shared.user_stt.as_ref()
                };
                let Some(stt) = stt else {
                    return;
                };
                let wanted = || {
                    shared.state.is_current(generation) && !shared.state.muted.load(Ordering::SeqCst)
                };
                if !wanted() {
                    return;
                }
                match stt.connect().await {
                    Ok(true) if !wanted() => {
                        stt.disconnect().await;
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("[session] captions unavailable: {}", e),
                }
            });
        }
    }

    /// Stop capture, the conversation, captions and playback, in that order.
    /// Callers bump the generation first so nothing re-arms mid-teardown.
    async fn teardown(&self) {
        if let Some(router) = self.router.lock().ok().and_then(|mut r| r.take()) {
            router.abort();
        }
        self.state.set_connection(ConnectionState::Closing);
        self.stop_capture().await;
        self.conversation.disconnect().await;
        self.disconnect_transcribers().await;
        self.playback.stop();
        self.state.reset_live();
        self.state.set_connection(ConnectionState::Disconnected);
        log::info!("[session] disconnected");
    }

    fn spawn_router(shared: &Arc<Shared>, generation: u64) {
        let router = Router {
            shared: shared.clone(),
            generation,
            caption_resampler: (shared.input_rate != OPENAI_SAMPLE_RATE)
                .then(|| LinearResampler::new(shared.input_rate, OPENAI_SAMPLE_RATE)),
        };
        let capture = shared.capture.lock().ok().map(|c| c.subscribe());
        let conversation = shared.conversation.subscribe();
        let user = shared.user_stt.as_ref().map(|s| s.subscribe());
        let agent = shared.agent_stt.as_ref().map(|s| s.subscribe());
        let output = shared.playback.subscribe_volume();

        let task = tokio::spawn(router.run(capture, conversation, user, agent, output));
        if let Ok(mut slot) = shared.router.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
    }
}

struct Router {
    shared: Arc<Shared>,
    generation: u64,
    /// Caption sockets take 24 kHz `pcm16`; set when the microphone runs at
    /// another rate.
    caption_resampler: Option<LinearResampler>,
}

impl Router {
    async fn run(
        mut self,
        mut capture: Option<Subscription<CaptureEvent>>,
        mut conversation: Subscription<ConversationEvent>,
        mut user: Option<Subscription<TranscriptionEvent>>,
        mut agent: Option<Subscription<TranscriptionEvent>>,
        mut output: Subscription<f32>,
    ) {
        loop {
            tokio::select! {
                event = recv_opt(&mut capture) => match event {
                    Some(event) => self.on_capture(event),
                    None => capture = None,
                },
                event = conversation.recv() => match event {
                    Some(event) => {
                        if !self.on_conversation(event) {
                            break;
                        }
                    }
                    None => break,
                },
                event = recv_opt(&mut user) => match event {
                    Some(event) => self.on_caption(Speaker::User, event),
                    None => user = None,
                },
                event = recv_opt(&mut agent) => match event {
                    Some(event) => self.on_caption(Speaker::Agent, event),
                    None => agent = None,
                },
                Some(level) = output.recv() => self.shared.state.set_output_level(level),
            }
        }
    }

    fn current(&self) -> bool {
        self.shared.state.is_current(self.generation)
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        let shared = &self.shared;
        match event {
            CaptureEvent::Data(chunk) => {
                if shared.state.muted.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(stt) = &shared.user_stt {
                    match self.caption_resampler.as_mut() {
                        Some(resampler) => {
                            if let Some(resampled) = resample_chunk(resampler, &chunk) {
                                stt.append_audio(&resampled);
                            }
                        }
                        None => {
                            stt.append_audio(&chunk);
                        }
                    }
                }
                shared
                    .conversation
                    .send_realtime_input(&[MediaChunk::pcm16(shared.input_rate, chunk)]);
            }
            CaptureEvent::Volume(level) => shared.state.set_input_level(level),
            CaptureEvent::Spectrum(bars) => shared.state.set_spectrum(&bars),
            CaptureEvent::Error(message) => {
                log::error!("[session] capture failed: {}", message);
                shared.state.set_error(message);
                self.end_session();
            }
        }
    }

    /// Returns false once the session is over.
    fn on_conversation(&mut self, event: ConversationEvent) -> bool {
        let shared = &self.shared;
        match event {
            ConversationEvent::Open => {
                log::info!("[session] conversation open; starting captions");
                if !shared.state.muted.load(Ordering::SeqCst) {
                    Shared::start_transcribers(shared, self.generation);
                }
            }
            ConversationEvent::Close => {
                log::info!("[session] conversation closed");
                self.end_session();
                return false;
            }
            ConversationEvent::Error(message) => {
                log::warn!("[session] conversation error: {}", message);
                shared.state.set_error(message);
            }
            ConversationEvent::TextDelta(delta) => {
                let text = shared.state.push_response_text(&delta);
                shared.state.set_draft(Speaker::Agent, &text);
            }
            ConversationEvent::Audio(bytes) => {
                shared.playback.add_pcm16(&bytes);
                shared.state.speaking.store(true, Ordering::SeqCst);
                if let Some(stt) = &shared.agent_stt {
                    stt.append_audio(&BASE64.encode(&bytes));
                }
            }
            ConversationEvent::AudioDone => {
                shared.state.speaking.store(false, Ordering::SeqCst);
                if let Some(stt) = &shared.agent_stt {
                    stt.commit_audio();
                }
            }
            ConversationEvent::Done => {
                let text = shared.state.take_response_text();
                if !text.is_empty() {
                    shared.state.commit(Speaker::Agent, &text);
                    shared.state.set_draft(Speaker::Agent, "");
                }
            }
            ConversationEvent::Interrupted => {
                log::info!("[session] response interrupted; flushing playback");
                shared.playback.stop();
                shared.state.speaking.store(false, Ordering::SeqCst);
                // The level tap goes quiet once playback stops.
                shared.state.set_output_level(shared.playback.volume());
            }
        }
        true
    }

    fn on_caption(&mut self, speaker: Speaker, event: TranscriptionEvent) {
        let shared = &self.shared;
        let stt = match speaker {
            Speaker::User => shared.user_stt.as_ref(),
            Speaker::Agent => shared.agent_stt.as_ref(),
        };
        let Some(stt) = stt else {
            return;
        };
        match event {
            TranscriptionEvent::Delta(_) => shared.state.set_draft(speaker, &stt.transcript()),
            TranscriptionEvent::Completed(text) => {
                if let Some(seq) = shared.state.commit(speaker, &text) {
                    log::debug!("[session] caption #{} committed ({:?})", seq, speaker);
                }
                stt.clear_transcript();
                shared.state.set_draft(speaker, "");
            }
            TranscriptionEvent::Error(message) => {
                log::warn!("[session] captions error ({:?}): {}", speaker, message)
            }
            TranscriptionEvent::Open | TranscriptionEvent::Close => {}
        }
    }

    /// Tear the session down from inside the router. Runs on its own task
    /// since teardown aborts the router.
    fn end_session(&self) {
        if !self.current() {
            return;
        }
        let shared = self.shared.clone();
        let generation = self.generation;
        tokio::spawn(async move { shared.abandon(generation).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Emitter;
    use crate::provider::create_provider;
    use crate::provider::session::testing::{spawn_peer, Peer};
    use crate::settings::Settings;
    use serde_json::Value;
    use std::time::Duration;

    #[derive(Clone)]
    struct FakeMic {
        events: Emitter<CaptureEvent>,
        active: Arc<std::sync::atomic::AtomicBool>,
        deny: bool,
        start_delay: Duration,
    }

    impl FakeMic {
        fn new() -> Self {
            Self {
                events: Emitter::new(),
                active: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                deny: false,
                start_delay: Duration::ZERO,
            }
        }

        fn speak(&self, chunk: &str) {
            self.events.emit(CaptureEvent::Data(chunk.to_string()));
        }
    }

    impl AudioInput for FakeMic {
        fn start(&mut self) -> AgentResult<()> {
            std::thread::sleep(self.start_delay);
            if self.deny {
                return Err(AgentError::PermissionDenied);
            }
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&mut self) {
            self.active.store(false, Ordering::SeqCst);
        }
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
        fn subscribe(&self) -> Subscription<CaptureEvent> {
            self.events.subscribe()
        }
    }

    #[derive(Default)]
    struct FakeSpeaker {
        chunks: Mutex<Vec<Vec<u8>>>,
        stops: std::sync::atomic::AtomicUsize,
        level: std::sync::atomic::AtomicU32,
        levels: Emitter<f32>,
    }

    impl FakeSpeaker {
        fn play_level(&self, level: f32) {
            self.level.store(level.to_bits(), Ordering::SeqCst);
            self.levels.emit(level);
        }
    }

    impl AudioOutput for FakeSpeaker {
        fn add_pcm16(&self, bytes: &[u8]) {
            self.chunks.lock().unwrap().push(bytes.to_vec());
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.level.store(0f32.to_bits(), Ordering::SeqCst);
        }
        fn volume(&self) -> f32 {
            f32::from_bits(self.level.load(Ordering::SeqCst))
        }
        fn subscribe_volume(&self) -> Subscription<f32> {
            self.levels.subscribe()
        }
    }

    fn session_config(conversation_url: &str, stt_url: Option<&str>, dual: bool) -> Arc<SessionConfig> {
        let mut settings = Settings::default();
        settings.openai_url = conversation_url.into();
        settings.transcription_url = stt_url.unwrap_or_default().into();
        settings.dual_captions = dual;
        let with_captions = stt_url.is_some();
        let config = SessionConfig::from_lookup(&settings, |name| match name {
            "OPENAI_API_KEY" => Some("sk-test".into()),
            _ => None,
        })
        .unwrap();
        let mut config = config;
        if !with_captions {
            config.transcription.api_key.clear();
        }
        Arc::new(config)
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition never held: {}", what);
    }

    async fn frame(peer: &mut Peer) -> Value {
        serde_json::from_str(&peer.next_frame().await).unwrap()
    }

    #[tokio::test]
    async fn full_session_scenario() {
        let mut backend = spawn_peer(vec![]).await;
        let mut captions = spawn_peer(vec![]).await;
        let mic = FakeMic::new();
        let speaker = Arc::new(FakeSpeaker::default());
        let orchestrator = Orchestrator::new(
            session_config(&backend.url, Some(&captions.url), false),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(mic.clone()),
            speaker.clone(),
        );
        let state = orchestrator.state();

        assert!(orchestrator.connect().await.unwrap());
        assert!(!orchestrator.connect().await.unwrap());
        assert_eq!(state.connection(), ConnectionState::Connected);
        assert!(mic.is_active());
        assert_eq!(frame(&mut backend).await["type"], "session.update");
        // Captions start only after the conversation opened.
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");

        for i in 0..5 {
            mic.speak(&format!("chunk{}", i));
        }
        for i in 0..5 {
            let sent = frame(&mut backend).await;
            assert_eq!(sent["type"], "input_audio_buffer.append");
            assert_eq!(sent["audio"], format!("chunk{}", i));
            assert_eq!(frame(&mut captions).await["audio"], format!("chunk{}", i));
        }

        backend.say(r#"{"type":"response.audio.delta","delta":"AAE="}"#);
        backend.say(r#"{"type":"response.text.delta","delta":"Hello!"}"#);
        backend.say(r#"{"type":"response.audio.delta","delta":"AgM="}"#);
        backend.say(r#"{"type":"response.audio.done"}"#);
        backend.say(r#"{"type":"response.done"}"#);
        captions.say(r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"Hi"}"#);
        captions.say(r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"Hi"}"#);

        eventually("two entries", || state.snapshot().entries.len() == 2).await;
        assert_eq!(*speaker.chunks.lock().unwrap(), vec![vec![0, 1], vec![2, 3]]);
        let entries = state.snapshot().entries;
        assert!(entries[0].sequence < entries[1].sequence);
        assert!(entries.iter().any(|e| e.speaker == Speaker::Agent && e.text == "Hello!"));
        assert!(entries.iter().any(|e| e.speaker == Speaker::User && e.text == "Hi"));
        assert!(!state.speaking.load(Ordering::SeqCst));
        assert_eq!(state.snapshot().user_draft, "");

        assert!(orchestrator.mute().await);
        assert!(!mic.is_active());
        assert_eq!(orchestrator.user_transcriber_state(), Some(ConnectionState::Disconnected));
        assert_eq!(orchestrator.conversation_state(), ConnectionState::Connected);
        mic.speak("ignored");

        assert!(orchestrator.unmute().await.unwrap());
        assert!(mic.is_active());
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");

        assert!(orchestrator.disconnect().await);
        assert!(!orchestrator.disconnect().await);
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert_eq!(orchestrator.conversation_state(), ConnectionState::Disconnected);
        assert!(!mic.is_active());
        assert!(speaker.stops.load(Ordering::SeqCst) >= 1);
        eventually("captions closed", || {
            orchestrator.user_transcriber_state() == Some(ConnectionState::Disconnected)
        })
        .await;
        // The log survives disconnect.
        assert_eq!(state.snapshot().entries.len(), 2);
    }

    #[tokio::test]
    async fn agent_audio_feeds_agent_captions() {
        let mut backend = spawn_peer(vec![]).await;
        let mut captions = spawn_peer(vec![]).await;
        let speaker = Arc::new(FakeSpeaker::default());
        let orchestrator = Orchestrator::new(
            session_config(&backend.url, Some(&captions.url), true),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(FakeMic::new()),
            speaker.clone(),
        );
        assert!(orchestrator.connect().await.unwrap());
        frame(&mut backend).await;
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");
        eventually("both captions live", || {
            orchestrator.user_transcriber_state() == Some(ConnectionState::Connected)
                && orchestrator.agent_transcriber_state() == Some(ConnectionState::Connected)
        })
        .await;

        backend.say(r#"{"type":"response.audio.delta","delta":"AAE="}"#);
        backend.say(r#"{"type":"response.audio.done"}"#);
        let append = frame(&mut captions).await;
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert_eq!(append["audio"], "AAE=");
        assert_eq!(frame(&mut captions).await["type"], "input_audio_buffer.commit");
        assert_eq!(speaker.chunks.lock().unwrap().len(), 1);
        assert!(orchestrator.disconnect().await);
    }

    #[tokio::test]
    async fn interruption_stops_playback_and_remote_close_ends_session() {
        let mut backend = spawn_peer(vec![]).await;
        let mic = FakeMic::new();
        let speaker = Arc::new(FakeSpeaker::default());
        let orchestrator = Orchestrator::new(
            session_config(&backend.url, None, false),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(mic.clone()),
            speaker.clone(),
        );
        let state = orchestrator.state();
        assert!(orchestrator.connect().await.unwrap());
        assert!(orchestrator.user_transcriber_state().is_none());
        frame(&mut backend).await;

        backend.say(r#"{"type":"response.audio.delta","delta":"AAE="}"#);
        speaker.play_level(0.5);
        eventually("output level mirrored", || state.output_level() == 0.5).await;
        backend.say(r#"{"type":"input_audio_buffer.speech_started"}"#);
        eventually("playback flushed", || speaker.stops.load(Ordering::SeqCst) == 1).await;
        eventually("output level reset", || state.output_level() == 0.0).await;

        backend.close();
        eventually("session ended", || state.connection() == ConnectionState::Disconnected).await;
        assert!(!mic.is_active());
        assert!(!orchestrator.disconnect().await);
    }

    #[tokio::test]
    async fn denied_microphone_aborts_connect() {
        let backend = spawn_peer(vec![]).await;
        let mut mic = FakeMic::new();
        mic.deny = true;
        let orchestrator = Orchestrator::new(
            session_config(&backend.url, None, false),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(mic),
            Arc::new(FakeSpeaker::default()),
        );
        let err = orchestrator.connect().await.unwrap_err();
        assert_eq!(err, AgentError::PermissionDenied);
        let state = orchestrator.state();
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert!(state.snapshot().last_error.is_some());
        assert_eq!(orchestrator.conversation_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_while_connecting_discards_stale_result() {
        let (url, _listener) = crate::provider::session::testing::spawn_silent().await;
        let mic = FakeMic::new();
        let orchestrator = Arc::new(Orchestrator::new(
            session_config(&url, None, false),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(mic.clone()),
            Arc::new(FakeSpeaker::default()),
        ));
        let state = orchestrator.state();

        let pending = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.connect().await })
        };
        eventually("connecting", || {
            orchestrator.conversation_state() == ConnectionState::Connecting
        })
        .await;
        assert!(orchestrator.disconnect().await);
        assert_eq!(pending.await.unwrap(), Ok(false));
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert!(!mic.is_active());
    }

    #[tokio::test]
    async fn clear_transcript_is_explicit() {
        let mut backend = spawn_peer(vec![]).await;
        let orchestrator = Orchestrator::new(
            session_config(&backend.url, None, false),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(FakeMic::new()),
            Arc::new(FakeSpeaker::default()),
        );
        let state = orchestrator.state();
        assert!(orchestrator.connect().await.unwrap());
        frame(&mut backend).await;
        backend.say(r#"{"type":"response.text.delta","delta":"one"}"#);
        backend.say(r#"{"type":"response.done"}"#);
        eventually("entry", || state.snapshot().entries.len() == 1).await;
        let first = state.snapshot().entries[0].sequence;

        orchestrator.clear_transcript();
        assert!(state.snapshot().entries.is_empty());

        // A response in flight is cut at the clear.
        backend.say(r#"{"type":"response.text.delta","delta":"two"}"#);
        eventually("draft", || state.snapshot().agent_draft == "two").await;
        orchestrator.clear_transcript();
        assert_eq!(state.snapshot().agent_draft, "");
        backend.say(r#"{"type":"response.text.delta","delta":"three"}"#);
        backend.say(r#"{"type":"response.done"}"#);
        eventually("entry after clear", || state.snapshot().entries.len() == 1).await;
        let entry = &state.snapshot().entries[0];
        assert_eq!(entry.text, "three");
        assert!(entry.sequence > first);
    }

    #[tokio::test]
    async fn disconnect_during_slow_microphone_start_leaves_no_socket() {
        let mut backend = spawn_peer(vec![]).await;
        let mut mic = FakeMic::new();
        mic.start_delay = Duration::from_millis(300);
        let orchestrator = Arc::new(Orchestrator::new(
            session_config(&backend.url, None, false),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(mic.clone()),
            Arc::new(FakeSpeaker::default()),
        ));
        let state = orchestrator.state();

        let pending = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.connect().await })
        };
        eventually("connecting", || state.connection() == ConnectionState::Connecting).await;
        assert!(orchestrator.disconnect().await);
        assert_eq!(pending.await.unwrap(), Ok(false));
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert_eq!(orchestrator.conversation_state(), ConnectionState::Disconnected);
        assert!(!mic.is_active());

        // The next attempt starts from a clean slate.
        assert!(orchestrator.connect().await.unwrap());
        assert_eq!(state.connection(), ConnectionState::Connected);
        assert_eq!(frame(&mut backend).await["type"], "session.update");
        assert!(orchestrator.disconnect().await);
    }

    #[tokio::test]
    async fn captions_stay_closed_while_muted() {
        let mut backend = spawn_peer(vec![]).await;
        let mut captions = spawn_peer(vec![]).await;
        let orchestrator = Orchestrator::new(
            session_config(&backend.url, Some(&captions.url), false),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(FakeMic::new()),
            Arc::new(FakeSpeaker::default()),
        );
        assert!(orchestrator.connect().await.unwrap());
        frame(&mut backend).await;
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");
        eventually("captions live", || {
            orchestrator.user_transcriber_state() == Some(ConnectionState::Connected)
        })
        .await;

        assert!(orchestrator.mute().await);
        assert_eq!(orchestrator.user_transcriber_state(), Some(ConnectionState::Disconnected));

        // A caption start scheduled before the mute took effect.
        let generation = orchestrator.state().session_gen.load(Ordering::SeqCst);
        Shared::start_transcribers(&orchestrator.shared, generation);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(orchestrator.user_transcriber_state(), Some(ConnectionState::Disconnected));

        assert!(orchestrator.unmute().await.unwrap());
        eventually("captions back", || {
            orchestrator.user_transcriber_state() == Some(ConnectionState::Connected)
        })
        .await;
        assert!(orchestrator.disconnect().await);
    }

    #[tokio::test]
    async fn agent_audio_held_while_muted_is_dropped_on_disconnect() {
        let mut backend = spawn_peer(vec![]).await;
        let mut captions = spawn_peer(vec![]).await;
        let orchestrator = Orchestrator::new(
            session_config(&backend.url, Some(&captions.url), true),
            create_provider(crate::config::ProviderKind::OpenAi),
            Box::new(FakeMic::new()),
            Arc::new(FakeSpeaker::default()),
        );
        assert!(orchestrator.connect().await.unwrap());
        frame(&mut backend).await;
        frame(&mut captions).await;
        frame(&mut captions).await;
        assert!(orchestrator.mute().await);

        backend.say(r#"{"type":"response.audio.delta","delta":"AAE="}"#);
        let agent_stt = orchestrator.shared.agent_stt.as_ref().unwrap();
        eventually("agent audio queued", || agent_stt.queued() == 1).await;
        assert!(orchestrator.disconnect().await);
        assert_eq!(agent_stt.queued(), 0);

        assert!(orchestrator.connect().await.unwrap());
        frame(&mut backend).await;
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");
        // The next frame on the caption sockets is fresh audio, not the stale chunk.
        backend.say(r#"{"type":"response.audio.delta","delta":"AgM="}"#);
        assert_eq!(frame(&mut captions).await["audio"], "AgM=");
        assert!(orchestrator.disconnect().await);
    }

    #[tokio::test]
    async fn sixteen_khz_microphone_is_resampled_for_captions() {
        let mut backend = spawn_peer(vec![r#"{"setupComplete":{}}"#.into()]).await;
        let mut captions = spawn_peer(vec![]).await;
        let mut settings = Settings::default();
        settings.provider = "gemini".into();
        settings.gemini_url = backend.url.clone();
        settings.transcription_url = captions.url.clone();
        let config = SessionConfig::from_lookup(&settings, |name| {
            name.ends_with("_API_KEY").then(|| "key".to_string())
        })
        .unwrap();
        let mic = FakeMic::new();
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            create_provider(crate::config::ProviderKind::Gemini),
            Box::new(mic.clone()),
            Arc::new(FakeSpeaker::default()),
        );
        assert!(orchestrator.connect().await.unwrap());
        assert!(frame(&mut backend).await.get("setup").is_some());
        assert_eq!(frame(&mut captions).await["type"], "transcription_session.update");

        let chunk = BASE64.encode(pcm16_from_f32(&[0.0, 0.25, 0.5, 0.25]));
        mic.speak(&chunk);
        let sent = frame(&mut backend).await;
        let media = &sent["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], chunk.as_str());

        let caption = frame(&mut captions).await;
        let audio = BASE64.decode(caption["audio"].as_str().unwrap()).unwrap();
        // 4 samples at 16 kHz become 5 at 24 kHz with one held for the next chunk.
        assert_eq!(audio.len(), 10);
        assert!(orchestrator.disconnect().await);
    }
}
