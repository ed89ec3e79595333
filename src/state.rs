use crate::audio::spectrum::BAR_COUNT;
use crate::provider::session::ConnectionState;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Arrival order across both speakers. Never reused, even after a clear.
    pub sequence: u64,
    pub received_at: DateTime<Local>,
}

/// Append-only log of committed captions.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
    next_sequence: u64,
}

impl TranscriptLog {
    /// Blank text is not recorded. Returns the assigned sequence number.
    pub fn push(&mut self, speaker: Speaker, text: &str) -> Option<u64> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.entries.push(TranscriptEntry {
            speaker,
            text: text.to_string(),
            sequence,
            received_at: Local::now(),
        });
        Some(sequence)
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Everything the UI renders, shared between the orchestrator's router task
/// and the UI thread.
pub struct AgentState {
    pub connection: Mutex<ConnectionState>,
    pub session_gen: AtomicU64,
    pub muted: AtomicBool,
    /// Agent audio is streaming in for the current response.
    pub speaking: AtomicBool,
    input_level: AtomicU32,
    output_level: AtomicU32,
    /// FFT magnitudes for the visualizer bars (0.0–1.0 range).
    pub spectrum: Mutex<[f32; BAR_COUNT]>,
    pub transcript: Mutex<TranscriptLog>,
    /// In-progress captions, rendered separately from committed entries.
    pub user_draft: Mutex<String>,
    pub agent_draft: Mutex<String>,
    /// Text of the agent response in flight, committed on `done`.
    response_text: Mutex<String>,
    pub last_error: Mutex<Option<String>>,
}

/// Point-in-time copy for rendering.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub connection: ConnectionState,
    pub muted: bool,
    pub speaking: bool,
    pub input_level: f32,
    pub output_level: f32,
    pub spectrum: [f32; BAR_COUNT],
    pub entries: Vec<TranscriptEntry>,
    pub user_draft: String,
    pub agent_draft: String,
    pub last_error: Option<String>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            connection: Mutex::new(ConnectionState::Disconnected),
            session_gen: AtomicU64::new(0),
            muted: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
            input_level: AtomicU32::new(0),
            output_level: AtomicU32::new(0),
            spectrum: Mutex::new([0.0; BAR_COUNT]),
            transcript: Mutex::new(TranscriptLog::default()),
            user_draft: Mutex::new(String::new()),
            agent_draft: Mutex::new(String::new()),
            response_text: Mutex::new(String::new()),
            last_error: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
            .lock()
            .map(|c| *c)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn set_connection(&self, state: ConnectionState) {
        if let Ok(mut c) = self.connection.lock() {
            *c = state;
        }
    }

    /// Atomically move `Disconnected -> Connecting`.
    pub fn begin_connect(&self) -> bool {
        match self.connection.lock() {
            Ok(mut c) if *c == ConnectionState::Disconnected => {
                *c = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.session_gen.load(Ordering::SeqCst) == generation
    }

    pub fn input_level(&self) -> f32 {
        f32::from_bits(self.input_level.load(Ordering::Relaxed))
    }

    pub fn set_input_level(&self, level: f32) {
        self.input_level.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn output_level(&self) -> f32 {
        f32::from_bits(self.output_level.load(Ordering::Relaxed))
    }

    pub fn set_output_level(&self, level: f32) {
        self.output_level.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn set_spectrum(&self, bars: &[f32]) {
        if let Ok(mut spectrum) = self.spectrum.lock() {
            for (slot, value) in spectrum.iter_mut().zip(bars.iter().chain(std::iter::repeat(&0.0))) {
                *slot = *value;
            }
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        if let Ok(mut e) = self.last_error.lock() {
            *e = Some(message.into());
        }
    }

    pub fn commit(&self, speaker: Speaker, text: &str) -> Option<u64> {
        self.transcript.lock().ok()?.push(speaker, text)
    }

    pub fn set_draft(&self, speaker: Speaker, text: &str) {
        let draft = match speaker {
            Speaker::User => &self.user_draft,
            Speaker::Agent => &self.agent_draft,
        };
        if let Ok(mut d) = draft.lock() {
            d.clear();
            d.push_str(text);
        }
    }

    /// Append a response delta; returns the text so far.
    pub fn push_response_text(&self, delta: &str) -> String {
        match self.response_text.lock() {
            Ok(mut text) => {
                text.push_str(delta);
                text.clone()
            }
            Err(_) => delta.to_string(),
        }
    }

    pub fn take_response_text(&self) -> String {
        self.response_text
            .lock()
            .map(|mut text| std::mem::take(&mut *text))
            .unwrap_or_default()
    }

    pub fn clear_transcript(&self) {
        if let Ok(mut log) = self.transcript.lock() {
            log.clear();
        }
        self.take_response_text();
        self.set_draft(Speaker::User, "");
        self.set_draft(Speaker::Agent, "");
    }

    /// Zero the live signals after a session ends. The transcript stays.
    pub fn reset_live(&self) {
        self.muted.store(false, Ordering::SeqCst);
        self.speaking.store(false, Ordering::SeqCst);
        self.set_input_level(0.0);
        self.set_output_level(0.0);
        self.set_spectrum(&[]);
        self.take_response_text();
        self.set_draft(Speaker::Agent, "");
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            connection: self.connection(),
            muted: self.muted.load(Ordering::SeqCst),
            speaking: self.speaking.load(Ordering::SeqCst),
            input_level: self.input_level(),
            output_level: self.output_level(),
            spectrum: self.spectrum.lock().map(|s| *s).unwrap_or([0.0; BAR_COUNT]),
            entries: self
                .transcript
                .lock()
                .map(|t| t.entries().to_vec())
                .unwrap_or_default(),
            user_draft: self.user_draft.lock().map(|d| d.clone()).unwrap_or_default(),
            agent_draft: self.agent_draft.lock().map(|d| d.clone()).unwrap_or_default(),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}
