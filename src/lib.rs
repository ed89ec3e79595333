//! Real-time voice agent: streams microphone audio to a realtime speech
//! backend, plays the synthesized reply and keeps a live caption log.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod provider;
pub mod settings;
pub mod state;
pub mod ui;
