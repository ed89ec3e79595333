#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use eframe::egui;
use egui::{vec2, ViewportBuilder};
use live_agent::audio::capture::AudioCapture;
use live_agent::audio::playback::AudioPlayback;
use live_agent::config::SessionConfig;
use live_agent::error::AgentResult;
use live_agent::orchestrator::Orchestrator;
use live_agent::provider::create_provider;
use live_agent::{settings, ui};
use std::sync::Arc;

fn build_orchestrator(config: SessionConfig) -> AgentResult<Orchestrator> {
    let config = Arc::new(config);
    let provider = create_provider(config.provider);
    log::info!(
        "[live-agent] provider={} model={} captions={}",
        provider.name(),
        config.model,
        config.captions_enabled()
    );
    let capture = AudioCapture::new(config.mic_device.clone(), provider.input_sample_rate());
    let playback = AudioPlayback::open(
        config.speaker_device.clone(),
        live_agent::audio::PLAYBACK_SAMPLE_RATE,
    )?;
    Ok(Orchestrator::new(
        config,
        provider,
        Box::new(capture),
        Arc::new(playback),
    ))
}

fn main() {
    env_logger::init();

    let settings = settings::load();
    let runtime = Arc::new(
        tokio::runtime::Runtime::new().expect("Failed to create tokio runtime"),
    );

    let (orchestrator, startup_error) =
        match SessionConfig::from_env(&settings).and_then(build_orchestrator) {
            Ok(o) => (Some(Arc::new(o)), None),
            Err(e) => {
                log::error!("[live-agent] cannot start a session: {}", e);
                (None, Some(e.to_string()))
            }
        };

    let viewport = ViewportBuilder::default()
        .with_title("Live Agent")
        .with_inner_size(vec2(420.0, 560.0))
        .with_min_inner_size(vec2(320.0, 240.0))
        .with_resizable(true);
    let options = eframe::NativeOptions {
        viewport,
        ..Default::default()
    };

    let app_runtime = runtime.clone();
    let app_orchestrator = orchestrator.clone();
    let result = eframe::run_native(
        "Live Agent",
        options,
        Box::new(move |_cc| {
            Ok(Box::new(ui::LiveAgentApp::new(
                app_runtime,
                app_orchestrator,
                startup_error,
                settings,
            )))
        }),
    );
    if let Err(e) = result {
        log::error!("[live-agent] window failed: {}", e);
    }

    // Close sockets and release devices before the runtime goes away.
    if let Some(orchestrator) = orchestrator {
        runtime.block_on(orchestrator.disconnect());
    }
}
