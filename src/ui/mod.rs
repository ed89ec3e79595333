pub mod theme;
pub mod widgets;

use crate::audio;
use crate::orchestrator::Orchestrator;
use crate::provider::session::ConnectionState;
use crate::settings::{self, Settings};
use crate::state::{Speaker, StateSnapshot};
use eframe::egui;
use egui::vec2;
use std::sync::Arc;
use std::time::Duration;

use theme::*;
use widgets::*;

/// Repaint cadence while a session is live; levels change every 50 ms.
const LIVE_REPAINT: Duration = Duration::from_millis(33);
const IDLE_REPAINT: Duration = Duration::from_millis(250);

pub struct LiveAgentApp {
    pub runtime: Arc<tokio::runtime::Runtime>,
    /// Absent when the session could not be configured at startup.
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub startup_error: Option<String>,
    pub settings: Settings,
    pub settings_open: bool,
    pub settings_notice: Option<String>,
    pub mic_devices: Vec<String>,
    pub speaker_devices: Vec<String>,
    pub accent: AccentPalette,
}

impl LiveAgentApp {
    pub fn new(
        runtime: Arc<tokio::runtime::Runtime>,
        orchestrator: Option<Arc<Orchestrator>>,
        startup_error: Option<String>,
        settings: Settings,
    ) -> Self {
        let provider_id = orchestrator
            .as_ref()
            .map(|o| o.config().provider.id().to_string())
            .unwrap_or_else(|| settings.provider.clone());
        Self {
            runtime,
            orchestrator,
            startup_error,
            accent: accent_palette(&provider_id),
            settings,
            settings_open: false,
            settings_notice: None,
            mic_devices: Vec::new(),
            speaker_devices: Vec::new(),
        }
    }

    fn toggle_connection(&self, connection: ConnectionState) {
        let Some(orchestrator) = self.orchestrator.clone() else {
            return;
        };
        match connection {
            ConnectionState::Disconnected => {
                self.runtime.spawn(async move {
                    if let Err(e) = orchestrator.connect().await {
                        log::error!("[ui] connect failed: {}", e);
                    }
                });
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.runtime.spawn(async move {
                    orchestrator.disconnect().await;
                });
            }
            ConnectionState::Closing => {}
        }
    }

    fn toggle_mute(&self) {
        let Some(orchestrator) = self.orchestrator.clone() else {
            return;
        };
        self.runtime.spawn(async move {
            if let Err(e) = orchestrator.toggle_mute().await {
                log::error!("[ui] unmute failed: {}", e);
                orchestrator.state().set_error(e.to_string());
            }
        });
    }

    fn render_controls(&mut self, ui: &mut egui::Ui, snap: &StateSnapshot) {
        let p = theme_palette(ui.visuals().dark_mode);
        let connected = snap.connection == ConnectionState::Connected;
        let connecting = snap.connection == ConnectionState::Connecting;

        ui.horizontal(|ui| {
            let enabled = self.orchestrator.is_some();
            let resp = ui.add_enabled_ui(enabled, |ui| {
                connect_toggle(ui, connected, connecting, self.accent)
            });
            if resp.inner.clicked() {
                self.toggle_connection(snap.connection);
            }

            ui.add_space(8.0);
            if mute_toggle(ui, snap.muted, connected, snap.input_level, self.accent).clicked()
                && connected
            {
                self.toggle_mute();
            }

            ui.add_space(8.0);
            let (status, color) = match snap.connection {
                ConnectionState::Disconnected => ("Disconnected", p.text_muted),
                ConnectionState::Connecting => ("Connecting…", p.text_muted),
                ConnectionState::Connected if snap.muted => ("Muted", RED),
                ConnectionState::Connected if snap.speaking => ("Agent speaking", self.accent.base),
                ConnectionState::Connected => ("Listening", self.accent.base),
                ConnectionState::Closing => ("Closing…", p.text_muted),
            };
            ui.label(egui::RichText::new(status).color(color));

            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                let gear = if self.settings_open { "Close" } else { "Settings" };
                if ui.small_button(gear).clicked() {
                    self.settings_open = !self.settings_open;
                    if self.settings_open {
                        self.mic_devices = audio::list_input_devices();
                        self.speaker_devices = audio::list_output_devices();
                    }
                }
                if ui.small_button("Clear").clicked() {
                    if let Some(o) = &self.orchestrator {
                        o.clear_transcript();
                    }
                }
            });
        });

        let (rect, _) = ui.allocate_exact_size(vec2(ui.available_width(), 36.0), egui::Sense::hover());
        let t = ui.input(|i| i.time) as f32;
        let live_bars = (connected && !snap.muted).then_some(&snap.spectrum);
        draw_visualizer(ui.painter(), rect, t, live_bars, snap.output_level, self.accent);

        if let Some(err) = snap.last_error.as_ref().or(self.startup_error.as_ref()) {
            ui.label(egui::RichText::new(err).size(11.0).color(RED));
        }
    }

    fn render_transcript(&self, ui: &mut egui::Ui, snap: &StateSnapshot) {
        section_header(ui, "Transcript");
        egui::ScrollArea::vertical()
            .auto_shrink([false, false])
            .stick_to_bottom(true)
            .show(ui, |ui| {
                if snap.entries.is_empty()
                    && snap.user_draft.is_empty()
                    && snap.agent_draft.is_empty()
                {
                    let p = theme_palette(ui.visuals().dark_mode);
                    ui.label(egui::RichText::new("Nothing said yet.").color(p.text_muted));
                }
                for entry in &snap.entries {
                    transcript_row(ui, entry, self.accent);
                }
                draft_row(ui, Speaker::User, &snap.user_draft);
                draft_row(ui, Speaker::Agent, &snap.agent_draft);
            });
    }

    fn render_settings(&mut self, ui: &mut egui::Ui) {
        section_header(ui, "Session");
        egui::Grid::new("session_settings")
            .num_columns(2)
            .spacing(vec2(8.0, 4.0))
            .show(ui, |ui| {
                ui.label("Provider");
                egui::ComboBox::from_id_salt("provider")
                    .selected_text(
                        PROVIDER_ROWS
                            .iter()
                            .find(|(id, _)| *id == self.settings.provider)
                            .map(|(_, label)| *label)
                            .unwrap_or("Unknown"),
                    )
                    .show_ui(ui, |ui| {
                        for (id, label) in PROVIDER_ROWS {
                            ui.selectable_value(&mut self.settings.provider, id.to_string(), *label);
                        }
                    });
                ui.end_row();

                let voice = if self.settings.provider == "gemini" {
                    &mut self.settings.gemini_voice
                } else {
                    &mut self.settings.openai_voice
                };
                ui.label("Voice");
                ui.text_edit_singleline(voice);
                ui.end_row();

                ui.label("Microphone");
                device_combo(ui, "mic", &mut self.settings.mic_device, &self.mic_devices);
                ui.end_row();

                ui.label("Speaker");
                device_combo(ui, "speaker", &mut self.settings.speaker_device, &self.speaker_devices);
                ui.end_row();

                ui.label("Agent captions");
                ui.checkbox(&mut self.settings.dual_captions, "Transcribe agent voice");
                ui.end_row();
            });

        ui.label("Instructions");
        ui.add(
            egui::TextEdit::multiline(&mut self.settings.instructions)
                .desired_rows(3)
                .desired_width(f32::INFINITY),
        );

        ui.horizontal(|ui| {
            if ui.button("Save").clicked() {
                self.settings_notice = Some(match settings::save(&self.settings) {
                    Ok(()) => "Saved. Changes apply on next launch.".into(),
                    Err(e) => {
                        log::error!("[ui] {}", e);
                        e.to_string()
                    }
                });
            }
            if let Some(notice) = &self.settings_notice {
                let p = theme_palette(ui.visuals().dark_mode);
                ui.label(egui::RichText::new(notice).size(11.0).color(p.text_muted));
            }
        });
    }
}

fn device_combo(ui: &mut egui::Ui, id: &str, selected: &mut String, devices: &[String]) {
    let shown = if selected.is_empty() {
        "System default".to_string()
    } else {
        selected.clone()
    };
    egui::ComboBox::from_id_salt(id)
        .selected_text(shown)
        .show_ui(ui, |ui| {
            ui.selectable_value(selected, String::new(), "System default");
            for name in devices {
                ui.selectable_value(selected, name.clone(), name);
            }
        });
}

impl eframe::App for LiveAgentApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let snap = match &self.orchestrator {
            Some(o) => o.state().snapshot(),
            None => crate::state::AgentState::new().snapshot(),
        };

        let p = theme_palette(ctx.style().visuals.dark_mode);
        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(p.panel_bg).inner_margin(12.0))
            .show(ctx, |ui| {
                self.render_controls(ui, &snap);
                if self.settings_open {
                    self.render_settings(ui);
                }
                self.render_transcript(ui, &snap);
            });

        let live = snap.connection != ConnectionState::Disconnected;
        ctx.request_repaint_after(if live { LIVE_REPAINT } else { IDLE_REPAINT });
    }
}
