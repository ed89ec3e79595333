use eframe::egui;
use egui::{pos2, vec2, Color32, CursorIcon, Rect, Sense, Stroke};

use super::theme::*;
use crate::audio::spectrum::BAR_COUNT;
use crate::state::{Speaker, TranscriptEntry};

/// Ring offset around the mute button for a given input level.
pub fn volume_ring_offset(volume: f32) -> f32 {
    (volume * 200.0).clamp(5.0, 8.0)
}

pub fn connect_toggle(
    ui: &mut egui::Ui,
    connected: bool,
    connecting: bool,
    accent: AccentPalette,
) -> egui::Response {
    let size = 28.0;
    let radius = size / 2.0;
    let (rect, response) = ui.allocate_exact_size(vec2(size, size), Sense::click());

    if ui.is_rect_visible(rect) {
        let center = rect.center();
        let hovered = response.hovered();

        let (fill, ring) = if connected {
            if hovered {
                (accent.hover, accent.base)
            } else {
                (accent.base, accent.ring)
            }
        } else {
            let gray = Color32::from_rgb(0x3a, 0x3d, 0x45);
            let gray_hover = Color32::from_rgb(0x4a, 0x4d, 0x55);
            let idle_ring = Color32::from_rgba_unmultiplied(255, 255, 255, 180);
            if hovered {
                (gray_hover, idle_ring)
            } else {
                (gray, idle_ring)
            }
        };

        ui.painter()
            .circle_stroke(center, radius, Stroke::new(1.5, ring));
        ui.painter().circle_filled(center, radius - 2.5, fill);

        if connecting {
            // Spinner arc while the handshake is in flight.
            let t = ui.input(|i| i.time) as f32;
            let points: Vec<_> = (0..12)
                .map(|i| {
                    let a = t * 4.0 + i as f32 * 0.35;
                    center + vec2(a.cos(), a.sin()) * 6.0
                })
                .collect();
            ui.painter()
                .add(egui::Shape::line(points, Stroke::new(1.6, Color32::WHITE)));
            ui.ctx().request_repaint();
        } else if connected {
            let sq = 7.0;
            let sq_rect = Rect::from_center_size(center, vec2(sq, sq));
            ui.painter().rect_filled(sq_rect, 1.5, Color32::WHITE);
        } else {
            // Play triangle.
            let points = vec![
                center + vec2(-3.0, -5.0),
                center + vec2(-3.0, 5.0),
                center + vec2(5.0, 0.0),
            ];
            ui.painter()
                .add(egui::Shape::convex_polygon(points, Color32::WHITE, Stroke::NONE));
        }
    }

    response.on_hover_cursor(CursorIcon::PointingHand)
}

/// Mic button. The outer ring breathes with `volume` while live.
pub fn mute_toggle(
    ui: &mut egui::Ui,
    muted: bool,
    enabled: bool,
    volume: f32,
    accent: AccentPalette,
) -> egui::Response {
    let size = 40.0;
    let (rect, response) = ui.allocate_exact_size(vec2(size, size), Sense::click());

    if ui.is_rect_visible(rect) {
        let center = rect.center();
        let radius = 12.0;
        let icon = Color32::from_rgb(0xf3, 0xf4, 0xf6);

        if enabled && !muted {
            let offset = volume_ring_offset(volume);
            ui.painter().circle_stroke(
                center,
                radius + offset,
                Stroke::new(2.0, accent.tint_bg.gamma_multiply(0.6)),
            );
        }
        let fill = match (enabled, muted) {
            (false, _) => Color32::from_rgb(0x3a, 0x3d, 0x45),
            (true, true) => RED,
            (true, false) if response.hovered() => accent.hover,
            (true, false) => accent.base,
        };
        ui.painter().circle_filled(center, radius, fill);

        // Mic glyph: capsule, stem, base.
        let capsule = Rect::from_center_size(center + vec2(0.0, -2.0), vec2(5.0, 8.0));
        ui.painter().rect_filled(capsule, 2.0, icon);
        ui.painter().line_segment(
            [center + vec2(0.0, 2.0), center + vec2(0.0, 5.5)],
            Stroke::new(1.4, icon),
        );
        ui.painter().line_segment(
            [center + vec2(-3.0, 6.0), center + vec2(3.0, 6.0)],
            Stroke::new(1.4, icon),
        );
        if muted {
            ui.painter().line_segment(
                [center + vec2(-7.0, -7.0), center + vec2(7.0, 7.0)],
                Stroke::new(1.8, icon),
            );
        }
    }

    response.on_hover_cursor(if enabled {
        CursorIcon::PointingHand
    } else {
        CursorIcon::NotAllowed
    })
}

/// Idle strings with spectrum bars on top while the mic is live, and a pulse
/// whose width tracks the agent's output level.
pub fn draw_visualizer(
    painter: &egui::Painter,
    rect: Rect,
    t: f32,
    spectrum: Option<&[f32; BAR_COUNT]>,
    output_level: f32,
    accent: AccentPalette,
) {
    let lines = 3usize;
    let samples = 64usize;
    let width = rect.width().max(1.0);
    let base_y = rect.center().y;
    let amp_base = 1.8 + output_level * 12.0;

    for line in 0..lines {
        let phase = t * (1.6 + line as f32 * 0.28) + line as f32 * 0.9;
        let amp = amp_base + (t * 1.2 + line as f32).sin() * 0.35;
        let color = Color32::from_rgba_unmultiplied(184, 192, 204, 90 + line as u8 * 20);

        let points: Vec<_> = (0..samples)
            .map(|i| {
                let nx = i as f32 / (samples - 1) as f32;
                let x = rect.min.x + width * nx;
                let envelope = (std::f32::consts::PI * nx).sin().powf(1.15);
                let wave =
                    (nx * std::f32::consts::TAU * (1.2 + line as f32 * 0.25) - phase).sin();
                pos2(x, base_y + wave * amp * envelope)
            })
            .collect();
        painter.add(egui::Shape::line(points, Stroke::new(1.0, color)));
    }

    if let Some(bars) = spectrum {
        let gap = 1.1;
        let overlay_w = rect.width() * 0.94;
        let left = rect.center().x - overlay_w * 0.5;
        let bar_w = ((overlay_w - gap * (BAR_COUNT as f32 - 1.0)) / BAR_COUNT as f32).max(1.0);
        for (i, value) in bars.iter().enumerate() {
            let nx = i as f32 / (BAR_COUNT - 1) as f32;
            let envelope = (std::f32::consts::PI * nx).sin().powf(0.8);
            let v = value.sqrt().max(0.05);
            let h = (v * rect.height() * (0.45 + envelope * 0.55)).max(1.5);
            let x = left + i as f32 * (bar_w + gap);
            painter.rect_filled(
                Rect::from_min_size(pos2(x, rect.center().y - h * 0.5), vec2(bar_w, h)),
                1.0,
                Color32::from_rgba_unmultiplied(accent.base.r(), accent.base.g(), accent.base.b(), 195),
            );
        }
    }
}

pub fn transcript_row(ui: &mut egui::Ui, entry: &TranscriptEntry, accent: AccentPalette) {
    let p = theme_palette(ui.visuals().dark_mode);
    let (who, color) = match entry.speaker {
        Speaker::User => ("You", p.text_muted),
        Speaker::Agent => ("Agent", accent.base),
    };
    ui.horizontal_wrapped(|ui| {
        ui.label(
            egui::RichText::new(entry.received_at.format("%H:%M:%S").to_string())
                .size(10.0)
                .color(p.text_muted),
        );
        ui.label(egui::RichText::new(who).strong().color(color));
        ui.label(egui::RichText::new(&entry.text).color(p.text));
    });
}

/// In-progress caption, rendered apart from committed rows.
pub fn draft_row(ui: &mut egui::Ui, speaker: Speaker, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    let p = theme_palette(ui.visuals().dark_mode);
    let who = match speaker {
        Speaker::User => "You",
        Speaker::Agent => "Agent",
    };
    ui.horizontal_wrapped(|ui| {
        ui.label(egui::RichText::new(format!("{}…", who)).italics().color(p.text_muted));
        ui.label(egui::RichText::new(text).italics().color(p.text_muted));
    });
}

pub fn section_header(ui: &mut egui::Ui, text: &str) {
    let p = theme_palette(ui.visuals().dark_mode);
    ui.add_space(4.0);
    let rect = ui.available_rect_before_wrap();
    ui.painter().line_segment(
        [pos2(rect.min.x, rect.min.y), pos2(rect.max.x, rect.min.y)],
        Stroke::new(0.5, p.btn_border),
    );
    ui.add_space(4.0);
    ui.label(
        egui::RichText::new(text)
            .size(11.0)
            .strong()
            .color(p.text_muted),
    );
}
