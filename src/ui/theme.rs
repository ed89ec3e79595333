use eframe::egui::Color32;

pub const TEXT_COLOR: Color32 = Color32::from_rgb(0xe6, 0xe6, 0xe6);
pub const TEXT_MUTED: Color32 = Color32::from_rgb(0x9c, 0xa3, 0xaf);
pub const BTN_BG: Color32 = Color32::from_rgb(0x25, 0x28, 0x30);
pub const BTN_BORDER: Color32 = Color32::from_rgb(0x2c, 0x2f, 0x36);
pub const PANEL_BG: Color32 = Color32::from_rgb(0x1c, 0x1f, 0x2a);
pub const RED: Color32 = Color32::from_rgb(0xef, 0x44, 0x44);

pub const PROVIDER_ROWS: &[(&str, &str)] = &[("openai", "OpenAI Realtime"), ("gemini", "Gemini Live")];

#[derive(Clone, Copy)]
pub struct ThemePalette {
    pub text: Color32,
    pub text_muted: Color32,
    pub btn_bg: Color32,
    pub btn_border: Color32,
    pub panel_bg: Color32,
}

#[derive(Clone, Copy)]
pub struct AccentPalette {
    pub base: Color32,
    pub hover: Color32,
    pub ring: Color32,
    pub tint_bg: Color32,
}

pub fn theme_palette(dark: bool) -> ThemePalette {
    if dark {
        ThemePalette {
            text: TEXT_COLOR,
            text_muted: TEXT_MUTED,
            btn_bg: BTN_BG,
            btn_border: BTN_BORDER,
            panel_bg: PANEL_BG,
        }
    } else {
        ThemePalette {
            text: Color32::from_rgb(0x1f, 0x23, 0x2b),
            text_muted: Color32::from_rgb(0x6b, 0x72, 0x80),
            btn_bg: Color32::from_rgb(0xf3, 0xf4, 0xf6),
            btn_border: Color32::from_rgb(0xd1, 0xd5, 0xdb),
            panel_bg: Color32::from_rgb(0xfa, 0xfa, 0xfb),
        }
    }
}

/// Accent per backend so the active provider is recognizable at a glance.
pub fn accent_palette(provider: &str) -> AccentPalette {
    match provider {
        "gemini" => AccentPalette {
            base: Color32::from_rgb(0x5a, 0x8e, 0xc0),
            hover: Color32::from_rgb(0x4a, 0x7a, 0xac),
            ring: Color32::from_rgb(0x3c, 0x68, 0x98),
            tint_bg: Color32::from_rgb(0xb8, 0xd0, 0xe8),
        },
        _ => AccentPalette {
            base: Color32::from_rgb(0x4d, 0xb8, 0x8a),
            hover: Color32::from_rgb(0x3d, 0xa0, 0x7a),
            ring: Color32::from_rgb(0x2d, 0x88, 0x68),
            tint_bg: Color32::from_rgb(0xa8, 0xdc, 0xc4),
        },
    }
}
