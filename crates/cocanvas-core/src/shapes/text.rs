//! Text shape.

use serde::{Deserialize, Serialize};

/// Font family options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FontFamily {
    #[default]
    SansSerif,
    Serif,
    Monospace,
}

impl FontFamily {
    /// CSS family name.
    pub fn name(&self) -> &'static str {
        match self {
            FontFamily::SansSerif => "sans-serif",
            FontFamily::Serif => "serif",
            FontFamily::Monospace => "monospace",
        }
    }
}

/// Payload of a text shape. Position is the top-left of the text box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Text {
    pub text: String,
    /// Font size in pixels.
    pub font_size: f64,
    #[serde(default)]
    pub font_family: FontFamily,
    /// Wrapping width of the text box.
    pub width: f64,
}

impl Text {
    /// Default font size.
    pub const DEFAULT_FONT_SIZE: f64 = 20.0;
    /// Default wrapping width.
    pub const DEFAULT_WIDTH: f64 = 200.0;
    const LINE_HEIGHT: f64 = 1.2;

    pub fn new(content: impl Into<String>) -> Self {
        Self {
            text: content.into(),
            font_size: Self::DEFAULT_FONT_SIZE,
            font_family: FontFamily::default(),
            width: Self::DEFAULT_WIDTH,
        }
    }

    /// Approximate height from explicit line breaks; wrapping is the renderer's job.
    pub fn height(&self) -> f64 {
        let lines = self.text.lines().count().max(1);
        lines as f64 * self.font_size * Self::LINE_HEIGHT
    }
}
