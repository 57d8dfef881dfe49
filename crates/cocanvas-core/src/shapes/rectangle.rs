//! Rectangle shape.

use serde::{Deserialize, Serialize};

/// Payload of a rectangle. Position is the top-left corner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    /// Width of the rectangle.
    pub width: f64,
    /// Height of the rectangle.
    pub height: f64,
    /// Corner radius (0 = sharp corners).
    #[serde(default, rename = "cornerRadius")]
    pub corner_radius: f64,
}

impl Rectangle {
    /// Create a new rectangle payload. Negative sizes are clamped to zero.
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: width.max(0.0),
            height: height.max(0.0),
            corner_radius: 0.0,
        }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}
