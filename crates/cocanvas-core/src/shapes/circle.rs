//! Circle shape.

use serde::{Deserialize, Serialize};

/// Payload of a circle. Position is the center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub radius: f64,
}

impl Circle {
    pub fn new(radius: f64) -> Self {
        Self {
            radius: radius.max(0.0),
        }
    }

    /// Create a circle fitting a width/height box (uses the smaller side).
    pub fn from_size(width: f64, height: f64) -> Self {
        Self::new(width.min(height) / 2.0)
    }

    pub fn diameter(&self) -> f64 {
        self.radius * 2.0
    }
}
