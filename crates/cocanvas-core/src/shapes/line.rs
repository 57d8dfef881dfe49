//! Line shape.

use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};

/// A polyline. Points are relative to the shape position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub points: Vec<Point>,
}

impl Line {
    /// Create a line from its points.
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Create a straight segment from the origin to `end`.
    pub fn segment(end: Point) -> Self {
        Self::new(vec![Point::ZERO, end])
    }

    /// Bounds of the points in local coordinates.
    pub fn bounds(&self) -> Rect {
        let Some(first) = self.points.first() else {
            return Rect::ZERO;
        };
        self.points
            .iter()
            .skip(1)
            .fold(Rect::from_points(*first, *first), |acc, p| acc.union_pt(*p))
    }

    /// Total length of all segments.
    pub fn length(&self) -> f64 {
        self.points.windows(2).map(|w| w[0].distance(w[1])).sum()
    }
}
