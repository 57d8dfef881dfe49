//! Partial geometry used by live edits and transform commits.

use super::{FieldMap, Shape, ShapeKind, normalize_rotation};
use kurbo::Point;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A sparse set of geometry fields.
///
/// Field names match the serialized shape form, so a patch can be committed
/// as a regular field update. Fields that do not apply to a shape's kind
/// (e.g. `radius` on a rectangle) are ignored when applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Point>>,
}

impl GeometryPatch {
    /// A patch that only moves the shape.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// Capture the full geometry of a shape.
    pub fn from_shape(shape: &Shape) -> Self {
        let mut patch = Self {
            x: Some(shape.x),
            y: Some(shape.y),
            rotation: Some(shape.rotation),
            ..Self::default()
        };
        match &shape.kind {
            ShapeKind::Rectangle(r) => {
                patch.width = Some(r.width);
                patch.height = Some(r.height);
            }
            ShapeKind::Circle(c) => patch.radius = Some(c.radius),
            ShapeKind::Line(l) => patch.points = Some(l.points.clone()),
            ShapeKind::Text(t) => patch.width = Some(t.width),
        }
        patch
    }

    pub fn with_rotation(mut self, degrees: f64) -> Self {
        self.rotation = Some(degrees);
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrite fields of `self` with those present in `other`.
    pub fn merge(&mut self, other: &GeometryPatch) {
        if other.x.is_some() {
            self.x = other.x;
        }
        if other.y.is_some() {
            self.y = other.y;
        }
        if other.width.is_some() {
            self.width = other.width;
        }
        if other.height.is_some() {
            self.height = other.height;
        }
        if other.radius.is_some() {
            self.radius = other.radius;
        }
        if other.rotation.is_some() {
            self.rotation = other.rotation;
        }
        if other.points.is_some() {
            self.points.clone_from(&other.points);
        }
    }

    /// Return a copy of `shape` with this geometry applied.
    pub fn apply(&self, shape: &Shape) -> Shape {
        let mut out = shape.clone();
        if let Some(x) = self.x {
            out.x = x;
        }
        if let Some(y) = self.y {
            out.y = y;
        }
        if let Some(rotation) = self.rotation {
            out.rotation = normalize_rotation(rotation);
        }
        match &mut out.kind {
            ShapeKind::Rectangle(r) => {
                if let Some(width) = self.width {
                    r.width = width.max(0.0);
                }
                if let Some(height) = self.height {
                    r.height = height.max(0.0);
                }
            }
            ShapeKind::Circle(c) => {
                if let Some(radius) = self.radius {
                    c.radius = radius.max(0.0);
                }
            }
            ShapeKind::Line(l) => {
                if let Some(points) = &self.points {
                    l.points.clone_from(points);
                }
            }
            ShapeKind::Text(t) => {
                if let Some(width) = self.width {
                    t.width = width.max(0.0);
                }
            }
        }
        out
    }

    /// The patch as a field map, for committing through a regular update.
    pub fn to_fields(&self) -> FieldMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => FieldMap::new(),
        }
    }
}
