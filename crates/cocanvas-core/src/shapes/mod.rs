//! Shape definitions for the shared canvas.
//!
//! Every shape carries a common base (id, position, rotation, paint order,
//! style, authorship) and a [`ShapeKind`] payload with the type-specific
//! fields. Serialized form is a flat camelCase object whose `type` field is
//! the discriminant, which is also the field vocabulary used by history diffs
//! and partial updates.

mod circle;
mod geometry;
mod line;
mod rectangle;
mod text;

pub use circle::Circle;
pub use geometry::GeometryPatch;
pub use line::Line;
pub use rectangle::Rectangle;
pub use text::{FontFamily, Text};

use crate::clock::Timestamp;
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for shapes.
pub type ShapeId = Uuid;

/// Identifier of the user owning a lock, live edit or history entry.
pub type UserId = String;

/// A JSON object of shape fields, keyed by their serialized (camelCase) names.
pub type FieldMap = Map<String, Value>;

/// Fields that never change after creation and are skipped by partial updates.
const IMMUTABLE_FIELDS: &[&str] = &["id", "type", "createdBy", "createdAt"];

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }
}

/// Style properties shared by every shape type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeStyle {
    /// Fill color (None = no fill).
    #[serde(default)]
    pub fill: Option<SerializableColor>,
    /// Stroke color.
    pub stroke: SerializableColor,
    /// Stroke width.
    pub stroke_width: f64,
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self {
            fill: None,
            stroke: SerializableColor::black(),
            stroke_width: 2.0,
        }
    }
}

/// Type-specific payload of a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ShapeKind {
    Rectangle(Rectangle),
    Circle(Circle),
    Line(Line),
    Text(Text),
}

impl ShapeKind {
    /// The serialized discriminant.
    pub fn name(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle(_) => "rectangle",
            ShapeKind::Circle(_) => "circle",
            ShapeKind::Line(_) => "line",
            ShapeKind::Text(_) => "text",
        }
    }
}

/// A persisted shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: ShapeId,
    /// Anchor position. Top-left for rectangles and text, center for circles,
    /// origin of the point list for lines.
    pub x: f64,
    pub y: f64,
    /// Rotation in degrees, kept in `[0, 360)`.
    #[serde(default)]
    pub rotation: f64,
    /// Paint order, ascending. Not required to be unique.
    #[serde(default)]
    pub z_index: i64,
    #[serde(flatten)]
    pub style: ShapeStyle,
    #[serde(flatten)]
    pub kind: ShapeKind,
    #[serde(default)]
    pub created_by: UserId,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl Shape {
    /// Create a shape of the given kind with a fresh id.
    pub fn new(x: f64, y: f64, kind: ShapeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            x,
            y,
            rotation: 0.0,
            z_index: 0,
            style: ShapeStyle::default(),
            kind,
            created_by: UserId::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(x, y, ShapeKind::Rectangle(Rectangle::new(width, height)))
    }

    pub fn circle(x: f64, y: f64, radius: f64) -> Self {
        Self::new(x, y, ShapeKind::Circle(Circle::new(radius)))
    }

    pub fn line(x: f64, y: f64, points: Vec<Point>) -> Self {
        Self::new(x, y, ShapeKind::Line(Line::new(points)))
    }

    pub fn text(x: f64, y: f64, content: impl Into<String>) -> Self {
        Self::new(x, y, ShapeKind::Text(Text::new(content)))
    }

    /// Set the paint order.
    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = z_index;
        self
    }

    /// Set the style.
    pub fn with_style(mut self, style: ShapeStyle) -> Self {
        self.style = style;
        self
    }

    /// Set the rotation in degrees (normalized).
    pub fn with_rotation(mut self, degrees: f64) -> Self {
        self.rotation = normalize_rotation(degrees);
        self
    }

    /// The serialized type name.
    pub fn type_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Axis-aligned bounding box, ignoring rotation.
    pub fn bounds(&self) -> Rect {
        match &self.kind {
            ShapeKind::Rectangle(r) => Rect::new(self.x, self.y, self.x + r.width, self.y + r.height),
            ShapeKind::Circle(c) => Rect::new(
                self.x - c.radius,
                self.y - c.radius,
                self.x + c.radius,
                self.y + c.radius,
            ),
            ShapeKind::Line(l) => l.bounds() + self.position().to_vec2(),
            ShapeKind::Text(t) => Rect::new(self.x, self.y, self.x + t.width, self.y + t.height()),
        }
    }

    /// All fields as a JSON object.
    pub fn to_fields(&self) -> FieldMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => FieldMap::new(),
        }
    }

    /// Rebuild a shape from a full field map.
    pub fn from_fields(fields: &FieldMap) -> Result<Self, serde_json::Error> {
        let mut shape: Shape = serde_json::from_value(Value::Object(fields.clone()))?;
        shape.rotation = normalize_rotation(shape.rotation);
        Ok(shape)
    }

    /// Return a copy with the given fields overwritten.
    ///
    /// Immutable fields (`id`, `type`, `createdBy`, `createdAt`) are ignored.
    /// Fields that do not exist on this shape's kind are dropped. A `null`
    /// value resets the field to its default.
    pub fn with_fields(&self, patch: &FieldMap) -> Result<Self, serde_json::Error> {
        let mut fields = self.to_fields();
        for (key, value) in patch {
            if IMMUTABLE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if value.is_null() {
                fields.remove(key);
            } else {
                fields.insert(key.clone(), value.clone());
            }
        }
        Self::from_fields(&fields)
    }
}

/// Normalize a rotation in degrees into `[0, 360)`.
pub fn normalize_rotation(degrees: f64) -> f64 {
    if degrees.is_finite() {
        degrees.rem_euclid(360.0)
    } else {
        0.0
    }
}
