//! Placement geometry.
//!
//! Symbol-local coordinates are already in the schematic frame (Y grows
//! downwards); library files are converted when they are loaded. An
//! instance's placement maps a local point by mirroring first, then rotating
//! by a quarter-turn multiple about the symbol origin, then translating by the
//! instance position. Quarter turns only swap and negate coordinates, so the
//! transform is exact and never accumulates drift.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::SchematicError;
use crate::library::SymbolDefinition;

/// Coordinates with four decimals are distinct in KiCad (0.0001 mm).
const GRID_RESOLUTION: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    /// Quantised key used for coordinate-equality tests.
    pub fn key(&self) -> (i64, i64) {
        (
            (self.x * GRID_RESOLUTION).round() as i64,
            (self.y * GRID_RESOLUTION).round() as i64,
        )
    }

    pub fn coincides(&self, other: &Position) -> bool {
        self.key() == other.key()
    }
}

impl From<(f64, f64)> for Position {
    fn from((x, y): (f64, f64)) -> Self {
        Self::new(x, y)
    }
}

impl From<[f64; 2]> for Position {
    fn from([x, y]: [f64; 2]) -> Self {
        Self::new(x, y)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Counter-clockwise quarter-turn rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Accepts any multiple of 90 (negative and >= 360 are normalised).
    pub fn from_degrees(degrees: f64) -> Result<Self, SchematicError> {
        let quarter = degrees / 90.0;
        if (quarter - quarter.round()).abs() > 1e-6 {
            return Err(SchematicError::InvalidArgument(format!(
                "rotation must be a multiple of 90 degrees, got {}",
                degrees
            )));
        }
        Ok(match (quarter.round() as i64).rem_euclid(4) {
            0 => Rotation::Deg0,
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            _ => Rotation::Deg270,
        })
    }

    pub fn degrees(&self) -> f64 {
        match self {
            Rotation::Deg0 => 0.0,
            Rotation::Deg90 => 90.0,
            Rotation::Deg180 => 180.0,
            Rotation::Deg270 => 270.0,
        }
    }

    pub fn compose(&self, other: Rotation) -> Rotation {
        Rotation::from_quarters(self.quarters() + other.quarters())
    }

    pub fn inverse(&self) -> Rotation {
        Rotation::from_quarters(-self.quarters())
    }

    fn quarters(&self) -> i64 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 1,
            Rotation::Deg180 => 2,
            Rotation::Deg270 => 3,
        }
    }

    fn from_quarters(quarters: i64) -> Rotation {
        match quarters.rem_euclid(4) {
            0 => Rotation::Deg0,
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            _ => Rotation::Deg270,
        }
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Rotation::Deg0 => (x, y),
            Rotation::Deg90 => (-y, x),
            Rotation::Deg180 => (-x, -y),
            Rotation::Deg270 => (y, -x),
        }
    }
}

/// Reflection applied before rotation. `X` reflects across the X axis
/// (negates Y), `Y` reflects across the Y axis (negates X), matching the
/// `(mirror x)` / `(mirror y)` tokens of the file format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mirror {
    #[default]
    None,
    X,
    Y,
}

impl Mirror {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "x" => Some(Mirror::X),
            "y" => Some(Mirror::Y),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<&'static str> {
        match self {
            Mirror::None => None,
            Mirror::X => Some("x"),
            Mirror::Y => Some("y"),
        }
    }

    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Mirror::None => (x, y),
            Mirror::X => (x, -y),
            Mirror::Y => (-x, y),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub position: Position,
    pub rotation: Rotation,
    pub mirror: Mirror,
}

impl Placement {
    pub fn new(position: Position, rotation: Rotation, mirror: Mirror) -> Self {
        Self {
            position,
            rotation,
            mirror,
        }
    }

    pub fn at(position: Position) -> Self {
        Self::new(position, Rotation::Deg0, Mirror::None)
    }

    /// Orientation-only part of the transform (no translation).
    pub fn orient(&self, local: Position) -> Position {
        let (mx, my) = self.mirror.apply(local.x, local.y);
        let (rx, ry) = self.rotation.apply(mx, my);
        Position::new(rx, ry)
    }

    pub fn transform(&self, local: Position) -> Position {
        let oriented = self.orient(local);
        Position::new(oriented.x + self.position.x, oriented.y + self.position.y)
    }

    /// Inverse of [`Placement::transform`]: the symbol-frame point that
    /// lands on `world`.
    pub fn local(&self, world: Position) -> Position {
        let (rx, ry) = self
            .rotation
            .inverse()
            .apply(world.x - self.position.x, world.y - self.position.y);
        let (x, y) = self.mirror.apply(rx, ry);
        Position::new(x, y)
    }

    pub fn transform_rect(&self, rect: &Rect) -> Rect {
        let corners = [
            self.transform(rect.min),
            self.transform(Position::new(rect.max.x, rect.min.y)),
            self.transform(rect.max),
            self.transform(Position::new(rect.min.x, rect.max.y)),
        ];
        Rect::enclosing(corners.iter().copied()).unwrap_or(Rect::point(self.position))
    }
}

/// Axis-aligned rectangle with closed boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min: Position,
    pub max: Position,
}

impl Rect {
    /// Builds a rectangle from two corners given in any order.
    pub fn from_corners(a: Position, b: Position) -> Self {
        Self {
            min: Position::new(a.x.min(b.x), a.y.min(b.y)),
            max: Position::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    pub fn point(p: Position) -> Self {
        Self { min: p, max: p }
    }

    pub fn enclosing(points: impl IntoIterator<Item = Position>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Rect::point(first), |rect, p| rect.expanded_to(p)))
    }

    pub fn expanded_to(&self, p: Position) -> Self {
        Self {
            min: Position::new(self.min.x.min(p.x), self.min.y.min(p.y)),
            max: Position::new(self.max.x.max(p.x), self.max.y.max(p.y)),
        }
    }

    pub fn union(&self, other: &Rect) -> Self {
        self.expanded_to(other.min).expanded_to(other.max)
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn contains(&self, p: Position) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Closed-interval intersection test: touching edges intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
    }

    /// Width and height of the shared region, or `None` when disjoint.
    pub fn overlap(&self, other: &Rect) -> Option<(f64, f64)> {
        if !self.intersects(other) {
            return None;
        }
        let w = self.max.x.min(other.max.x) - self.min.x.max(other.min.x);
        let h = self.max.y.min(other.max.y) - self.min.y.max(other.min.y);
        Some((w, h))
    }
}

/// Absolute position of `pin_number` for an instance of `symbol` placed at
/// `placement`, restricted to the pins visible in `unit`.
pub fn pin_position(
    symbol: &SymbolDefinition,
    placement: &Placement,
    unit: u32,
    pin_number: &str,
) -> Result<Position, SchematicError> {
    symbol
        .pins_for_unit(unit)
        .find(|pin| pin.number == pin_number)
        .map(|pin| placement.transform(pin.position))
        .ok_or_else(|| SchematicError::PinNotFound {
            reference: symbol.lib_id.clone(),
            pin: pin_number.to_string(),
        })
}

/// Absolute extents of the symbol body and pins under `placement`.
pub fn bounding_box(symbol: &SymbolDefinition, placement: &Placement) -> Rect {
    placement.transform_rect(&symbol.outline)
}

/// Angle (0/90/180/270) of the direction a pin points away from its body,
/// used to orient labels dropped onto the pin.
pub fn outward_angle(body_direction: Position, placement: &Placement) -> f64 {
    let d = placement.orient(body_direction);
    let (ox, oy) = (-d.x, -d.y);
    if ox.abs() >= oy.abs() {
        if ox >= 0.0 {
            0.0
        } else {
            180.0
        }
    } else if oy < 0.0 {
        90.0
    } else {
        270.0
    }
}
