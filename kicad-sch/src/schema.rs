//! Schematic entities.
//!
//! Every parsed entity keeps the s-expression node it was read from. Typed
//! fields are the source of truth for the engine; the node carries
//! everything else (effects, stroke, unknown children) and is kept in sync
//! by the writer so that untouched entities serialize unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::geometry::{Placement, Position};
use crate::parser::sexp::SExp;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Fresh random identity token.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(ComponentId);
id_type!(WireId);
id_type!(LabelId);
id_type!(
    /// Identity of a text or a text box.
    TextId
);
id_type!(SheetId);
id_type!(SheetPinId);
id_type!(JunctionId);
id_type!(NoConnectId);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// A placed symbol instance.
#[derive(Debug, Clone, Serialize)]
pub struct Component {
    pub id: ComponentId,
    pub reference: String,
    pub lib_id: String,
    pub value: String,
    pub footprint: String,
    pub placement: Placement,
    pub unit: u32,
    /// Every property except Reference, Value and Footprint.
    pub properties: BTreeMap<String, String>,
    /// Pin numbers listed on the instance, with their uuids.
    pub pins: Vec<(String, String)>,
    /// The symbol could not be found in the document or any library.
    pub unresolved: bool,
    #[serde(skip)]
    pub(crate) node: SExp,
}

impl Component {
    pub fn position(&self) -> Position {
        self.placement.position
    }

    /// Value of any field, including Reference, Value and Footprint.
    pub fn property(&self, key: &str) -> Option<&str> {
        match key {
            "Reference" => Some(&self.reference),
            "Value" => Some(&self.value),
            "Footprint" => Some(&self.footprint),
            _ => self.properties.get(key).map(String::as_str),
        }
    }

    /// Power symbols carry a `#` reference such as `#PWR01`.
    pub fn is_power_symbol(&self) -> bool {
        self.reference.starts_with('#') || self.lib_id.starts_with("power:")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Wire {
    pub id: WireId,
    pub start: Position,
    pub end: Position,
    #[serde(skip)]
    pub(crate) node: SExp,
}

impl Wire {
    pub fn length(&self) -> f64 {
        ((self.end.x - self.start.x).powi(2) + (self.end.y - self.start.y).powi(2)).sqrt()
    }

    /// True when `p` lies on the segment strictly between its endpoints.
    pub fn passes_through(&self, p: Position) -> bool {
        if p.coincides(&self.start) || p.coincides(&self.end) {
            return false;
        }
        let (dx, dy) = (self.end.x - self.start.x, self.end.y - self.start.y);
        let len_sq = dx * dx + dy * dy;
        if len_sq == 0.0 {
            return false;
        }
        let cross = (p.x - self.start.x) * dy - (p.y - self.start.y) * dx;
        if cross.abs() / len_sq.sqrt() > 1e-4 {
            return false;
        }
        let t = ((p.x - self.start.x) * dx + (p.y - self.start.y) * dy) / len_sq;
        t > 0.0 && t < 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    Local,
    Global,
    Hierarchical,
}

impl LabelKind {
    pub fn tag(&self) -> &'static str {
        match self {
            LabelKind::Local => "label",
            LabelKind::Global => "global_label",
            LabelKind::Hierarchical => "hierarchical_label",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "label" => Some(LabelKind::Local),
            "global_label" => Some(LabelKind::Global),
            "hierarchical_label" => Some(LabelKind::Hierarchical),
            _ => None,
        }
    }
}

/// Signal direction of hierarchical/global labels and sheet pins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelShape {
    #[default]
    Input,
    Output,
    Bidirectional,
    TriState,
    Passive,
}

impl LabelShape {
    pub fn token(&self) -> &'static str {
        match self {
            LabelShape::Input => "input",
            LabelShape::Output => "output",
            LabelShape::Bidirectional => "bidirectional",
            LabelShape::TriState => "tri_state",
            LabelShape::Passive => "passive",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "input" => Some(LabelShape::Input),
            "output" => Some(LabelShape::Output),
            "bidirectional" => Some(LabelShape::Bidirectional),
            "tri_state" => Some(LabelShape::TriState),
            "passive" => Some(LabelShape::Passive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Label {
    pub id: LabelId,
    pub kind: LabelKind,
    pub text: String,
    pub position: Position,
    /// Text orientation in degrees (0, 90, 180 or 270).
    pub angle: f64,
    pub shape: Option<LabelShape>,
    #[serde(skip)]
    pub(crate) node: SExp,
}

#[derive(Debug, Clone, Serialize)]
pub struct Text {
    pub id: TextId,
    pub text: String,
    pub position: Position,
    pub angle: f64,
    /// Font height in mm.
    pub size: f64,
    #[serde(skip)]
    pub(crate) node: SExp,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextBox {
    pub id: TextId,
    pub text: String,
    pub position: Position,
    pub size: Size,
    #[serde(skip)]
    pub(crate) node: SExp,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sheet {
    pub id: SheetId,
    pub name: String,
    pub file_name: String,
    pub position: Position,
    pub size: Size,
    pub pins: Vec<SheetPin>,
    #[serde(skip)]
    pub(crate) node: SExp,
}

impl Sheet {
    pub fn pin(&self, id: &SheetPinId) -> Option<&SheetPin> {
        self.pins.iter().find(|p| &p.id == id)
    }

    pub fn pin_position(&self, pin: &SheetPin) -> Position {
        self.position.offset(pin.offset.x, pin.offset.y)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetPin {
    pub id: SheetPinId,
    pub name: String,
    pub direction: LabelShape,
    /// Offset from the sheet's top-left corner.
    pub offset: Position,
    pub angle: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Junction {
    pub id: JunctionId,
    pub position: Position,
    #[serde(skip)]
    pub(crate) node: SExp,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoConnect {
    pub id: NoConnectId,
    pub position: Position,
    #[serde(skip)]
    pub(crate) node: SExp,
}

/// A top-level item of the document, in file order.
#[derive(Debug, Clone)]
pub enum Element {
    Component(Component),
    Wire(Wire),
    Label(Label),
    Text(Text),
    TextBox(TextBox),
    Sheet(Sheet),
    Junction(Junction),
    NoConnect(NoConnect),
    /// Embedded symbol definitions (`lib_symbols`).
    LibSymbols(SExp),
    /// Header fields and anything not modelled above, kept verbatim.
    Other(SExp),
}

impl Element {
    pub fn node(&self) -> &SExp {
        match self {
            Element::Component(c) => &c.node,
            Element::Wire(w) => &w.node,
            Element::Label(l) => &l.node,
            Element::Text(t) => &t.node,
            Element::TextBox(t) => &t.node,
            Element::Sheet(s) => &s.node,
            Element::Junction(j) => &j.node,
            Element::NoConnect(n) => &n.node,
            Element::LibSymbols(node) | Element::Other(node) => node,
        }
    }

    pub(crate) fn node_mut(&mut self) -> &mut SExp {
        match self {
            Element::Component(c) => &mut c.node,
            Element::Wire(w) => &mut w.node,
            Element::Label(l) => &mut l.node,
            Element::Text(t) => &mut t.node,
            Element::TextBox(t) => &mut t.node,
            Element::Sheet(s) => &mut s.node,
            Element::Junction(j) => &mut j.node,
            Element::NoConnect(n) => &mut n.node,
            Element::LibSymbols(node) | Element::Other(node) => node,
        }
    }

    /// Identity token of the element, if it has one.
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Element::Component(c) => Some(c.id.as_str()),
            Element::Wire(w) => Some(w.id.as_str()),
            Element::Label(l) => Some(l.id.as_str()),
            Element::Text(t) => Some(t.id.as_str()),
            Element::TextBox(t) => Some(t.id.as_str()),
            Element::Sheet(s) => Some(s.id.as_str()),
            Element::Junction(j) => Some(j.id.as_str()),
            Element::NoConnect(n) => Some(n.id.as_str()),
            Element::LibSymbols(_) | Element::Other(_) => None,
        }
    }
}
