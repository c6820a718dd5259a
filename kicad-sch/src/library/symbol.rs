//! Symbol definitions parsed from `.kicad_sym` libraries or from a
//! schematic's embedded `lib_symbols` section.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::core::SchematicError;
use crate::geometry::{Position, Rect};
use crate::parser::sexp::{SExp, SExpParser};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectricalType {
    Input,
    Output,
    Bidirectional,
    TriState,
    Passive,
    Free,
    PowerIn,
    PowerOut,
    OpenCollector,
    OpenEmitter,
    NoConnect,
    #[default]
    Unspecified,
}

impl ElectricalType {
    pub fn from_token(token: &str) -> Self {
        match token {
            "input" => ElectricalType::Input,
            "output" => ElectricalType::Output,
            "bidirectional" => ElectricalType::Bidirectional,
            "tri_state" => ElectricalType::TriState,
            "passive" => ElectricalType::Passive,
            "free" => ElectricalType::Free,
            "power_in" => ElectricalType::PowerIn,
            "power_out" => ElectricalType::PowerOut,
            "open_collector" => ElectricalType::OpenCollector,
            "open_emitter" => ElectricalType::OpenEmitter,
            "no_connect" => ElectricalType::NoConnect,
            _ => ElectricalType::Unspecified,
        }
    }
}

impl fmt::Display for ElectricalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectricalType::Input => write!(f, "Input"),
            ElectricalType::Output => write!(f, "Output"),
            ElectricalType::Bidirectional => write!(f, "Bidirectional"),
            ElectricalType::TriState => write!(f, "Tri-State"),
            ElectricalType::Passive => write!(f, "Passive"),
            ElectricalType::Free => write!(f, "Free"),
            ElectricalType::PowerIn => write!(f, "Power Input"),
            ElectricalType::PowerOut => write!(f, "Power Output"),
            ElectricalType::OpenCollector => write!(f, "Open Collector"),
            ElectricalType::OpenEmitter => write!(f, "Open Emitter"),
            ElectricalType::NoConnect => write!(f, "No Connect"),
            ElectricalType::Unspecified => write!(f, "Unspecified"),
        }
    }
}

/// A pin of a symbol definition, in the schematic frame relative to the
/// symbol origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolPin {
    pub number: String,
    pub name: String,
    pub electrical_type: ElectricalType,
    /// Connection point (the pin tip).
    pub position: Position,
    pub length: f64,
    /// Unit vector from the tip towards the symbol body.
    pub body_direction: Position,
    /// 0 means the pin is common to all units.
    pub unit: u32,
    pub hidden: bool,
}

#[derive(Debug, Clone)]
pub struct SymbolDefinition {
    pub lib_id: String,
    pub pins: Vec<SymbolPin>,
    pub properties: BTreeMap<String, String>,
    /// Body graphics and pins, local frame.
    pub outline: Rect,
    pub power: bool,
    pub(crate) raw: SExp,
}

impl SymbolDefinition {
    /// Pins visible on `unit`: the common pins plus that unit's own.
    pub fn pins_for_unit(&self, unit: u32) -> impl Iterator<Item = &SymbolPin> + '_ {
        self.pins
            .iter()
            .filter(move |pin| pin.unit == 0 || pin.unit == unit)
    }

    pub fn pin(&self, number: &str) -> Option<&SymbolPin> {
        self.pins.iter().find(|pin| pin.number == number)
    }

    pub fn unit_count(&self) -> u32 {
        self.pins.iter().map(|pin| pin.unit).max().unwrap_or(0).max(1)
    }

    pub fn reference_prefix(&self) -> &str {
        self.properties
            .get("Reference")
            .map(String::as_str)
            .unwrap_or("U")
    }

    /// Node written into a schematic's `lib_symbols` section.
    pub fn embedded_node(&self) -> SExp {
        let mut node = self.raw.clone();
        node.set_atom(1, &self.lib_id);
        node.reset_layout();
        node
    }

    /// Parse one `(symbol "Name" ...)` node. `lib_id` overrides the name
    /// used as identifier (library files store bare names).
    pub fn from_sexp(node: &SExp, lib_id: &str) -> Result<Self, SchematicError> {
        if node.tag() != Some("symbol") {
            return Err(SchematicError::Parse("expected (symbol ...)".to_string()));
        }

        let mut properties = BTreeMap::new();
        for prop in node.get_all("property") {
            if let (Some(key), Some(value)) = (prop.atom_at(1), prop.atom_at(2)) {
                properties.insert(key.to_string(), value.to_string());
            }
        }

        let mut pins = Vec::new();
        let mut points = Vec::new();
        collect_body(node, 0, &mut pins, &mut points);
        for pin in &pins {
            points.push(pin.position);
            points.push(Position::new(
                pin.position.x + pin.body_direction.x * pin.length,
                pin.position.y + pin.body_direction.y * pin.length,
            ));
        }

        let outline = Rect::enclosing(points).unwrap_or(Rect::point(Position::default()));
        let mut raw = node.clone();
        raw.set_atom(1, lib_id);

        Ok(Self {
            lib_id: lib_id.to_string(),
            pins,
            properties,
            outline,
            power: node.find("power").is_some(),
            raw,
        })
    }
}

/// Walk a symbol node and its unit sub-symbols collecting pins and the
/// points of body graphics. Y is flipped into the schematic frame here.
fn collect_body(node: &SExp, unit: u32, pins: &mut Vec<SymbolPin>, points: &mut Vec<Position>) {
    let Some(items) = node.as_list() else {
        return;
    };
    for item in items.iter().skip(1) {
        match item.tag() {
            Some("symbol") => {
                let name = item.atom_at(1).unwrap_or_default();
                let (unit, style) = unit_and_style(name);
                // Alternate body styles (De Morgan) duplicate pins.
                if style <= 1 {
                    collect_body(item, unit, pins, points);
                }
            }
            Some("pin") => {
                if let Some(pin) = parse_pin(item, unit) {
                    pins.push(pin);
                }
            }
            Some("rectangle") => {
                points.extend(point_of(item, "start"));
                points.extend(point_of(item, "end"));
            }
            Some("polyline") | Some("bezier") => {
                if let Some(pts) = item.find("pts") {
                    for xy in pts.get_all("xy") {
                        if let (Some(x), Some(y)) = (xy.number_at(1), xy.number_at(2)) {
                            points.push(Position::new(x, -y));
                        }
                    }
                }
            }
            Some("arc") => {
                points.extend(point_of(item, "start"));
                points.extend(point_of(item, "mid"));
                points.extend(point_of(item, "end"));
            }
            Some("circle") => {
                if let Some(center) = point_of(item, "center") {
                    let r = item.find("radius").and_then(|r| r.number_at(1)).unwrap_or(0.0);
                    points.push(center.offset(-r, -r));
                    points.push(center.offset(r, r));
                }
            }
            _ => {}
        }
    }
}

fn point_of(node: &SExp, key: &str) -> Option<Position> {
    let child = node.find(key)?;
    Some(Position::new(child.number_at(1)?, -child.number_at(2)?))
}

/// `R_1_1` -> (1, 1); names without the suffix count as unit 0, style 0.
fn unit_and_style(name: &str) -> (u32, u32) {
    let mut parts = name.rsplitn(3, '_');
    let style = parts.next().and_then(|s| s.parse().ok());
    let unit = parts.next().and_then(|s| s.parse().ok());
    match (unit, style) {
        (Some(unit), Some(style)) => (unit, style),
        _ => (0, 0),
    }
}

fn parse_pin(node: &SExp, unit: u32) -> Option<SymbolPin> {
    let electrical_type = ElectricalType::from_token(node.atom_at(1).unwrap_or_default());
    let at = node.find("at")?;
    let (x, y) = (at.number_at(1)?, at.number_at(2)?);
    let angle = at.number_at(3).unwrap_or(0.0);
    let length = node.find("length").and_then(|l| l.number_at(1)).unwrap_or(0.0);
    let hidden = node.has_flag("hide") || node.value_of("hide") == Some("yes");

    let radians = angle.to_radians();
    let body_direction = Position::new(round_unit(radians.cos()), round_unit(-radians.sin()));

    Some(SymbolPin {
        number: node.value_of("number").unwrap_or_default().to_string(),
        name: node.value_of("name").unwrap_or_default().to_string(),
        electrical_type,
        position: Position::new(x, -y),
        length,
        body_direction,
        unit,
        hidden,
    })
}

fn round_unit(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < 1e-9 {
        r + 0.0
    } else {
        v
    }
}

/// Parse a `(kicad_symbol_lib ...)` file. Symbols are identified as
/// `<library>:<name>`; `extends` entries inherit their parent's body.
pub fn parse_library(content: &str, library: &str) -> Result<Vec<SymbolDefinition>, SchematicError> {
    let root = SExpParser::new(content).parse()?;
    if root.tag() != Some("kicad_symbol_lib") {
        return Err(SchematicError::Parse(format!(
            "library {} is not a kicad_symbol_lib",
            library
        )));
    }

    let nodes: Vec<&SExp> = root.get_all("symbol");
    let by_name: HashMap<&str, &SExp> = nodes
        .iter()
        .filter_map(|node| node.atom_at(1).map(|name| (name, *node)))
        .collect();

    let mut symbols = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let Some(name) = node.atom_at(1) else {
            continue;
        };
        let lib_id = format!("{}:{}", library, name);
        let flattened = match node.value_of("extends") {
            Some(parent) => match by_name.get(parent) {
                Some(parent_node) => flatten_extends(parent_node, node, name),
                None => {
                    tracing::warn!("Symbol {} extends unknown parent {}", lib_id, parent);
                    (*node).clone()
                }
            },
            None => (*node).clone(),
        };
        match SymbolDefinition::from_sexp(&flattened, &lib_id) {
            Ok(symbol) => symbols.push(symbol),
            Err(e) => tracing::warn!("Failed to parse symbol {}: {}", lib_id, e),
        }
    }
    Ok(symbols)
}

/// Parent body with the child's name and properties.
fn flatten_extends(parent: &SExp, child: &SExp, name: &str) -> SExp {
    let parent_name = parent.atom_at(1).unwrap_or_default().to_string();
    let mut merged = parent.clone();
    merged.set_atom(1, name);

    let child_props: Vec<SExp> = child.get_all("property").into_iter().cloned().collect();
    let child_keys: Vec<&str> = child_props.iter().filter_map(|p| p.atom_at(1)).collect();
    if let Some(items) = merged.as_list_mut() {
        items.retain(|item| {
            item.tag() != Some("property")
                || !item.atom_at(1).map(|k| child_keys.contains(&k)).unwrap_or(false)
        });
        for item in items.iter_mut() {
            if item.tag() == Some("symbol") {
                let sub = item.atom_at(1).unwrap_or_default().to_string();
                if let Some(suffix) = sub.strip_prefix(parent_name.as_str()) {
                    item.set_atom(1, &format!("{}{}", name, suffix));
                }
            }
        }
    }
    for prop in child_props {
        merged.insert_near(prop, "property", &["symbol"]);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIB: &str = r#"(kicad_symbol_lib (version 20231120)
  (symbol "OPAMP" (property "Reference" "U" (at 0 5 0)) (property "Value" "OPAMP" (at 0 -5 0))
    (symbol "OPAMP_0_1" (polyline (pts (xy -5.08 5.08) (xy 5.08 0) (xy -5.08 -5.08))))
    (symbol "OPAMP_1_1"
      (pin input line (at -7.62 2.54 0) (length 2.54) (name "+") (number "3")))
    (symbol "OPAMP_1_2"
      (pin input line (at -7.62 2.54 0) (length 2.54) (name "+") (number "3")))
    (symbol "OPAMP_2_1"
      (pin power_in line (at 0 7.62 270) (length 2.54) hide (name "V+") (number "8"))))
  (symbol "TL072" (extends "OPAMP") (property "Value" "TL072" (at 0 -5 0)))
)"#;

    #[test]
    fn test_parse_library_units_and_frame() {
        let symbols = parse_library(LIB, "Amp").unwrap();
        assert_eq!(symbols.len(), 2);
        let opamp = &symbols[0];
        assert_eq!(opamp.lib_id, "Amp:OPAMP");
        assert_eq!(opamp.pins.len(), 2, "alternate body style pins are skipped");

        let plus = opamp.pin("3").unwrap();
        assert_eq!(plus.position, Position::new(-7.62, -2.54));
        assert_eq!(plus.body_direction, Position::new(1.0, 0.0));
        assert_eq!(plus.unit, 1);

        let vplus = opamp.pin("8").unwrap();
        assert!(vplus.hidden);
        assert_eq!(vplus.electrical_type, ElectricalType::PowerIn);
        assert_eq!(vplus.body_direction, Position::new(0.0, 1.0));
        assert_eq!(opamp.pins_for_unit(1).count(), 1);
        assert_eq!(opamp.unit_count(), 2);

        assert_eq!(opamp.outline.min, Position::new(-7.62, -7.62));
        assert_eq!(opamp.outline.max, Position::new(5.08, 5.08));
    }

    #[test]
    fn test_extends_inherits_body() {
        let symbols = parse_library(LIB, "Amp").unwrap();
        let tl072 = &symbols[1];
        assert_eq!(tl072.lib_id, "Amp:TL072");
        assert_eq!(tl072.pins.len(), 2);
        assert_eq!(tl072.properties.get("Value").map(String::as_str), Some("TL072"));
        assert_eq!(tl072.properties.get("Reference").map(String::as_str), Some("U"));
    }

    #[test]
    fn test_embedded_node_uses_lib_id() {
        let symbols = parse_library(LIB, "Amp").unwrap();
        let node = symbols[0].embedded_node();
        assert_eq!(node.atom_at(1), Some("Amp:OPAMP"));
    }
}
