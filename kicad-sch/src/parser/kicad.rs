//! KiCAD Schematic Parser
//!
//! Reads `.kicad_sch` files (KiCad 6 to 8 S-expression format) into typed
//! elements without losing anything: every element keeps its source node,
//! and elements the engine does not model stay as opaque nodes in file
//! order.
//!
//! Format details:
//! - All values are in millimeters, at most 4 decimals
//! - Properties: (property "KEY" "VALUE" (at X Y ANGLE) ...)
//! - Position: (at X Y [ANGLE])
//! - Points: (pts (xy X Y) ...)
//! - UUID: (uuid "...")

use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::SchematicError;
use crate::geometry::{Mirror, Placement, Position, Rotation};
use crate::parser::sexp::{ParseError, SExp, SExpParser};
use crate::schema::*;

#[derive(Debug, Error)]
pub enum KicadParseError {
    #[error("S-expression parse error: {0}")]
    SExpParse(#[from] ParseError),
    #[error("Invalid schematic format: {0}")]
    InvalidFormat(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl From<KicadParseError> for SchematicError {
    fn from(e: KicadParseError) -> Self {
        SchematicError::Parse(e.to_string())
    }
}

/// Result of reading a file: the root list shell (tag plus trivia), the
/// top-level elements in order and the text after the root.
#[derive(Debug, Clone)]
pub struct ParsedSchematic {
    pub shell: SExp,
    pub elements: Vec<Element>,
    pub trailing: String,
}

pub struct KicadParser;

impl KicadParser {
    pub fn parse_schematic_str(content: &str) -> Result<ParsedSchematic, KicadParseError> {
        let document = SExpParser::new(content).parse_document()?;
        let mut root = document.root;

        match root.tag() {
            Some("kicad_sch") => {}
            Some(other) => {
                return Err(KicadParseError::InvalidFormat(format!(
                    "Expected kicad_sch, found {}",
                    other
                )))
            }
            None => {
                return Err(KicadParseError::InvalidFormat(
                    "Expected kicad_sch root".to_string(),
                ))
            }
        }

        let items = root
            .as_list_mut()
            .map(|items| items.split_off(1))
            .unwrap_or_default();

        let mut elements = Vec::with_capacity(items.len());
        for item in items {
            elements.push(Self::parse_element(item));
        }

        Ok(ParsedSchematic {
            shell: root,
            elements,
            trailing: document.trailing,
        })
    }

    /// Typed element for known tags; anything else (or anything malformed)
    /// is kept opaque.
    fn parse_element(node: SExp) -> Element {
        let tag = node.tag().unwrap_or_default().to_string();
        let parsed = match tag.as_str() {
            "symbol" => Self::parse_symbol(&node).map(|mut c| {
                c.node = node.clone();
                Element::Component(c)
            }),
            "wire" => Self::parse_wire(&node).map(|mut w| {
                w.node = node.clone();
                Element::Wire(w)
            }),
            "label" | "global_label" | "hierarchical_label" => {
                Self::parse_label(&node).map(|mut l| {
                    l.node = node.clone();
                    Element::Label(l)
                })
            }
            "text" => Self::parse_text(&node).map(|mut t| {
                t.node = node.clone();
                Element::Text(t)
            }),
            "text_box" => Self::parse_text_box(&node).map(|mut t| {
                t.node = node.clone();
                Element::TextBox(t)
            }),
            "sheet" => Self::parse_sheet(&node).map(|mut s| {
                s.node = node.clone();
                Element::Sheet(s)
            }),
            "junction" => Self::parse_marker(&node).map(|(id, position)| {
                Element::Junction(Junction {
                    id: JunctionId(id),
                    position,
                    node: node.clone(),
                })
            }),
            "no_connect" => Self::parse_marker(&node).map(|(id, position)| {
                Element::NoConnect(NoConnect {
                    id: NoConnectId(id),
                    position,
                    node: node.clone(),
                })
            }),
            "lib_symbols" => return Element::LibSymbols(node),
            _ => return Element::Other(node),
        };

        match parsed {
            Ok(element) => element,
            Err(e) => {
                tracing::warn!("Keeping malformed {} element verbatim: {}", tag, e);
                Element::Other(node)
            }
        }
    }

    fn uuid_of(node: &SExp, what: &str) -> Result<String, KicadParseError> {
        node.value_of("uuid")
            .map(str::to_string)
            .ok_or_else(|| KicadParseError::MissingField(format!("{} uuid", what)))
    }

    fn parse_symbol(node: &SExp) -> Result<Component, KicadParseError> {
        let id = Self::uuid_of(node, "symbol")?;
        let lib_id = node
            .value_of("lib_id")
            .ok_or_else(|| KicadParseError::MissingField("lib_id".to_string()))?
            .to_string();
        let (position, angle) = Self::parse_at(node)?;
        let rotation = Rotation::from_degrees(angle)
            .map_err(|e| KicadParseError::InvalidFormat(e.to_string()))?;
        let mirror = node
            .value_of("mirror")
            .and_then(Mirror::from_token)
            .unwrap_or_default();
        let unit = node
            .find("unit")
            .and_then(|u| u.number_at(1))
            .map(|u| u as u32)
            .unwrap_or(1);

        let mut reference = String::new();
        let mut value = String::new();
        let mut footprint = String::new();
        let mut properties = BTreeMap::new();
        for prop in node.get_all("property") {
            if let (Some(key), Some(val)) = (prop.atom_at(1), prop.atom_at(2)) {
                match key {
                    "Reference" => reference = val.to_string(),
                    "Value" => value = val.to_string(),
                    "Footprint" => footprint = val.to_string(),
                    _ => {
                        properties.insert(key.to_string(), val.to_string());
                    }
                }
            }
        }
        if reference.is_empty() {
            // KiCad 6 files may only carry the reference in the instances block.
            reference = Self::instance_reference(node).unwrap_or_default();
        }
        if reference.is_empty() {
            return Err(KicadParseError::MissingField("symbol reference".to_string()));
        }

        let pins = node
            .get_all("pin")
            .into_iter()
            .filter_map(|pin| {
                let number = pin.atom_at(1)?.to_string();
                let uuid = pin.value_of("uuid").unwrap_or_default().to_string();
                Some((number, uuid))
            })
            .collect();

        Ok(Component {
            id: ComponentId(id),
            reference,
            lib_id,
            value,
            footprint,
            placement: Placement::new(position, rotation, mirror),
            unit,
            properties,
            pins,
            unresolved: false,
            node: SExp::list(vec![]),
        })
    }

    fn instance_reference(node: &SExp) -> Option<String> {
        let project = node.find("instances")?.find("project")?;
        let path = project.find("path")?;
        path.value_of("reference").map(str::to_string)
    }

    fn parse_wire(node: &SExp) -> Result<Wire, KicadParseError> {
        let id = Self::uuid_of(node, "wire")?;
        let pts = node
            .find("pts")
            .ok_or_else(|| KicadParseError::MissingField("wire pts".to_string()))?;
        let points: Vec<Position> = pts
            .get_all("xy")
            .into_iter()
            .filter_map(|xy| Some(Position::new(xy.number_at(1)?, xy.number_at(2)?)))
            .collect();
        if points.len() != 2 {
            return Err(KicadParseError::InvalidFormat(format!(
                "wire with {} points",
                points.len()
            )));
        }
        Ok(Wire {
            id: WireId(id),
            start: points[0],
            end: points[1],
            node: SExp::list(vec![]),
        })
    }

    fn parse_label(node: &SExp) -> Result<Label, KicadParseError> {
        let kind = node
            .tag()
            .and_then(LabelKind::from_tag)
            .ok_or_else(|| KicadParseError::InvalidFormat("not a label".to_string()))?;
        let id = Self::uuid_of(node, "label")?;
        let text = node
            .atom_at(1)
            .ok_or_else(|| KicadParseError::MissingField("label text".to_string()))?
            .to_string();
        let (position, angle) = Self::parse_at(node)?;
        let shape = node.value_of("shape").and_then(LabelShape::from_token);
        Ok(Label {
            id: LabelId(id),
            kind,
            text,
            position,
            angle,
            shape,
            node: SExp::list(vec![]),
        })
    }

    fn parse_text(node: &SExp) -> Result<Text, KicadParseError> {
        let id = Self::uuid_of(node, "text")?;
        let text = node
            .atom_at(1)
            .ok_or_else(|| KicadParseError::MissingField("text content".to_string()))?
            .to_string();
        let (position, angle) = Self::parse_at(node)?;
        Ok(Text {
            id: TextId(id),
            text,
            position,
            angle,
            size: Self::font_size(node).unwrap_or(1.27),
            node: SExp::list(vec![]),
        })
    }

    fn parse_text_box(node: &SExp) -> Result<TextBox, KicadParseError> {
        let id = Self::uuid_of(node, "text_box")?;
        let text = node
            .atom_at(1)
            .ok_or_else(|| KicadParseError::MissingField("text_box content".to_string()))?
            .to_string();
        let (position, _) = Self::parse_at(node)?;
        Ok(TextBox {
            id: TextId(id),
            text,
            position,
            size: Self::parse_size(node)?,
            node: SExp::list(vec![]),
        })
    }

    fn parse_sheet(node: &SExp) -> Result<Sheet, KicadParseError> {
        let id = Self::uuid_of(node, "sheet")?;
        let (position, _) = Self::parse_at(node)?;
        let size = Self::parse_size(node)?;

        let mut name = String::new();
        let mut file_name = String::new();
        for prop in node.get_all("property") {
            match (prop.atom_at(1), prop.atom_at(2)) {
                (Some("Sheetname"), Some(v)) | (Some("Sheet name"), Some(v)) => {
                    name = v.to_string()
                }
                (Some("Sheetfile"), Some(v)) | (Some("Sheet file"), Some(v)) => {
                    file_name = v.to_string()
                }
                _ => {}
            }
        }

        let mut pins = Vec::new();
        for pin in node.get_all("pin") {
            let pin_name = pin
                .atom_at(1)
                .ok_or_else(|| KicadParseError::MissingField("sheet pin name".to_string()))?;
            let direction = pin
                .atom_at(2)
                .and_then(LabelShape::from_token)
                .unwrap_or_default();
            let (at, angle) = Self::parse_at(pin)?;
            pins.push(SheetPin {
                id: SheetPinId(Self::uuid_of(pin, "sheet pin")?),
                name: pin_name.to_string(),
                direction,
                offset: Position::new(at.x - position.x, at.y - position.y),
                angle,
            });
        }

        Ok(Sheet {
            id: SheetId(id),
            name,
            file_name,
            position,
            size,
            pins,
            node: SExp::list(vec![]),
        })
    }

    fn parse_marker(node: &SExp) -> Result<(String, Position), KicadParseError> {
        let id = Self::uuid_of(node, "marker")?;
        let (position, _) = Self::parse_at(node)?;
        Ok((id, position))
    }

    /// `(at X Y [ANGLE])`
    fn parse_at(node: &SExp) -> Result<(Position, f64), KicadParseError> {
        let at = node
            .find("at")
            .ok_or_else(|| KicadParseError::MissingField("at".to_string()))?;
        match (at.number_at(1), at.number_at(2)) {
            (Some(x), Some(y)) => Ok((Position::new(x, y), at.number_at(3).unwrap_or(0.0))),
            _ => Err(KicadParseError::InvalidFormat(
                "Invalid 'at' format - requires at least X and Y".to_string(),
            )),
        }
    }

    fn parse_size(node: &SExp) -> Result<Size, KicadParseError> {
        let size = node
            .find("size")
            .ok_or_else(|| KicadParseError::MissingField("size".to_string()))?;
        match (size.number_at(1), size.number_at(2)) {
            (Some(w), Some(h)) => Ok(Size::new(w, h)),
            _ => Err(KicadParseError::InvalidFormat("Invalid 'size' format".to_string())),
        }
    }

    fn font_size(node: &SExp) -> Option<f64> {
        node.find("effects")?.find("font")?.find("size")?.number_at(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"(kicad_sch
	(version 20231120)
	(generator "eeschema")
	(uuid "a1b2c3d4-0000-0000-0000-000000000001")
	(paper "A4")
	(wire
		(pts
			(xy 100 100) (xy 110 100)
		)
		(stroke
			(width 0)
			(type default)
		)
		(uuid "w-1")
	)
	(label "SDA"
		(at 110 100 0)
		(uuid "l-1")
	)
	(bus_entry
		(at 1 2)
		(size 2.54 2.54)
		(uuid "b-1")
	)
	(symbol
		(lib_id "Device:R")
		(at 100 80 90)
		(mirror x)
		(unit 1)
		(uuid "c-1")
		(property "Reference" "R1"
			(at 0 0 0)
		)
		(property "Value" "10k"
			(at 0 0 0)
		)
		(property "Footprint" ""
			(at 0 0 0)
		)
		(property "Tolerance" "5%"
			(at 0 0 0)
		)
		(pin "1"
			(uuid "p-1")
		)
	)
	(sheet_instances
		(path "/"
			(page "1")
		)
	)
)
"#;

    #[test]
    fn test_parse_elements_in_order() {
        let parsed = KicadParser::parse_schematic_str(SMALL).unwrap();
        let kinds: Vec<&str> = parsed
            .elements
            .iter()
            .map(|e| match e {
                Element::Wire(_) => "wire",
                Element::Label(_) => "label",
                Element::Component(_) => "component",
                Element::Other(_) => "other",
                _ => "?",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["other", "other", "other", "other", "wire", "label", "other", "component", "other"]
        );
        assert_eq!(parsed.trailing, "\n");
    }

    #[test]
    fn test_parse_symbol_fields() {
        let parsed = KicadParser::parse_schematic_str(SMALL).unwrap();
        let component = parsed
            .elements
            .iter()
            .find_map(|e| match e {
                Element::Component(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(component.reference, "R1");
        assert_eq!(component.value, "10k");
        assert_eq!(component.footprint, "");
        assert_eq!(component.placement.rotation, Rotation::Deg90);
        assert_eq!(component.placement.mirror, Mirror::X);
        assert_eq!(component.properties.get("Tolerance").map(String::as_str), Some("5%"));
        assert_eq!(component.pins, vec![("1".to_string(), "p-1".to_string())]);
    }

    #[test]
    fn test_rejects_other_roots() {
        let err = KicadParser::parse_schematic_str("(kicad_pcb (version 1))").unwrap_err();
        assert!(matches!(err, KicadParseError::InvalidFormat(_)));
        assert!(KicadParser::parse_schematic_str("(kicad_sch").is_err());
    }

    #[test]
    fn test_malformed_element_kept_opaque() {
        let parsed =
            KicadParser::parse_schematic_str("(kicad_sch (wire (pts (xy 0 0)) (uuid \"x\")))")
                .unwrap();
        assert!(matches!(parsed.elements[0], Element::Other(_)));
    }
}
