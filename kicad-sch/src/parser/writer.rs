//! KiCAD Schematic Writer
//!
//! Two halves: `sync_*` functions push typed fields back into an element's
//! node, touching only atoms whose value changed, and `*_node` builders
//! create fresh nodes in KiCad 8 layout for elements made by the engine.

use std::collections::HashMap;
use uuid::Uuid;

use crate::geometry::{Placement, Position, Rotation};
use crate::library::SymbolDefinition;
use crate::parser::sexp::SExp;
use crate::schema::*;

pub const KICAD_VERSION: &str = "20231120";
pub const GENERATOR: &str = "eeschema";
pub const GENERATOR_VERSION: &str = "8.0";
pub const FONT_SIZE: f64 = 1.27;

/// Top-level tags that stay at the end of the file; new elements go before
/// them.
pub const TAIL_TAGS: &[&str] = &["sheet_instances", "symbol_instances", "embedded_fonts"];

fn yes_no(flag: bool) -> SExp {
    SExp::symbol(if flag { "yes" } else { "no" })
}

fn at_node(position: Position, angle: Option<f64>) -> SExp {
    let mut items = vec![SExp::number(position.x), SExp::number(position.y)];
    if let Some(angle) = angle {
        items.push(SExp::number(angle));
    }
    SExp::tagged("at", items)
}

fn uuid_node(id: &str) -> SExp {
    SExp::tagged("uuid", vec![SExp::string(id)])
}

fn effects_node(size: f64, justify: &[&str], hidden: bool) -> SExp {
    let mut items = vec![SExp::tagged(
        "font",
        vec![SExp::tagged("size", vec![SExp::number(size), SExp::number(size)])],
    )];
    if !justify.is_empty() {
        items.push(SExp::tagged(
            "justify",
            justify.iter().map(|j| SExp::symbol(*j)).collect(),
        ));
    }
    if hidden {
        items.push(SExp::tagged("hide", vec![yes_no(true)]));
    }
    SExp::tagged("effects", items)
}

fn stroke_node(width: f64, kind: &str) -> SExp {
    SExp::tagged(
        "stroke",
        vec![
            SExp::tagged("width", vec![SExp::number(width)]),
            SExp::tagged("type", vec![SExp::symbol(kind)]),
        ],
    )
}

pub fn property_node(key: &str, value: &str, at: Position, angle: f64, hidden: bool) -> SExp {
    let justify: &[&str] = if hidden { &[] } else { &["left"] };
    SExp::tagged(
        "property",
        vec![
            SExp::string(key),
            SExp::string(value),
            at_node(at, Some(angle)),
            effects_node(FONT_SIZE, justify, hidden),
        ],
    )
}

/// Set `(at X Y [ANGLE])`, creating it after the element head when missing.
fn set_at(node: &mut SExp, position: Position, angle: Option<f64>) {
    match node.find_mut("at") {
        Some(at) => {
            at.set_number(1, position.x);
            at.set_number(2, position.y);
            if let Some(angle) = angle {
                at.set_number(3, angle);
            }
        }
        None => {
            if let Some(items) = node.as_list_mut() {
                let index = items.len().min(2);
                items.insert(index, at_node(position, angle));
            }
        }
    }
}

fn set_uuid(node: &mut SExp, id: &str) {
    node.set_value("uuid", SExp::string(id));
}

fn set_property(node: &mut SExp, key: &str, value: &str, default_at: Position, hidden: bool) {
    if let Some(items) = node.as_list_mut() {
        if let Some(prop) = items
            .iter_mut()
            .find(|i| i.tag() == Some("property") && i.atom_at(1) == Some(key))
        {
            prop.set_atom(2, value);
            return;
        }
    }
    node.insert_near(
        property_node(key, value, default_at, 0.0, hidden),
        "property",
        &["pin", "instances"],
    );
}

// ----------------------------------------------------------------------------
// Sync
// ----------------------------------------------------------------------------

pub fn sync_component(component: &mut Component) {
    let node = &mut component.node;
    node.set_value("lib_id", SExp::string(&component.lib_id));
    set_at(
        node,
        component.placement.position,
        Some(component.placement.rotation.degrees()),
    );

    match component.placement.mirror.token() {
        Some(token) => {
            if let Some(mirror) = node.find_mut("mirror") {
                mirror.set_atom(1, token);
            } else {
                node.insert_near(SExp::tagged("mirror", vec![SExp::symbol(token)]), "at", &[]);
            }
        }
        None => {
            node.remove_all("mirror");
        }
    }

    if let Some(unit) = node.find_mut("unit") {
        unit.set_number(1, component.unit as f64);
    }
    set_uuid(node, component.id.as_str());

    let origin = component.placement.position;
    set_property(node, "Reference", &component.reference, origin, false);
    set_property(node, "Value", &component.value, origin, false);
    set_property(node, "Footprint", &component.footprint, origin, true);
    for (key, value) in &component.properties {
        set_property(node, key, value, origin, true);
    }
    if let Some(items) = node.as_list_mut() {
        let properties = &component.properties;
        items.retain(|item| {
            if item.tag() != Some("property") {
                return true;
            }
            match item.atom_at(1) {
                Some("Reference") | Some("Value") | Some("Footprint") => true,
                Some(key) => properties.contains_key(key),
                None => true,
            }
        });
    }

    // Instance paths repeat the reference and unit.
    if let Some(instances) = node.find_mut("instances") {
        instances.walk_mut(&mut |n| match n.tag() {
            Some("reference") => n.set_atom(1, &component.reference),
            Some("unit") => n.set_number(1, component.unit as f64),
            _ => {}
        });
    }
}

pub fn sync_wire(wire: &mut Wire) {
    if let Some(pts) = wire.node.find_mut("pts") {
        if let Some(items) = pts.as_list_mut() {
            let points = [wire.start, wire.end];
            for (xy, point) in items
                .iter_mut()
                .filter(|i| i.tag() == Some("xy"))
                .zip(points.iter())
            {
                xy.set_number(1, point.x);
                xy.set_number(2, point.y);
            }
        }
    }
    set_uuid(&mut wire.node, wire.id.as_str());
}

pub fn sync_label(label: &mut Label) {
    label.node.set_atom(1, &label.text);
    if let Some(shape) = label.shape {
        label.node.set_value("shape", SExp::symbol(shape.token()));
    }
    set_at(&mut label.node, label.position, Some(label.angle));
    set_uuid(&mut label.node, label.id.as_str());
}

pub fn sync_sheet(sheet: &mut Sheet) {
    set_at(&mut sheet.node, sheet.position, None);
    if let Some(size) = sheet.node.find_mut("size") {
        size.set_number(1, sheet.size.width);
        size.set_number(2, sheet.size.height);
    }
    set_uuid(&mut sheet.node, sheet.id.as_str());

    let (name_key, file_key) = if sheet
        .node
        .get_all("property")
        .iter()
        .any(|p| p.atom_at(1) == Some("Sheet name"))
    {
        ("Sheet name", "Sheet file")
    } else {
        ("Sheetname", "Sheetfile")
    };
    set_property(&mut sheet.node, name_key, &sheet.name, sheet.position, false);
    set_property(&mut sheet.node, file_key, &sheet.file_name, sheet.position, true);

    let mut existing: Vec<String> = Vec::new();
    if let Some(items) = sheet.node.as_list_mut() {
        items.retain(|item| {
            if item.tag() != Some("pin") {
                return true;
            }
            let id = item.value_of("uuid").unwrap_or_default();
            sheet.pins.iter().any(|p| p.id.as_str() == id)
        });
        for item in items.iter_mut().filter(|i| i.tag() == Some("pin")) {
            let id = item.value_of("uuid").unwrap_or_default().to_string();
            if let Some(pin) = sheet.pins.iter().find(|p| p.id.as_str() == id) {
                item.set_atom(1, &pin.name);
                item.set_atom(2, pin.direction.token());
                set_at(item, sheet.position.offset(pin.offset.x, pin.offset.y), Some(pin.angle));
                existing.push(id);
            }
        }
    }
    let added: Vec<SExp> = sheet
        .pins
        .iter()
        .filter(|pin| !existing.iter().any(|id| id == pin.id.as_str()))
        .map(|pin| sheet_pin_node(sheet, pin))
        .collect();
    for node in added {
        sheet.node.insert_near(node, "pin", &["instances"]);
    }
}

/// Move every field of a symbol node by the same delta as the symbol.
pub fn shift_fields(node: &mut SExp, dx: f64, dy: f64) {
    if let Some(items) = node.as_list_mut() {
        for prop in items.iter_mut().filter(|i| i.tag() == Some("property")) {
            if let Some(at) = prop.find_mut("at") {
                let (x, y) = (at.number_at(1).unwrap_or(0.0), at.number_at(2).unwrap_or(0.0));
                at.set_number(1, x + dx);
                at.set_number(2, y + dy);
            }
        }
    }
}

/// Carry field positions from one placement of a symbol to another, so
/// each field keeps its offset in the symbol's own frame. Field text only
/// reads at 0 or 90 degrees; an odd quarter-turn swaps the two.
pub fn reorient_fields(node: &mut SExp, from: &Placement, to: &Placement) {
    let odd = matches!(
        to.rotation.compose(from.rotation.inverse()),
        Rotation::Deg90 | Rotation::Deg270
    );
    if let Some(items) = node.as_list_mut() {
        for prop in items.iter_mut().filter(|i| i.tag() == Some("property")) {
            if let Some(at) = prop.find_mut("at") {
                let (x, y) = (at.number_at(1).unwrap_or(0.0), at.number_at(2).unwrap_or(0.0));
                let moved = to.transform(from.local(Position::new(x, y)));
                at.set_number(1, moved.x);
                at.set_number(2, moved.y);
                if odd {
                    let angle = at.number_at(3).unwrap_or(0.0);
                    at.set_number(3, if angle == 0.0 { 90.0 } else { 0.0 });
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Builders
// ----------------------------------------------------------------------------

/// Header nodes of an empty document.
pub fn header_nodes(uuid: &str, title: &str, date: &str) -> Vec<SExp> {
    vec![
        SExp::tagged("version", vec![SExp::symbol(KICAD_VERSION)]),
        SExp::tagged("generator", vec![SExp::string(GENERATOR)]),
        SExp::tagged("generator_version", vec![SExp::string(GENERATOR_VERSION)]),
        uuid_node(uuid),
        SExp::tagged("paper", vec![SExp::string("A4")]),
        SExp::tagged(
            "title_block",
            vec![
                SExp::tagged("title", vec![SExp::string(title)]),
                SExp::tagged("date", vec![SExp::string(date)]),
            ],
        ),
    ]
}

pub fn lib_symbols_node() -> SExp {
    SExp::tagged("lib_symbols", vec![])
}

pub fn sheet_instances_node() -> SExp {
    SExp::tagged(
        "sheet_instances",
        vec![SExp::tagged(
            "path",
            vec![
                SExp::string("/"),
                SExp::tagged("page", vec![SExp::string("1")]),
            ],
        )],
    )
}

/// Field position from the symbol's own property placement, falling back
/// to `fallback` (relative to the symbol origin).
fn field_position(
    symbol: Option<&SymbolDefinition>,
    key: &str,
    placement: &Placement,
    fallback: Position,
) -> Position {
    let local = symbol
        .and_then(|s| {
            s.raw
                .get_all("property")
                .into_iter()
                .find(|p| p.atom_at(1) == Some(key))
                .and_then(|p| p.find("at"))
                .and_then(|at| Some(Position::new(at.number_at(1)?, -at.number_at(2)?)))
        })
        .unwrap_or(fallback);
    placement.transform(local)
}

pub fn component_node(
    component: &Component,
    symbol: Option<&SymbolDefinition>,
    project: &str,
    root_uuid: &str,
) -> SExp {
    let placement = &component.placement;
    let mut items = vec![
        SExp::tagged("lib_id", vec![SExp::string(&component.lib_id)]),
        at_node(placement.position, Some(placement.rotation.degrees())),
    ];
    if let Some(token) = placement.mirror.token() {
        items.push(SExp::tagged("mirror", vec![SExp::symbol(token)]));
    }
    items.push(SExp::tagged("unit", vec![SExp::number(component.unit as f64)]));
    items.push(SExp::tagged("exclude_from_sim", vec![yes_no(false)]));
    items.push(SExp::tagged("in_bom", vec![yes_no(!component.is_power_symbol())]));
    items.push(SExp::tagged("on_board", vec![yes_no(!component.is_power_symbol())]));
    items.push(SExp::tagged("dnp", vec![yes_no(false)]));
    items.push(uuid_node(component.id.as_str()));

    let hide_reference = component.is_power_symbol();
    items.push(property_node(
        "Reference",
        &component.reference,
        field_position(symbol, "Reference", placement, Position::new(2.54, -1.27)),
        0.0,
        hide_reference,
    ));
    items.push(property_node(
        "Value",
        &component.value,
        field_position(symbol, "Value", placement, Position::new(2.54, 1.27)),
        0.0,
        false,
    ));
    items.push(property_node(
        "Footprint",
        &component.footprint,
        placement.position,
        0.0,
        true,
    ));

    for (key, value) in &component.properties {
        items.push(property_node(key, value, placement.position, 0.0, true));
    }

    for (number, uuid) in &component.pins {
        items.push(SExp::tagged(
            "pin",
            vec![SExp::string(number), uuid_node(uuid)],
        ));
    }

    items.push(SExp::tagged(
        "instances",
        vec![SExp::tagged(
            "project",
            vec![
                SExp::string(project),
                SExp::tagged(
                    "path",
                    vec![
                        SExp::string(format!("/{}", root_uuid)),
                        SExp::tagged("reference", vec![SExp::string(&component.reference)]),
                        SExp::tagged("unit", vec![SExp::number(component.unit as f64)]),
                    ],
                ),
            ],
        )],
    ));

    SExp::tagged("symbol", items)
}

pub fn wire_node(wire: &Wire) -> SExp {
    SExp::tagged(
        "wire",
        vec![
            SExp::tagged(
                "pts",
                vec![
                    SExp::tagged("xy", vec![SExp::number(wire.start.x), SExp::number(wire.start.y)]),
                    SExp::tagged("xy", vec![SExp::number(wire.end.x), SExp::number(wire.end.y)]),
                ],
            ),
            stroke_node(0.0, "default"),
            uuid_node(wire.id.as_str()),
        ],
    )
}

pub fn label_node(label: &Label) -> SExp {
    let flipped = label.angle == 180.0 || label.angle == 270.0;
    let mut items = vec![SExp::string(&label.text)];
    if let Some(shape) = label.shape {
        items.push(SExp::tagged("shape", vec![SExp::symbol(shape.token())]));
    }
    items.push(at_node(label.position, Some(label.angle)));
    items.push(SExp::tagged("fields_autoplaced", vec![yes_no(true)]));

    let justify: &[&str] = match (label.kind, flipped) {
        (LabelKind::Local, false) => &["left", "bottom"],
        (LabelKind::Local, true) => &["right", "bottom"],
        (_, false) => &["left"],
        (_, true) => &["right"],
    };
    items.push(effects_node(FONT_SIZE, justify, false));
    items.push(uuid_node(label.id.as_str()));

    if label.kind == LabelKind::Global {
        items.push(property_node(
            "Intersheetrefs",
            "${INTERSHEET_REFS}",
            label.position,
            0.0,
            true,
        ));
    }
    SExp::tagged(label.kind.tag(), items)
}

pub fn text_node(text: &Text) -> SExp {
    SExp::tagged(
        "text",
        vec![
            SExp::string(&text.text),
            SExp::tagged("exclude_from_sim", vec![yes_no(false)]),
            at_node(text.position, Some(text.angle)),
            effects_node(text.size, &["left", "bottom"], false),
            uuid_node(text.id.as_str()),
        ],
    )
}

pub fn text_box_node(text_box: &TextBox) -> SExp {
    SExp::tagged(
        "text_box",
        vec![
            SExp::string(&text_box.text),
            SExp::tagged("exclude_from_sim", vec![yes_no(false)]),
            at_node(text_box.position, Some(0.0)),
            SExp::tagged(
                "size",
                vec![
                    SExp::number(text_box.size.width),
                    SExp::number(text_box.size.height),
                ],
            ),
            stroke_node(0.0, "default"),
            SExp::tagged("fill", vec![SExp::tagged("type", vec![SExp::symbol("none")])]),
            effects_node(FONT_SIZE, &["left", "top"], false),
            uuid_node(text_box.id.as_str()),
        ],
    )
}

pub fn sheet_node(sheet: &Sheet, project: &str, root_uuid: &str, page: usize) -> SExp {
    let p = sheet.position;
    SExp::tagged(
        "sheet",
        vec![
            at_node(p, None),
            SExp::tagged(
                "size",
                vec![SExp::number(sheet.size.width), SExp::number(sheet.size.height)],
            ),
            SExp::tagged("fields_autoplaced", vec![yes_no(true)]),
            stroke_node(0.1524, "solid"),
            SExp::tagged(
                "fill",
                vec![SExp::tagged(
                    "color",
                    vec![
                        SExp::number(0.0),
                        SExp::number(0.0),
                        SExp::number(0.0),
                        SExp::symbol("0.0000"),
                    ],
                )],
            ),
            uuid_node(sheet.id.as_str()),
            property_node("Sheetname", &sheet.name, p.offset(0.0, -0.7116), 0.0, false),
            property_node(
                "Sheetfile",
                &sheet.file_name,
                p.offset(0.0, sheet.size.height + 0.5846),
                0.0,
                true,
            ),
            SExp::tagged(
                "instances",
                vec![SExp::tagged(
                    "project",
                    vec![
                        SExp::string(project),
                        SExp::tagged(
                            "path",
                            vec![
                                SExp::string(format!("/{}", root_uuid)),
                                SExp::tagged("page", vec![SExp::string(page.to_string())]),
                            ],
                        ),
                    ],
                )],
            ),
        ],
    )
}

pub fn sheet_pin_node(sheet: &Sheet, pin: &SheetPin) -> SExp {
    let justify: &[&str] = if pin.angle == 180.0 { &["left"] } else { &["right"] };
    SExp::tagged(
        "pin",
        vec![
            SExp::string(&pin.name),
            SExp::symbol(pin.direction.token()),
            at_node(sheet.pin_position(pin), Some(pin.angle)),
            effects_node(FONT_SIZE, justify, false),
            uuid_node(pin.id.as_str()),
        ],
    )
}

pub fn junction_node(junction: &Junction) -> SExp {
    SExp::tagged(
        "junction",
        vec![
            at_node(junction.position, None),
            SExp::tagged("diameter", vec![SExp::number(0.0)]),
            SExp::tagged(
                "color",
                vec![SExp::number(0.0), SExp::number(0.0), SExp::number(0.0), SExp::number(0.0)],
            ),
            uuid_node(junction.id.as_str()),
        ],
    )
}

pub fn no_connect_node(no_connect: &NoConnect) -> SExp {
    SExp::tagged(
        "no_connect",
        vec![at_node(no_connect.position, None), uuid_node(no_connect.id.as_str())],
    )
}

/// Replace every `(uuid ..)` value under `node` with a fresh one, recording
/// old -> new in `map` so instance paths can follow.
pub fn regenerate_uuids(node: &mut SExp, map: &mut HashMap<String, String>) {
    node.walk_mut(&mut |n| {
        if n.tag() != Some("uuid") {
            return;
        }
        if let Some(old) = n.atom_at(1).map(str::to_string) {
            let new = map
                .entry(old)
                .or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            n.set_atom(1, &new);
        }
    });
}

/// Rewrite `(path "/a/b" ..)` segments through `map`.
pub fn remap_paths(node: &mut SExp, map: &HashMap<String, String>) {
    node.walk_mut(&mut |n| {
        if n.tag() != Some("path") {
            return;
        }
        if let Some(path) = n.atom_at(1).map(str::to_string) {
            let remapped: Vec<&str> = path
                .split('/')
                .map(|segment| map.get(segment).map(String::as_str).unwrap_or(segment))
                .collect();
            n.set_atom(1, &remapped.join("/"));
        }
    });
}
