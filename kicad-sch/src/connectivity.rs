//! Connectivity Engine
//!
//! Pin coordinates are always recomputed from the symbol definition and the
//! component's current placement. Nets are derived on demand: points that
//! coincide (quantised to 0.0001 mm) are joined, wires join their two ends,
//! and labels, power symbols and hidden power pins join everything carrying
//! the same name.

use petgraph::unionfind::UnionFind;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::core::{Result, SchematicError};
use crate::geometry::{self, outward_angle, Placement, Position};
use crate::library::{ElectricalType, SymbolDefinition};
use crate::schema::*;
use crate::schematic::Schematic;

/// A pin of a placed component with its absolute coordinate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinInfo {
    pub number: String,
    pub name: String,
    pub position: Position,
    pub electrical_type: ElectricalType,
}

/// Pins of one part, unit by unit in symbol order. Pins shared by all units
/// are reported once, at the first unit. Cloning restarts the sequence;
/// coordinates are computed as items are pulled.
#[derive(Debug, Clone)]
pub struct PinIter {
    symbol: Arc<SymbolDefinition>,
    parts: Vec<(Placement, u32)>,
    part: usize,
    index: usize,
}

impl Iterator for PinIter {
    type Item = PinInfo;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((placement, unit)) = self.parts.get(self.part) {
            while let Some(pin) = self.symbol.pins.get(self.index) {
                self.index += 1;
                let common = pin.unit == 0 && self.part == 0;
                if common || pin.unit == *unit {
                    return Some(PinInfo {
                        number: pin.number.clone(),
                        name: pin.name.clone(),
                        position: placement.transform(pin.position),
                        electrical_type: pin.electrical_type,
                    });
                }
            }
            self.part += 1;
            self.index = 0;
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.parts.len().saturating_sub(self.part);
        (0, Some(remaining * self.symbol.pins.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PinRef {
    pub reference: String,
    pub pin: String,
}

/// A derived electrical net.
#[derive(Debug, Clone, Serialize)]
pub struct Net {
    pub name: String,
    pub pins: Vec<PinRef>,
    pub labels: Vec<LabelId>,
    pub wires: Vec<WireId>,
}

impl Schematic {
    /// Absolute coordinate of a pin, looked up across every unit placed
    /// under `reference`.
    pub fn pin_position(&self, reference: &str, pin_number: &str) -> Result<Position> {
        let (parts, symbol) = self.parts(reference)?;
        parts
            .iter()
            .find_map(|(placement, unit)| {
                geometry::pin_position(&symbol, placement, *unit, pin_number).ok()
            })
            .ok_or_else(|| SchematicError::PinNotFound {
                reference: reference.to_string(),
                pin: pin_number.to_string(),
            })
    }

    pub fn list_pins(&self, reference: &str) -> Result<PinIter> {
        let (parts, symbol) = self.parts(reference)?;
        Ok(PinIter {
            symbol,
            parts,
            part: 0,
            index: 0,
        })
    }

    /// Place a local label exactly on a pin, reading away from the body.
    pub fn add_label_to_pin(&mut self, reference: &str, pin_number: &str, text: &str) -> Result<LabelId> {
        let (position, angle) = self.pin_anchor(reference, pin_number)?;
        let id = self.insert_label(LabelKind::Local, text, position, angle, None);
        tracing::debug!("Labelled {}.{} as {}", reference, pin_number, text);
        Ok(id)
    }

    /// Join two pins by dropping a label named `net_name` on each.
    pub fn connect_pins_with_labels(
        &mut self,
        ref_a: &str,
        pin_a: &str,
        ref_b: &str,
        pin_b: &str,
        net_name: &str,
    ) -> Result<[LabelId; 2]> {
        let (pos_a, angle_a) = self.pin_anchor(ref_a, pin_a)?;
        let (pos_b, angle_b) = self.pin_anchor(ref_b, pin_b)?;
        let a = self.insert_label(LabelKind::Local, net_name, pos_a, angle_a, None);
        let b = self.insert_label(LabelKind::Local, net_name, pos_b, angle_b, None);
        tracing::debug!(
            "Connected {}.{} and {}.{} via {}",
            ref_a,
            pin_a,
            ref_b,
            pin_b,
            net_name
        );
        Ok([a, b])
    }

    fn pin_anchor(&self, reference: &str, pin_number: &str) -> Result<(Position, f64)> {
        let (parts, symbol) = self.parts(reference)?;
        parts
            .iter()
            .find_map(|(placement, unit)| {
                symbol
                    .pins_for_unit(*unit)
                    .find(|p| p.number == pin_number)
                    .map(|pin| {
                        (
                            placement.transform(pin.position),
                            outward_angle(pin.body_direction, placement),
                        )
                    })
            })
            .ok_or_else(|| SchematicError::PinNotFound {
                reference: reference.to_string(),
                pin: pin_number.to_string(),
            })
    }

    /// Derived nets, sorted by name.
    pub fn nets(&self) -> Vec<Net> {
        Connectivity::build(self).nets
    }
}

/// Points and names that take part in connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Point((i64, i64)),
    Name(String),
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedPin {
    pub component: ComponentId,
    pub reference: String,
    pub number: String,
    pub position: Position,
    pub electrical_type: ElectricalType,
    pub group: usize,
}

/// Members of one connected group.
#[derive(Debug, Clone, Default)]
pub(crate) struct Group {
    pub pins: Vec<usize>,
    pub labels: Vec<LabelId>,
    pub wires: Vec<WireId>,
    pub wire_ends: usize,
    pub sheet_pins: usize,
    /// Label texts plus power names.
    pub names: BTreeSet<String>,
}

/// Snapshot of the document's connectivity.
#[derive(Debug, Clone)]
pub(crate) struct Connectivity {
    pub pins: Vec<ResolvedPin>,
    pub groups: HashMap<usize, Group>,
    pub no_connects: HashSet<(i64, i64)>,
    pub nets: Vec<Net>,
}

#[derive(Default)]
struct KeyTable {
    index: HashMap<Key, usize>,
    edges: Vec<(usize, usize)>,
}

impl KeyTable {
    fn id(&mut self, key: Key) -> usize {
        let next = self.index.len();
        *self.index.entry(key).or_insert(next)
    }

    fn point(&mut self, p: Position) -> usize {
        self.id(Key::Point(p.key()))
    }

    fn name(&mut self, name: &str) -> usize {
        self.id(Key::Name(name.to_string()))
    }

    fn join(&mut self, a: usize, b: usize) {
        self.edges.push((a, b));
    }
}

impl Connectivity {
    pub fn build(schematic: &Schematic) -> Self {
        let mut table = KeyTable::default();

        let wires: Vec<&Wire> = schematic.wires().collect();
        let wire_ends: Vec<(usize, usize)> = wires
            .iter()
            .map(|w| {
                let a = table.point(w.start);
                let b = table.point(w.end);
                table.join(a, b);
                (a, b)
            })
            .collect();

        // Anything that may attach to the middle of a wire.
        let mut tap_points: Vec<Position> = wires.iter().flat_map(|w| [w.start, w.end]).collect();

        let mut pins = Vec::new();
        let mut pin_keys = Vec::new();
        for component in schematic.components() {
            let Some(symbol) = schematic.symbol(&component.lib_id) else {
                continue;
            };
            for pin in symbol.pins_for_unit(component.unit) {
                let position = component.placement.transform(pin.position);
                let key = table.point(position);
                if symbol.power {
                    let net = table.name(&component.value);
                    table.join(key, net);
                } else if pin.hidden && pin.electrical_type == ElectricalType::PowerIn {
                    let net = table.name(&pin.name);
                    table.join(key, net);
                }
                pin_keys.push(key);
                pins.push(ResolvedPin {
                    component: component.id.clone(),
                    reference: component.reference.clone(),
                    number: pin.number.clone(),
                    position,
                    electrical_type: pin.electrical_type,
                    group: 0,
                });
            }
        }

        let mut label_keys = Vec::new();
        for label in schematic.labels() {
            let key = table.point(label.position);
            let name = table.name(&label.text);
            table.join(key, name);
            label_keys.push(key);
            tap_points.push(label.position);
        }
        for junction in schematic.junctions() {
            table.point(junction.position);
            tap_points.push(junction.position);
        }

        let mut sheet_pin_keys = Vec::new();
        for sheet in schematic.sheets() {
            for pin in &sheet.pins {
                let position = sheet.pin_position(pin);
                sheet_pin_keys.push(table.point(position));
                tap_points.push(position);
            }
        }

        for point in &tap_points {
            for (wire, (start, _)) in wires.iter().zip(&wire_ends) {
                if wire.passes_through(*point) {
                    let key = table.point(*point);
                    table.join(key, *start);
                }
            }
        }

        let mut sets = UnionFind::<usize>::new(table.index.len().max(1));
        for (a, b) in &table.edges {
            sets.union(*a, *b);
        }

        let mut groups: HashMap<usize, Group> = HashMap::new();
        for (i, (pin, key)) in pins.iter_mut().zip(&pin_keys).enumerate() {
            pin.group = sets.find(*key);
            groups.entry(pin.group).or_default().pins.push(i);
        }
        for (wire, (start, _)) in wires.iter().zip(&wire_ends) {
            let group = groups.entry(sets.find(*start)).or_default();
            group.wires.push(wire.id.clone());
            group.wire_ends += 2;
        }
        for (label, key) in schematic.labels().zip(&label_keys) {
            let group = groups.entry(sets.find(*key)).or_default();
            group.labels.push(label.id.clone());
            group.names.insert(label.text.clone());
        }
        for key in &sheet_pin_keys {
            groups.entry(sets.find(*key)).or_default().sheet_pins += 1;
        }
        for (key, id) in &table.index {
            if let Key::Name(name) = key {
                let group = groups.entry(sets.find(*id)).or_default();
                group.names.insert(name.clone());
            }
        }

        let no_connects = schematic.no_connects().map(|n| n.position.key()).collect();
        let nets = Self::name_nets(&pins, &groups);

        Self {
            pins,
            groups,
            no_connects,
            nets,
        }
    }

    fn name_nets(pins: &[ResolvedPin], groups: &HashMap<usize, Group>) -> Vec<Net> {
        let mut nets: Vec<Net> = groups
            .values()
            .filter(|g| !g.pins.is_empty() || !g.labels.is_empty())
            .map(|group| {
                let mut refs: Vec<PinRef> = group
                    .pins
                    .iter()
                    .map(|&i| PinRef {
                        reference: pins[i].reference.clone(),
                        pin: pins[i].number.clone(),
                    })
                    .collect();
                refs.sort();
                refs.dedup();

                let name = group
                    .names
                    .iter()
                    .next()
                    .cloned()
                    .or_else(|| {
                        refs.iter()
                            .find(|r| !r.reference.starts_with('#'))
                            .or_else(|| refs.first())
                            .map(|r| format!("Net-({}-Pad{})", r.reference, r.pin))
                    })
                    .unwrap_or_default();

                let mut labels = group.labels.clone();
                labels.sort();
                let mut wires = group.wires.clone();
                wires.sort();
                Net {
                    name,
                    pins: refs,
                    labels,
                    wires,
                }
            })
            .collect();
        nets.sort_by(|a, b| a.name.cmp(&b.name));
        nets
    }

    /// Pins attached to nothing else and not marked no-connect.
    pub fn dangling_pins(&self) -> impl Iterator<Item = &ResolvedPin> + '_ {
        self.pins.iter().filter(move |pin| {
            if pin.electrical_type == ElectricalType::NoConnect
                || self.no_connects.contains(&pin.position.key())
            {
                return false;
            }
            match self.groups.get(&pin.group) {
                Some(group) => {
                    group.pins.len() <= 1
                        && group.wire_ends == 0
                        && group.labels.is_empty()
                        && group.sheet_pins == 0
                        && group.names.is_empty()
                }
                None => true,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::SymbolLibrary;

    fn schematic() -> Schematic {
        Schematic::with_library("Connectivity", Arc::new(SymbolLibrary::builtin()))
    }

    #[test]
    fn test_list_pins_is_restartable() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        let pins = sch.list_pins("R1").unwrap();
        let first: Vec<PinInfo> = pins.clone().collect();
        let second: Vec<PinInfo> = pins.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].number, "1");
        assert!(first[0].position.coincides(&Position::new(100.0, 96.19)));
        assert!(first[1].position.coincides(&Position::new(100.0, 103.81)));
    }

    #[test]
    fn test_list_pins_recomputed_after_move() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        let before = sch.pin_position("R1", "1").unwrap();
        sch.move_component("R1", (110.0, 100.0)).unwrap();
        let after = sch.pin_position("R1", "1").unwrap();
        assert!(after.coincides(&before.offset(10.0, 0.0)));
        assert_eq!(sch.list_pins("R1").unwrap().next().unwrap().position, after);
    }

    #[test]
    fn test_errors() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.add_component("Missing:Part", "U1", "?", (50.0, 50.0), None)
            .unwrap();
        assert!(matches!(
            sch.pin_position("R9", "1"),
            Err(SchematicError::ComponentNotFound(_))
        ));
        assert!(matches!(
            sch.pin_position("R1", "3"),
            Err(SchematicError::PinNotFound { .. })
        ));
        assert!(matches!(
            sch.add_label_to_pin("U1", "1", "X"),
            Err(SchematicError::UnresolvedSymbol { .. })
        ));
        assert_eq!(sch.labels().count(), 0);
    }

    #[test]
    fn test_connect_pins_with_labels_fails_without_partial_labels() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        let err = sch.connect_pins_with_labels("R1", "2", "C9", "1", "VOUT");
        assert!(err.is_err());
        assert_eq!(sch.labels().count(), 0);
    }

    #[test]
    fn test_label_orientation_points_away_from_body() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        let top = sch.add_label_to_pin("R1", "1", "TOP").unwrap();
        let bottom = sch.add_label_to_pin("R1", "2", "BOTTOM").unwrap();
        assert_eq!(sch.label(&top).unwrap().angle, 90.0);
        assert_eq!(sch.label(&bottom).unwrap().angle, 270.0);
    }

    #[test]
    fn test_nets_from_wires_and_labels() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.add_component("Device:R", "R2", "10k", (120.0, 100.0), None)
            .unwrap();
        sch.add_component("power:GND", "#PWR01", "GND", (100.0, 110.0), None)
            .unwrap();
        // R1.2 at (100, 103.81) wired down to the GND pin.
        sch.add_wire((100.0, 103.81), (100.0, 110.0));
        sch.connect_pins_with_labels("R1", "1", "R2", "1", "VIN")
            .unwrap();

        let nets = sch.nets();
        let gnd = nets.iter().find(|n| n.name == "GND").unwrap();
        assert_eq!(
            gnd.pins,
            vec![
                PinRef { reference: "#PWR01".into(), pin: "1".into() },
                PinRef { reference: "R1".into(), pin: "2".into() },
            ]
        );
        assert_eq!(gnd.wires.len(), 1);

        let vin = nets.iter().find(|n| n.name == "VIN").unwrap();
        assert_eq!(vin.pins.len(), 2);
        assert_eq!(vin.labels.len(), 2);

        let unnamed = nets.iter().find(|n| n.name == "Net-(R2-Pad2)").unwrap();
        assert_eq!(unnamed.pins.len(), 1);

        let connectivity = Connectivity::build(&sch);
        let dangling: Vec<String> = connectivity
            .dangling_pins()
            .map(|p| format!("{}.{}", p.reference, p.number))
            .collect();
        assert_eq!(dangling, vec!["R2.2".to_string()]);
    }

    #[test]
    fn test_wire_tap_and_no_connect() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        // Wire ends on R1.1; a label sits on its interior.
        sch.add_wire((90.0, 96.19), (100.0, 96.19));
        sch.add_label("MID", (95.0, 96.19));
        sch.add_no_connect((100.0, 103.81));

        let nets = sch.nets();
        let mid = nets.iter().find(|n| n.name == "MID").unwrap();
        assert_eq!(mid.pins, vec![PinRef { reference: "R1".into(), pin: "1".into() }]);
        assert_eq!(Connectivity::build(&sch).dangling_pins().count(), 0);
    }
}
