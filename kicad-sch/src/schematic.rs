//! Document Model
//!
//! [`Schematic`] owns every element of one `.kicad_sch` document in file
//! order. Mutators keep typed fields and backing nodes in step; on error
//! they leave the document as it was.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{Result, SchematicError};
use crate::geometry::{Mirror, Placement, Position, Rotation};
use crate::library::{SymbolDefinition, SymbolLibrary};
use crate::parser::kicad::ParsedSchematic;
use crate::parser::sexp::{SExp, SExpDocument};
use crate::parser::writer;
use crate::schema::*;

const HEADER_TAGS: &[&str] = &[
    "version",
    "generator",
    "generator_version",
    "uuid",
    "paper",
    "title_block",
];

/// Everything needed to place a new component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewComponent {
    pub lib_id: String,
    pub reference: String,
    pub value: String,
    pub position: Position,
    pub footprint: Option<String>,
    /// Degrees, multiple of 90.
    pub rotation: f64,
    pub mirror: Mirror,
    /// Unit of a multi-unit symbol; 0 means 1.
    pub unit: u32,
    pub properties: BTreeMap<String, String>,
}

impl NewComponent {
    pub fn new(
        lib_id: impl Into<String>,
        reference: impl Into<String>,
        value: impl Into<String>,
        position: impl Into<Position>,
    ) -> Self {
        Self {
            lib_id: lib_id.into(),
            reference: reference.into(),
            value: value.into(),
            position: position.into(),
            ..Default::default()
        }
    }

    pub fn footprint(mut self, footprint: impl Into<String>) -> Self {
        self.footprint = Some(footprint.into());
        self
    }

    pub fn rotation(mut self, degrees: f64) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn unit(mut self, unit: u32) -> Self {
        self.unit = unit;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Schematic {
    pub(crate) shell: SExp,
    pub(crate) elements: Vec<Element>,
    pub(crate) trailing: String,
    pub(crate) uuid: String,
    pub(crate) project: String,
    /// Symbol definitions cached in the document's `lib_symbols`.
    pub(crate) embedded: HashMap<String, Arc<SymbolDefinition>>,
    pub(crate) library: Arc<SymbolLibrary>,
    pub(crate) file_path: Option<PathBuf>,
}

impl Schematic {
    /// Empty document resolving symbols through the process-wide library.
    pub fn new(name: &str) -> Self {
        Self::with_library(name, SymbolLibrary::global())
    }

    pub fn with_library(name: &str, library: Arc<SymbolLibrary>) -> Self {
        let uuid = Uuid::new_v4().to_string();
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();

        let mut elements: Vec<Element> = writer::header_nodes(&uuid, name, &date)
            .into_iter()
            .map(Element::Other)
            .collect();
        elements.push(Element::LibSymbols(writer::lib_symbols_node()));
        elements.push(Element::Other(writer::sheet_instances_node()));

        tracing::debug!("Created schematic {} ({})", name, uuid);
        Self {
            shell: SExp::tagged("kicad_sch", vec![]),
            elements,
            trailing: "\n".to_string(),
            uuid,
            project: name.to_string(),
            embedded: HashMap::new(),
            library,
            file_path: None,
        }
    }

    pub(crate) fn from_parsed(
        parsed: ParsedSchematic,
        library: Arc<SymbolLibrary>,
        file_path: Option<PathBuf>,
    ) -> Self {
        let mut embedded = HashMap::new();
        for element in &parsed.elements {
            if let Element::LibSymbols(node) = element {
                for symbol in node.get_all("symbol") {
                    let Some(lib_id) = symbol.atom_at(1) else {
                        continue;
                    };
                    match SymbolDefinition::from_sexp(symbol, lib_id) {
                        Ok(def) => {
                            embedded.insert(lib_id.to_string(), Arc::new(def));
                        }
                        Err(e) => tracing::warn!("Skipping embedded symbol {}: {}", lib_id, e),
                    }
                }
            }
        }

        let uuid = parsed
            .elements
            .iter()
            .find_map(|e| match e {
                Element::Other(node) if node.tag() == Some("uuid") => {
                    node.atom_at(1).map(str::to_string)
                }
                _ => None,
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let project = parsed
            .elements
            .iter()
            .find_map(|e| match e {
                Element::Component(c) => c
                    .node
                    .find("instances")
                    .and_then(|i| i.find("project"))
                    .and_then(|p| p.atom_at(1))
                    .map(str::to_string),
                _ => None,
            })
            .or_else(|| {
                file_path
                    .as_deref()
                    .and_then(Path::file_stem)
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let mut schematic = Self {
            shell: parsed.shell,
            elements: parsed.elements,
            trailing: parsed.trailing,
            uuid,
            project,
            embedded,
            library,
            file_path,
        };

        let mut unresolved = 0;
        let flags: Vec<bool> = schematic
            .components()
            .map(|c| schematic.symbol(&c.lib_id).is_none())
            .collect();
        for (component, flag) in schematic.components_mut().zip(flags) {
            component.unresolved = flag;
            if flag {
                unresolved += 1;
            }
        }
        if unresolved > 0 {
            tracing::warn!("{} components reference unresolved symbols", unresolved);
        }
        schematic
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn version(&self) -> Option<&str> {
        self.header_node("version").and_then(|n| n.atom_at(1))
    }

    pub fn title(&self) -> Option<&str> {
        self.header_node("title_block")
            .and_then(|n| n.find("title"))
            .and_then(|t| t.atom_at(1))
    }

    /// Project name written into new instance blocks.
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn library(&self) -> &Arc<SymbolLibrary> {
        &self.library
    }

    pub fn set_library(&mut self, library: Arc<SymbolLibrary>) {
        self.library = library;
        let flags: Vec<bool> = self
            .components()
            .map(|c| self.symbol(&c.lib_id).is_none())
            .collect();
        for (component, flag) in self.components_mut().zip(flags) {
            component.unresolved = flag;
        }
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    fn header_node(&self, tag: &str) -> Option<&SExp> {
        self.elements.iter().find_map(|e| match e {
            Element::Other(node) if node.tag() == Some(tag) => Some(node),
            _ => None,
        })
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::Component(c) => Some(c),
            _ => None,
        })
    }

    pub(crate) fn components_mut(&mut self) -> impl Iterator<Item = &mut Component> + '_ {
        self.elements.iter_mut().filter_map(|e| match e {
            Element::Component(c) => Some(c),
            _ => None,
        })
    }

    pub fn component(&self, reference: &str) -> Option<&Component> {
        self.components().find(|c| c.reference == reference)
    }

    pub fn component_by_id(&self, id: &ComponentId) -> Option<&Component> {
        self.components().find(|c| &c.id == id)
    }

    /// Every unit placed under `reference`, in document order.
    pub fn units(&self, reference: &str) -> impl Iterator<Item = &Component> + '_ {
        let reference = reference.to_string();
        self.components().filter(move |c| c.reference == reference)
    }

    pub fn wires(&self) -> impl Iterator<Item = &Wire> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::Wire(w) => Some(w),
            _ => None,
        })
    }

    pub fn wire(&self, id: &WireId) -> Option<&Wire> {
        self.wires().find(|w| &w.id == id)
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::Label(l) => Some(l),
            _ => None,
        })
    }

    pub fn label(&self, id: &LabelId) -> Option<&Label> {
        self.labels().find(|l| &l.id == id)
    }

    pub fn texts(&self) -> impl Iterator<Item = &Text> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::Text(t) => Some(t),
            _ => None,
        })
    }

    pub fn text_boxes(&self) -> impl Iterator<Item = &TextBox> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::TextBox(t) => Some(t),
            _ => None,
        })
    }

    pub fn sheets(&self) -> impl Iterator<Item = &Sheet> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::Sheet(s) => Some(s),
            _ => None,
        })
    }

    pub fn sheet(&self, id: &SheetId) -> Option<&Sheet> {
        self.sheets().find(|s| &s.id == id)
    }

    pub fn junctions(&self) -> impl Iterator<Item = &Junction> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::Junction(j) => Some(j),
            _ => None,
        })
    }

    pub fn no_connects(&self) -> impl Iterator<Item = &NoConnect> + '_ {
        self.elements.iter().filter_map(|e| match e {
            Element::NoConnect(n) => Some(n),
            _ => None,
        })
    }

    // ------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------

    /// Definition for `lib_id`: the document's embedded copy first, then
    /// the library.
    pub fn symbol(&self, lib_id: &str) -> Option<Arc<SymbolDefinition>> {
        self.embedded
            .get(lib_id)
            .cloned()
            .or_else(|| self.library.resolve(lib_id))
    }

    /// Placements and unit numbers of every unit of `reference`, ordered by
    /// unit, plus their shared definition. Units placed with a different
    /// `lib_id` than the first one are not part of the same package.
    pub(crate) fn parts(
        &self,
        reference: &str,
    ) -> Result<(Vec<(Placement, u32)>, Arc<SymbolDefinition>)> {
        let first = self
            .component(reference)
            .ok_or_else(|| SchematicError::ComponentNotFound(reference.to_string()))?;
        let symbol = self
            .symbol(&first.lib_id)
            .ok_or_else(|| SchematicError::UnresolvedSymbol {
                reference: reference.to_string(),
                lib_id: first.lib_id.clone(),
            })?;
        let mut parts: Vec<(Placement, u32)> = self
            .units(reference)
            .filter(|c| c.lib_id == first.lib_id)
            .map(|c| (c.placement, c.unit))
            .collect();
        parts.sort_by_key(|(_, unit)| *unit);
        Ok((parts, symbol))
    }

    fn embed_symbol(&mut self, symbol: &Arc<SymbolDefinition>) {
        if self.embedded.contains_key(&symbol.lib_id) {
            return;
        }
        let node = symbol.embedded_node();
        match self
            .elements
            .iter_mut()
            .find_map(|e| match e {
                Element::LibSymbols(n) => Some(n),
                _ => None,
            }) {
            Some(lib_symbols) => lib_symbols.push(node),
            None => {
                let mut lib_symbols = writer::lib_symbols_node();
                lib_symbols.push(node);
                let index = self.header_end();
                self.elements.insert(index, Element::LibSymbols(lib_symbols));
            }
        }
        self.embedded.insert(symbol.lib_id.clone(), Arc::clone(symbol));
    }

    /// Drop the embedded definition of `lib_id` once nothing uses it.
    fn prune_symbol(&mut self, lib_id: &str) {
        if self.components().any(|c| c.lib_id == lib_id) {
            return;
        }
        if self.embedded.remove(lib_id).is_none() {
            return;
        }
        for element in &mut self.elements {
            if let Element::LibSymbols(node) = element {
                if let Some(items) = node.as_list_mut() {
                    items.retain(|item| {
                        item.tag() != Some("symbol") || item.atom_at(1) != Some(lib_id)
                    });
                }
            }
        }
    }

    fn header_end(&self) -> usize {
        self.elements
            .iter()
            .rposition(|e| match e {
                Element::Other(node) => node.tag().map(|t| HEADER_TAGS.contains(&t)).unwrap_or(false),
                _ => false,
            })
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// New elements go before the trailing instance sections.
    fn insert_element(&mut self, element: Element) {
        let index = self
            .elements
            .iter()
            .position(|e| match e {
                Element::Other(node) => node
                    .tag()
                    .map(|t| writer::TAIL_TAGS.contains(&t))
                    .unwrap_or(false),
                _ => false,
            })
            .unwrap_or(self.elements.len());
        self.elements.insert(index, element);
    }

    fn remove_where(&mut self, predicate: impl Fn(&Element) -> bool) -> bool {
        let before = self.elements.len();
        self.elements.retain(|e| !predicate(e));
        before != self.elements.len()
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn add_component(
        &mut self,
        lib_id: &str,
        reference: &str,
        value: &str,
        position: impl Into<Position>,
        footprint: Option<&str>,
    ) -> Result<ComponentId> {
        let mut new = NewComponent::new(lib_id, reference, value, position);
        new.footprint = footprint.map(str::to_string);
        self.add_component_with(new)
    }

    pub fn add_component_with(&mut self, new: NewComponent) -> Result<ComponentId> {
        if new.reference.trim().is_empty() {
            return Err(SchematicError::InvalidArgument(
                "reference must not be empty".to_string(),
            ));
        }
        if new.lib_id.trim().is_empty() {
            return Err(SchematicError::InvalidArgument(
                "lib_id must not be empty".to_string(),
            ));
        }
        let rotation = Rotation::from_degrees(new.rotation)?;
        let unit = new.unit.max(1);
        // Another unit of the same part may share the reference.
        if self
            .units(&new.reference)
            .any(|c| c.lib_id != new.lib_id || c.unit == unit)
        {
            return Err(SchematicError::DuplicateReference(new.reference));
        }

        let symbol = self.symbol(&new.lib_id);
        if let Some(symbol) = &symbol {
            if unit > symbol.unit_count() {
                return Err(SchematicError::InvalidArgument(format!(
                    "{} has {} unit(s), unit {} requested",
                    new.lib_id,
                    symbol.unit_count(),
                    unit
                )));
            }
        }
        let pins = match &symbol {
            Some(symbol) => {
                let mut pins: Vec<(String, String)> = Vec::new();
                for pin in symbol.pins_for_unit(unit) {
                    if !pins.iter().any(|(n, _)| n == &pin.number) {
                        pins.push((pin.number.clone(), Uuid::new_v4().to_string()));
                    }
                }
                pins
            }
            None => {
                tracing::warn!(
                    "Adding {} with unresolved symbol {}",
                    new.reference,
                    new.lib_id
                );
                Vec::new()
            }
        };

        let mut component = Component {
            id: ComponentId::generate(),
            reference: new.reference,
            lib_id: new.lib_id,
            value: new.value,
            footprint: new.footprint.unwrap_or_default(),
            placement: Placement::new(new.position, rotation, new.mirror),
            unit,
            properties: BTreeMap::new(),
            pins,
            unresolved: symbol.is_none(),
            node: SExp::list(vec![]),
        };
        if let Some(symbol) = &symbol {
            for (key, value) in &symbol.properties {
                let mandatory = matches!(key.as_str(), "Reference" | "Value" | "Footprint");
                if !mandatory && !key.starts_with("ki_") {
                    component.properties.insert(key.clone(), value.clone());
                }
            }
        }
        component.properties.extend(new.properties);
        component.node =
            writer::component_node(&component, symbol.as_deref(), &self.project, &self.uuid);

        if let Some(symbol) = &symbol {
            self.embed_symbol(symbol);
        }
        let id = component.id.clone();
        tracing::debug!("Added component {} ({})", component.reference, component.lib_id);
        self.insert_element(Element::Component(component));
        Ok(id)
    }

    pub fn remove_component(&mut self, reference: &str) -> bool {
        let Some(lib_id) = self.component(reference).map(|c| c.lib_id.clone()) else {
            return false;
        };
        let removed = self.remove_where(|e| matches!(e, Element::Component(c) if c.reference == reference));
        if removed {
            tracing::debug!("Removed component {}", reference);
            self.prune_symbol(&lib_id);
        }
        removed
    }

    /// Apply `change` to the component with `id` and write it back to its
    /// node.
    pub(crate) fn update_component_by_id(
        &mut self,
        id: &ComponentId,
        change: impl FnOnce(&mut Component) -> Result<()>,
    ) -> Result<()> {
        let component = self
            .components_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| SchematicError::ComponentNotFound(id.to_string()))?;
        let mut updated = component.clone();
        change(&mut updated)?;
        writer::sync_component(&mut updated);
        *component = updated;
        Ok(())
    }

    /// Apply `change` to every unit of `reference`. Either all units are
    /// updated or none is.
    pub(crate) fn update_component(
        &mut self,
        reference: &str,
        mut change: impl FnMut(&mut Component) -> Result<()>,
    ) -> Result<()> {
        let mut updated = Vec::new();
        for unit in self.units(reference) {
            let mut copy = unit.clone();
            change(&mut copy)?;
            writer::sync_component(&mut copy);
            updated.push(copy);
        }
        if updated.is_empty() {
            return Err(SchematicError::ComponentNotFound(reference.to_string()));
        }
        for copy in updated {
            if let Some(slot) = self.components_mut().find(|c| c.id == copy.id) {
                *slot = copy;
            }
        }
        Ok(())
    }

    /// Move the part so its first unit lands on `position`; further units
    /// keep their offset from it.
    pub fn move_component(&mut self, reference: &str, position: impl Into<Position>) -> Result<()> {
        let position = position.into();
        let (anchor, anchor_id) = self
            .component(reference)
            .map(|c| (c.placement.position, c.id.clone()))
            .ok_or_else(|| SchematicError::ComponentNotFound(reference.to_string()))?;
        let (dx, dy) = (position.x - anchor.x, position.y - anchor.y);
        self.update_component(reference, |c| {
            writer::shift_fields(&mut c.node, dx, dy);
            c.placement.position = if c.id == anchor_id {
                position
            } else {
                c.placement.position.offset(dx, dy)
            };
            Ok(())
        })
    }

    /// Rotate every unit by `degrees` (multiple of 90) about its origin.
    pub fn rotate_component(&mut self, reference: &str, degrees: f64) -> Result<()> {
        let delta = Rotation::from_degrees(degrees)?;
        self.update_component(reference, |c| {
            let from = c.placement;
            c.placement.rotation = c.placement.rotation.compose(delta);
            writer::reorient_fields(&mut c.node, &from, &c.placement);
            Ok(())
        })
    }

    pub fn mirror_component(&mut self, reference: &str, mirror: Mirror) -> Result<()> {
        self.update_component(reference, |c| {
            let from = c.placement;
            c.placement.mirror = mirror;
            writer::reorient_fields(&mut c.node, &from, &c.placement);
            Ok(())
        })
    }

    pub fn set_component_value(&mut self, reference: &str, value: &str) -> Result<()> {
        self.update_component(reference, |c| {
            c.value = value.to_string();
            Ok(())
        })
    }

    pub fn set_component_footprint(&mut self, reference: &str, footprint: &str) -> Result<()> {
        self.update_component(reference, |c| {
            c.footprint = footprint.to_string();
            Ok(())
        })
    }

    /// Set any field. `Value` and `Footprint` map to their typed fields;
    /// the reference changes only through [`Schematic::rename_component`].
    pub fn set_component_property(&mut self, reference: &str, key: &str, value: &str) -> Result<()> {
        check_property_key(key)?;
        self.update_component(reference, |c| {
            apply_property(c, key, value);
            Ok(())
        })
    }

    pub fn remove_component_property(&mut self, reference: &str, key: &str) -> Result<bool> {
        check_property_key(key)?;
        if matches!(key, "Value" | "Footprint") {
            return Err(SchematicError::InvalidArgument(format!(
                "{} is a mandatory field",
                key
            )));
        }
        let mut removed = false;
        self.update_component(reference, |c| {
            removed |= c.properties.remove(key).is_some();
            Ok(())
        })?;
        Ok(removed)
    }

    pub fn rename_component(&mut self, reference: &str, new_reference: &str) -> Result<()> {
        if new_reference.trim().is_empty() {
            return Err(SchematicError::InvalidArgument(
                "reference must not be empty".to_string(),
            ));
        }
        if reference != new_reference && self.component(new_reference).is_some() {
            return Err(SchematicError::DuplicateReference(new_reference.to_string()));
        }
        self.update_component(reference, |c| {
            c.reference = new_reference.to_string();
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Wires, labels, markers
    // ------------------------------------------------------------------

    pub fn add_wire(&mut self, start: impl Into<Position>, end: impl Into<Position>) -> WireId {
        let mut wire = Wire {
            id: WireId::generate(),
            start: start.into(),
            end: end.into(),
            node: SExp::list(vec![]),
        };
        wire.node = writer::wire_node(&wire);
        let id = wire.id.clone();
        self.insert_element(Element::Wire(wire));
        id
    }

    pub fn remove_wire(&mut self, id: &WireId) -> bool {
        self.remove_where(|e| matches!(e, Element::Wire(w) if &w.id == id))
    }

    /// Give an existing wire new end points.
    pub fn move_wire(
        &mut self,
        id: &WireId,
        start: impl Into<Position>,
        end: impl Into<Position>,
    ) -> Result<()> {
        let wire = self
            .elements
            .iter_mut()
            .find_map(|e| match e {
                Element::Wire(w) if &w.id == id => Some(w),
                _ => None,
            })
            .ok_or_else(|| SchematicError::WireNotFound(id.to_string()))?;
        wire.start = start.into();
        wire.end = end.into();
        writer::sync_wire(wire);
        Ok(())
    }

    pub(crate) fn insert_label(
        &mut self,
        kind: LabelKind,
        text: &str,
        position: Position,
        angle: f64,
        shape: Option<LabelShape>,
    ) -> LabelId {
        let mut label = Label {
            id: LabelId::generate(),
            kind,
            text: text.to_string(),
            position,
            angle,
            shape,
            node: SExp::list(vec![]),
        };
        label.node = writer::label_node(&label);
        let id = label.id.clone();
        self.insert_element(Element::Label(label));
        id
    }

    pub fn add_label(&mut self, text: &str, position: impl Into<Position>) -> LabelId {
        self.insert_label(LabelKind::Local, text, position.into(), 0.0, None)
    }

    pub fn add_hierarchical_label(
        &mut self,
        text: &str,
        position: impl Into<Position>,
        direction: LabelShape,
    ) -> LabelId {
        self.insert_label(
            LabelKind::Hierarchical,
            text,
            position.into(),
            0.0,
            Some(direction),
        )
    }

    pub fn add_global_label(
        &mut self,
        text: &str,
        position: impl Into<Position>,
        shape: LabelShape,
    ) -> LabelId {
        self.insert_label(LabelKind::Global, text, position.into(), 0.0, Some(shape))
    }

    pub fn remove_label(&mut self, id: &LabelId) -> bool {
        self.remove_where(|e| matches!(e, Element::Label(l) if &l.id == id))
    }

    fn update_label(&mut self, id: &LabelId, change: impl FnOnce(&mut Label)) -> Result<()> {
        let label = self
            .elements
            .iter_mut()
            .find_map(|e| match e {
                Element::Label(l) if &l.id == id => Some(l),
                _ => None,
            })
            .ok_or_else(|| SchematicError::LabelNotFound(id.to_string()))?;
        change(label);
        writer::sync_label(label);
        Ok(())
    }

    pub fn move_label(&mut self, id: &LabelId, position: impl Into<Position>) -> Result<()> {
        let position = position.into();
        self.update_label(id, |l| l.position = position)
    }

    /// Rename the net a label attaches to.
    pub fn set_label_text(&mut self, id: &LabelId, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(SchematicError::InvalidArgument(
                "label text must not be empty".to_string(),
            ));
        }
        self.update_label(id, |l| l.text = text.to_string())
    }

    pub fn add_junction(&mut self, position: impl Into<Position>) -> JunctionId {
        let mut junction = Junction {
            id: JunctionId::generate(),
            position: position.into(),
            node: SExp::list(vec![]),
        };
        junction.node = writer::junction_node(&junction);
        let id = junction.id.clone();
        self.insert_element(Element::Junction(junction));
        id
    }

    pub fn add_no_connect(&mut self, position: impl Into<Position>) -> NoConnectId {
        let mut no_connect = NoConnect {
            id: NoConnectId::generate(),
            position: position.into(),
            node: SExp::list(vec![]),
        };
        no_connect.node = writer::no_connect_node(&no_connect);
        let id = no_connect.id.clone();
        self.insert_element(Element::NoConnect(no_connect));
        id
    }

    // ------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------

    pub fn add_text(
        &mut self,
        text: &str,
        position: impl Into<Position>,
        rotation: f64,
        size: f64,
    ) -> TextId {
        let mut element = Text {
            id: TextId::generate(),
            text: text.to_string(),
            position: position.into(),
            angle: rotation,
            size,
            node: SExp::list(vec![]),
        };
        element.node = writer::text_node(&element);
        let id = element.id.clone();
        self.insert_element(Element::Text(element));
        id
    }

    pub fn add_text_box(&mut self, text: &str, position: impl Into<Position>, size: Size) -> TextId {
        let mut element = TextBox {
            id: TextId::generate(),
            text: text.to_string(),
            position: position.into(),
            size,
            node: SExp::list(vec![]),
        };
        element.node = writer::text_box_node(&element);
        let id = element.id.clone();
        self.insert_element(Element::TextBox(element));
        id
    }

    /// Removes a text or a text box.
    pub fn remove_text(&mut self, id: &TextId) -> bool {
        self.remove_where(|e| match e {
            Element::Text(t) => &t.id == id,
            Element::TextBox(t) => &t.id == id,
            _ => false,
        })
    }

    // ------------------------------------------------------------------
    // Sheets
    // ------------------------------------------------------------------

    pub fn add_sheet(
        &mut self,
        name: &str,
        file_path: &str,
        position: impl Into<Position>,
        size: Size,
    ) -> SheetId {
        let mut sheet = Sheet {
            id: SheetId::generate(),
            name: name.to_string(),
            file_name: file_path.to_string(),
            position: position.into(),
            size,
            pins: Vec::new(),
            node: SExp::list(vec![]),
        };
        let page = self.sheets().count() + 2;
        sheet.node = writer::sheet_node(&sheet, &self.project, &self.uuid, page);
        let id = sheet.id.clone();
        self.insert_element(Element::Sheet(sheet));
        id
    }

    /// `offset` is measured from the sheet's top-left corner and must lie on
    /// its border; the pin faces away from the nearest edge.
    pub fn add_sheet_pin(
        &mut self,
        sheet_id: &SheetId,
        name: &str,
        direction: LabelShape,
        offset: impl Into<Position>,
    ) -> Result<SheetPinId> {
        let offset = offset.into();
        let sheet = self
            .elements
            .iter_mut()
            .find_map(|e| match e {
                Element::Sheet(s) if &s.id == sheet_id => Some(s),
                _ => None,
            })
            .ok_or_else(|| SchematicError::SheetNotFound(sheet_id.to_string()))?;

        let angle = edge_angle(sheet.size, offset).ok_or_else(|| {
            SchematicError::InvalidArgument(format!(
                "sheet pin offset {} is not on the border of a {}x{} sheet",
                offset, sheet.size.width, sheet.size.height
            ))
        })?;

        let pin = SheetPin {
            id: SheetPinId::generate(),
            name: name.to_string(),
            direction,
            offset,
            angle,
        };
        let id = pin.id.clone();
        sheet.pins.push(pin);
        writer::sync_sheet(sheet);
        Ok(id)
    }

    pub fn remove_sheet_pin(&mut self, sheet_id: &SheetId, pin_id: &SheetPinId) -> Result<bool> {
        let sheet = self
            .elements
            .iter_mut()
            .find_map(|e| match e {
                Element::Sheet(s) if &s.id == sheet_id => Some(s),
                _ => None,
            })
            .ok_or_else(|| SchematicError::SheetNotFound(sheet_id.to_string()))?;
        let before = sheet.pins.len();
        sheet.pins.retain(|p| &p.id != pin_id);
        let removed = before != sheet.pins.len();
        if removed {
            writer::sync_sheet(sheet);
        }
        Ok(removed)
    }

    pub fn remove_sheet(&mut self, id: &SheetId) -> bool {
        self.remove_where(|e| matches!(e, Element::Sheet(s) if &s.id == id))
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// The document as `.kicad_sch` text.
    pub fn to_text(&self) -> String {
        let mut root = self.shell.clone();
        if let Some(items) = root.as_list_mut() {
            items.extend(self.elements.iter().map(|e| e.node().clone()));
        }
        SExpDocument {
            root,
            trailing: self.trailing.clone(),
        }
        .to_text()
    }
}

pub(crate) fn check_property_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(SchematicError::InvalidArgument(
            "property key must not be empty".to_string(),
        ));
    }
    if key == "Reference" {
        return Err(SchematicError::InvalidArgument(
            "use rename_component to change a reference".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn apply_property(component: &mut Component, key: &str, value: &str) {
    match key {
        "Value" => component.value = value.to_string(),
        "Footprint" => component.footprint = value.to_string(),
        _ => {
            component
                .properties
                .insert(key.to_string(), value.to_string());
        }
    }
}

/// Orientation of a sheet pin at `offset`, or `None` when off the border.
fn edge_angle(size: Size, offset: Position) -> Option<f64> {
    const EPS: f64 = 1e-4;
    let inside_x = offset.x >= -EPS && offset.x <= size.width + EPS;
    let inside_y = offset.y >= -EPS && offset.y <= size.height + EPS;
    if !(inside_x && inside_y) {
        return None;
    }
    if offset.x.abs() <= EPS {
        Some(180.0)
    } else if (offset.x - size.width).abs() <= EPS {
        Some(0.0)
    } else if offset.y.abs() <= EPS {
        Some(90.0)
    } else if (offset.y - size.height).abs() <= EPS {
        Some(270.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schematic() -> Schematic {
        Schematic::with_library("Test", Arc::new(SymbolLibrary::builtin()))
    }

    #[test]
    fn test_new_document_header() {
        let sch = schematic();
        assert_eq!(sch.version(), Some("20231120"));
        assert_eq!(sch.title(), Some("Test"));
        let text = sch.to_text();
        assert!(text.starts_with("(kicad_sch\n\t(version 20231120)\n\t(generator \"eeschema\")"));
        assert!(text.ends_with("\t(sheet_instances\n\t\t(path \"/\"\n\t\t\t(page \"1\")\n\t\t)\n\t)\n)\n"));
    }

    #[test]
    fn test_add_component_embeds_symbol_and_pins() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), Some("R_0603"))
            .unwrap();
        let r1 = sch.component("R1").unwrap();
        assert_eq!(r1.pins.len(), 2);
        assert_eq!(r1.footprint, "R_0603");
        assert!(!r1.unresolved);
        assert!(sch.embedded.contains_key("Device:R"));

        let text = sch.to_text();
        assert!(text.contains("(symbol \"Device:R\""));
        assert!(text.contains("(reference \"R1\")"));
        let lib_symbols = text.find("(lib_symbols").unwrap();
        let instance = text.find("(lib_id \"Device:R\")").unwrap();
        let tail = text.find("(sheet_instances").unwrap();
        assert!(lib_symbols < instance && instance < tail);
    }

    #[test]
    fn test_duplicate_reference_leaves_state() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        let before = sch.to_text();
        let err = sch
            .add_component("Device:C", "R1", "1u", (120.0, 100.0), None)
            .unwrap_err();
        assert!(matches!(err, SchematicError::DuplicateReference(ref r) if r == "R1"));
        assert_eq!(sch.to_text(), before);
    }

    #[test]
    fn test_unresolved_component_is_flagged() {
        let mut sch = schematic();
        sch.add_component("Nope:Thing", "U1", "X", (10.0, 10.0), None)
            .unwrap();
        let u1 = sch.component("U1").unwrap();
        assert!(u1.unresolved);
        assert!(u1.pins.is_empty());
        sch.set_component_value("U1", "Y").unwrap();
        assert_eq!(sch.component("U1").unwrap().value, "Y");
    }

    #[test]
    fn test_remove_component_prunes_symbol() {
        let mut sch = schematic();
        sch.add_component("Device:C", "C1", "1u", (10.0, 10.0), None)
            .unwrap();
        assert!(sch.remove_component("C1"));
        assert!(!sch.remove_component("C1"));
        assert!(!sch.to_text().contains("Device:C"));
    }

    #[test]
    fn test_move_and_rename() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.add_component("Device:R", "R2", "10k", (120.0, 100.0), None)
            .unwrap();
        sch.move_component("R1", (50.0, 60.0)).unwrap();
        assert_eq!(sch.component("R1").unwrap().position(), Position::new(50.0, 60.0));
        assert!(sch.to_text().contains("(at 50 60 0)"));

        assert!(matches!(
            sch.rename_component("R1", "R2"),
            Err(SchematicError::DuplicateReference(_))
        ));
        sch.rename_component("R1", "R10").unwrap();
        assert!(sch.component("R10").is_some());
        assert!(sch.component("R1").is_none());
        assert!(matches!(
            sch.move_component("R1", (0.0, 0.0)),
            Err(SchematicError::ComponentNotFound(_))
        ));
    }

    #[test]
    fn test_rotate_component_composes() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.rotate_component("R1", 90.0).unwrap();
        sch.rotate_component("R1", 270.0).unwrap();
        sch.rotate_component("R1", -90.0).unwrap();
        assert_eq!(
            sch.component("R1").unwrap().placement.rotation,
            Rotation::Deg270
        );
        assert!(matches!(
            sch.rotate_component("R1", 45.0),
            Err(SchematicError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_property_edits() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.set_component_property("R1", "Tolerance", "1%").unwrap();
        sch.set_component_property("R1", "Value", "4k7").unwrap();
        let r1 = sch.component("R1").unwrap();
        assert_eq!(r1.property("Tolerance"), Some("1%"));
        assert_eq!(r1.value, "4k7");

        assert!(sch.remove_component_property("R1", "Tolerance").unwrap());
        assert!(!sch.remove_component_property("R1", "Tolerance").unwrap());
        assert!(sch.set_component_property("R1", "Reference", "R9").is_err());
        assert!(sch.set_component_property("R1", "", "x").is_err());
    }

    #[test]
    fn test_mirror_carries_fields() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        let field_x = |sch: &Schematic| -> f64 {
            let node = &sch.component("R1").unwrap().node;
            let reference = node
                .get_all("property")
                .into_iter()
                .find(|p| p.atom_at(1) == Some("Reference"))
                .unwrap();
            reference.find("at").unwrap().number_at(1).unwrap()
        };
        let before = field_x(&sch);
        assert!(before > 100.0);

        sch.mirror_component("R1", Mirror::Y).unwrap();
        assert_eq!(sch.component("R1").unwrap().placement.mirror, Mirror::Y);
        assert!((field_x(&sch) - (200.0 - before)).abs() < 1e-6);

        sch.mirror_component("R1", Mirror::None).unwrap();
        assert!((field_x(&sch) - before).abs() < 1e-6);
    }

    #[test]
    fn test_rotation_swaps_field_angle() {
        let mut sch = schematic();
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.rotate_component("R1", 90.0).unwrap();
        let text = sch.to_text();
        assert!(text.contains("(at 100 100 90)"));
        let node = &sch.component("R1").unwrap().node;
        for property in node.get_all("property") {
            let angle = property.find("at").unwrap().number_at(3).unwrap_or(0.0);
            assert!(angle == 0.0 || angle == 90.0, "angle {}", angle);
        }
    }

    #[test]
    fn test_move_wire_and_edit_label() {
        let mut sch = schematic();
        let wire = sch.add_wire((10.0, 10.0), (20.0, 10.0));
        sch.move_wire(&wire, (10.0, 10.0), (10.0, 30.0)).unwrap();
        assert_eq!(sch.wire(&wire).unwrap().end, Position::new(10.0, 30.0));
        assert!(sch.to_text().contains("(xy 10 10) (xy 10 30)"));
        assert!(matches!(
            sch.move_wire(&WireId::from("missing"), (0.0, 0.0), (1.0, 1.0)),
            Err(SchematicError::WireNotFound(_))
        ));

        let label = sch.add_label("SDA", (10.0, 30.0));
        sch.move_label(&label, (10.0, 20.0)).unwrap();
        sch.set_label_text(&label, "SCL").unwrap();
        let l = sch.label(&label).unwrap();
        assert_eq!(l.text, "SCL");
        assert_eq!(l.position, Position::new(10.0, 20.0));
        let text = sch.to_text();
        assert!(text.contains("(label \"SCL\""));
        assert!(text.contains("(at 10 20 0)"));
        assert!(!text.contains("SDA"));
        assert!(matches!(
            sch.set_label_text(&label, " "),
            Err(SchematicError::InvalidArgument(_))
        ));
        assert!(matches!(
            sch.move_label(&LabelId::from("missing"), (0.0, 0.0)),
            Err(SchematicError::LabelNotFound(_))
        ));
    }

    #[test]
    fn test_wires_labels_texts() {
        let mut sch = schematic();
        let wire = sch.add_wire((90.0, 101.6), (101.6, 101.6));
        assert!(sch.wire(&wire).is_some());
        assert!(sch.remove_wire(&wire));
        assert!(!sch.remove_wire(&wire));

        let label = sch.add_label("TEST", (90.0, 90.0));
        let hier = sch.add_hierarchical_label("TEST_H", (90.0, 85.0), LabelShape::Input);
        assert_eq!(sch.label(&hier).unwrap().kind, LabelKind::Hierarchical);
        assert!(sch.remove_label(&label));
        assert_eq!(sch.labels().count(), 1);

        let text = sch.add_text("Circuit Title", (80.0, 70.0), 0.0, 2.0);
        let text_box = sch.add_text_box("Notes", (80.0, 60.0), Size::new(20.0, 10.0));
        assert_eq!(sch.texts().next().unwrap().size, 2.0);
        assert_eq!(sch.text_boxes().next().unwrap().size, Size::new(20.0, 10.0));
        assert!(sch.remove_text(&text));
        assert!(sch.remove_text(&text_box));
    }

    #[test]
    fn test_sheet_pins_on_border() {
        let mut sch = schematic();
        let sheet = sch.add_sheet(
            "Sub Circuit",
            "subcircuit.kicad_sch",
            (150.0, 120.0),
            Size::new(30.0, 20.0),
        );
        let pin = sch
            .add_sheet_pin(&sheet, "DATA", LabelShape::Input, (0.0, 5.0))
            .unwrap();
        let s = sch.sheet(&sheet).unwrap();
        assert_eq!(s.pins.len(), 1);
        assert_eq!(s.pins[0].angle, 180.0);
        assert_eq!(s.pin_position(&s.pins[0]), Position::new(150.0, 125.0));
        assert!(sch.to_text().contains("(pin \"DATA\" input"));

        assert!(matches!(
            sch.add_sheet_pin(&sheet, "X", LabelShape::Output, (10.0, 10.0)),
            Err(SchematicError::InvalidArgument(_))
        ));
        assert!(matches!(
            sch.add_sheet_pin(&SheetId::from("missing"), "X", LabelShape::Output, (0.0, 1.0)),
            Err(SchematicError::SheetNotFound(_))
        ));
        assert!(sch.remove_sheet_pin(&sheet, &pin).unwrap());
        assert!(!sch.to_text().contains("(pin \"DATA\""));
    }

    #[test]
    fn test_new_component_builder() {
        let mut sch = schematic();
        sch.add_component_with(
            NewComponent::new("Device:LED", "D1", "red", (50.0, 50.0))
                .rotation(180.0)
                .mirror(Mirror::Y)
                .property("Color", "red"),
        )
        .unwrap();
        let d1 = sch.component("D1").unwrap();
        assert_eq!(d1.placement.rotation, Rotation::Deg180);
        assert_eq!(d1.placement.mirror, Mirror::Y);
        assert_eq!(d1.property("Color"), Some("red"));
        assert!(sch.to_text().contains("(mirror y)"));
    }
}
