//! Flat-record command surface for a transport layer.
//!
//! A request is `{"tool": "<name>", "arguments": {...}}`. Every command
//! either returns a serializable payload or a `{kind, message}` failure.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::connectivity::{Net, PinInfo};
use crate::core::{SchematicError, ValidationOptions, ValidationReport};
use crate::geometry::Position;
use crate::library::SymbolLibrary;
use crate::query::{ComponentCriteria, ComponentUpdate};
use crate::schema::*;
use crate::schematic::{NewComponent, Schematic};

fn default_text_size() -> f64 {
    1.27
}

fn default_backup_suffix() -> String {
    ".bak".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum Command {
    CreateSchematic {
        name: String,
    },
    LoadSchematic {
        file_path: PathBuf,
    },
    /// Saves to `file_path` when given, else to the current file.
    SaveSchematic {
        #[serde(default)]
        file_path: Option<PathBuf>,
    },
    /// Replaces the open document with an independent copy.
    CloneSchematic {
        new_name: String,
    },
    BackupSchematic {
        #[serde(default = "default_backup_suffix")]
        suffix: String,
    },
    AddComponent {
        lib_id: String,
        reference: String,
        value: String,
        position: [f64; 2],
        #[serde(default)]
        footprint: Option<String>,
        #[serde(default)]
        rotation: f64,
    },
    RemoveComponent {
        reference: String,
    },
    GetComponentPinPosition {
        reference: String,
        pin_number: String,
    },
    ListComponentPins {
        reference: String,
    },
    AddLabelToPin {
        reference: String,
        pin_number: String,
        text: String,
    },
    ConnectPinsWithLabels {
        comp1_ref: String,
        pin1: String,
        comp2_ref: String,
        pin2: String,
        net_name: String,
    },
    AddWire {
        start: [f64; 2],
        end: [f64; 2],
    },
    RemoveWire {
        wire_id: String,
    },
    AddLabel {
        text: String,
        position: [f64; 2],
    },
    RemoveLabel {
        label_id: String,
    },
    AddHierarchicalLabel {
        text: String,
        position: [f64; 2],
        #[serde(default)]
        shape: LabelShape,
    },
    AddText {
        text: String,
        position: [f64; 2],
        #[serde(default)]
        rotation: f64,
        #[serde(default = "default_text_size")]
        size: f64,
    },
    AddTextBox {
        text: String,
        position: [f64; 2],
        size: [f64; 2],
    },
    AddSheet {
        name: String,
        file_name: String,
        position: [f64; 2],
        size: [f64; 2],
    },
    AddSheetPin {
        sheet_uuid: String,
        name: String,
        #[serde(default)]
        direction: LabelShape,
        offset: [f64; 2],
    },
    FilterComponents(ComponentCriteria),
    ComponentsInArea {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    },
    BulkUpdateComponents {
        #[serde(default)]
        criteria: ComponentCriteria,
        updates: ComponentUpdate,
    },
    ValidateSchematic(ValidationOptions),
    ListNets {},
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateSchematic { .. } => "create_schematic",
            Command::LoadSchematic { .. } => "load_schematic",
            Command::SaveSchematic { .. } => "save_schematic",
            Command::CloneSchematic { .. } => "clone_schematic",
            Command::BackupSchematic { .. } => "backup_schematic",
            Command::AddComponent { .. } => "add_component",
            Command::RemoveComponent { .. } => "remove_component",
            Command::GetComponentPinPosition { .. } => "get_component_pin_position",
            Command::ListComponentPins { .. } => "list_component_pins",
            Command::AddLabelToPin { .. } => "add_label_to_pin",
            Command::ConnectPinsWithLabels { .. } => "connect_pins_with_labels",
            Command::AddWire { .. } => "add_wire",
            Command::RemoveWire { .. } => "remove_wire",
            Command::AddLabel { .. } => "add_label",
            Command::RemoveLabel { .. } => "remove_label",
            Command::AddHierarchicalLabel { .. } => "add_hierarchical_label",
            Command::AddText { .. } => "add_text",
            Command::AddTextBox { .. } => "add_text_box",
            Command::AddSheet { .. } => "add_sheet",
            Command::AddSheetPin { .. } => "add_sheet_pin",
            Command::FilterComponents(_) => "filter_components",
            Command::ComponentsInArea { .. } => "components_in_area",
            Command::BulkUpdateComponents { .. } => "bulk_update_components",
            Command::ValidateSchematic(_) => "validate_schematic",
            Command::ListNets {} => "list_nets",
        }
    }
}

/// Success payloads, serialized without a variant tag.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Schematic {
        uuid: String,
        name: String,
        file_path: Option<PathBuf>,
    },
    Path {
        file_path: PathBuf,
    },
    Id {
        id: String,
    },
    Removed {
        removed: bool,
    },
    Position(Position),
    Pins {
        pins: Vec<PinInfo>,
    },
    Labels {
        label_ids: [LabelId; 2],
    },
    Components {
        component_ids: Vec<ComponentId>,
    },
    Count {
        count: usize,
    },
    Validation(ValidationReport),
    Nets {
        nets: Vec<Net>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{kind}: {message}")]
pub struct CommandFailure {
    pub kind: String,
    pub message: String,
}

impl CommandFailure {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    fn no_schematic() -> Self {
        Self::new(
            "no_schematic",
            "No schematic is open; create or load one first",
        )
    }
}

impl From<SchematicError> for CommandFailure {
    fn from(e: SchematicError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// The open document plus the library used to resolve its symbols.
#[derive(Debug)]
pub struct Session {
    schematic: Option<Schematic>,
    library: Arc<SymbolLibrary>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SymbolLibrary::global())
    }
}

impl Session {
    pub fn new(library: Arc<SymbolLibrary>) -> Self {
        Self {
            schematic: None,
            library,
        }
    }

    pub fn schematic(&self) -> Option<&Schematic> {
        self.schematic.as_ref()
    }

    fn current(&mut self) -> Result<&mut Schematic, CommandFailure> {
        self.schematic.as_mut().ok_or_else(CommandFailure::no_schematic)
    }

    fn describe(schematic: &Schematic) -> CommandOutput {
        CommandOutput::Schematic {
            uuid: schematic.uuid().to_string(),
            name: schematic.project().to_string(),
            file_path: schematic.file_path().map(PathBuf::from),
        }
    }

    pub fn execute(&mut self, command: Command) -> Result<CommandOutput, CommandFailure> {
        tracing::debug!("Executing {}", command.name());
        let output = match command {
            Command::CreateSchematic { name } => {
                let schematic = Schematic::with_library(&name, Arc::clone(&self.library));
                let output = Self::describe(&schematic);
                self.schematic = Some(schematic);
                output
            }
            Command::LoadSchematic { file_path } => {
                let schematic = Schematic::load_with_library(&file_path, Arc::clone(&self.library))?;
                let output = Self::describe(&schematic);
                self.schematic = Some(schematic);
                output
            }
            Command::SaveSchematic { file_path } => {
                let schematic = self.current()?;
                match file_path {
                    Some(path) => schematic.save_as(&path)?,
                    None => schematic.save()?,
                }
                Self::describe(schematic)
            }
            Command::CloneSchematic { new_name } => {
                let copy = self.current()?.clone_as(&new_name);
                let output = Self::describe(&copy);
                self.schematic = Some(copy);
                output
            }
            Command::BackupSchematic { suffix } => CommandOutput::Path {
                file_path: self.current()?.backup(&suffix)?,
            },
            Command::AddComponent {
                lib_id,
                reference,
                value,
                position,
                footprint,
                rotation,
            } => {
                let mut new = NewComponent::new(lib_id, reference, value, position).rotation(rotation);
                new.footprint = footprint;
                CommandOutput::Id {
                    id: self.current()?.add_component_with(new)?.to_string(),
                }
            }
            Command::RemoveComponent { reference } => CommandOutput::Removed {
                removed: self.current()?.remove_component(&reference),
            },
            Command::GetComponentPinPosition {
                reference,
                pin_number,
            } => CommandOutput::Position(self.current()?.pin_position(&reference, &pin_number)?),
            Command::ListComponentPins { reference } => CommandOutput::Pins {
                pins: self.current()?.list_pins(&reference)?.collect(),
            },
            Command::AddLabelToPin {
                reference,
                pin_number,
                text,
            } => CommandOutput::Id {
                id: self
                    .current()?
                    .add_label_to_pin(&reference, &pin_number, &text)?
                    .to_string(),
            },
            Command::ConnectPinsWithLabels {
                comp1_ref,
                pin1,
                comp2_ref,
                pin2,
                net_name,
            } => CommandOutput::Labels {
                label_ids: self.current()?.connect_pins_with_labels(
                    &comp1_ref, &pin1, &comp2_ref, &pin2, &net_name,
                )?,
            },
            Command::AddWire { start, end } => CommandOutput::Id {
                id: self.current()?.add_wire(start, end).to_string(),
            },
            Command::RemoveWire { wire_id } => {
                let schematic = self.current()?;
                let id = WireId::from(wire_id);
                if !schematic.remove_wire(&id) {
                    return Err(SchematicError::WireNotFound(id.to_string()).into());
                }
                CommandOutput::Removed { removed: true }
            }
            Command::AddLabel { text, position } => CommandOutput::Id {
                id: self.current()?.add_label(&text, position).to_string(),
            },
            Command::RemoveLabel { label_id } => {
                let schematic = self.current()?;
                let id = LabelId::from(label_id);
                if !schematic.remove_label(&id) {
                    return Err(SchematicError::LabelNotFound(id.to_string()).into());
                }
                CommandOutput::Removed { removed: true }
            }
            Command::AddHierarchicalLabel {
                text,
                position,
                shape,
            } => CommandOutput::Id {
                id: self
                    .current()?
                    .add_hierarchical_label(&text, position, shape)
                    .to_string(),
            },
            Command::AddText {
                text,
                position,
                rotation,
                size,
            } => CommandOutput::Id {
                id: self
                    .current()?
                    .add_text(&text, position, rotation, size)
                    .to_string(),
            },
            Command::AddTextBox {
                text,
                position,
                size: [width, height],
            } => CommandOutput::Id {
                id: self
                    .current()?
                    .add_text_box(&text, position, Size::new(width, height))
                    .to_string(),
            },
            Command::AddSheet {
                name,
                file_name,
                position,
                size: [width, height],
            } => CommandOutput::Id {
                id: self
                    .current()?
                    .add_sheet(&name, &file_name, position, Size::new(width, height))
                    .to_string(),
            },
            Command::AddSheetPin {
                sheet_uuid,
                name,
                direction,
                offset,
            } => CommandOutput::Id {
                id: self
                    .current()?
                    .add_sheet_pin(&SheetId::from(sheet_uuid), &name, direction, offset)?
                    .to_string(),
            },
            Command::FilterComponents(criteria) => CommandOutput::Components {
                component_ids: self.current()?.filter(&criteria),
            },
            Command::ComponentsInArea { x1, y1, x2, y2 } => CommandOutput::Components {
                component_ids: self.current()?.in_area(x1, y1, x2, y2),
            },
            Command::BulkUpdateComponents { criteria, updates } => CommandOutput::Count {
                count: self.current()?.bulk_update(&criteria, &updates)?,
            },
            Command::ValidateSchematic(options) => {
                CommandOutput::Validation(self.current()?.validate_with(&options, &HashMap::new()))
            }
            Command::ListNets {} => CommandOutput::Nets {
                nets: self.current()?.nets(),
            },
        };
        Ok(output)
    }

    /// Execute a JSON request and wrap the outcome as
    /// `{"success": true, "result": ...}` or `{"success": false, "error": ...}`.
    pub fn execute_json(&mut self, request: &str) -> Value {
        let outcome = serde_json::from_str::<Command>(request)
            .map_err(|e| CommandFailure::new("invalid_request", e.to_string()))
            .and_then(|command| self.execute(command));
        match outcome {
            Ok(output) => json!({ "success": true, "result": output }),
            Err(failure) => {
                tracing::warn!("Command failed: {}", failure);
                json!({ "success": false, "error": failure })
            }
        }
    }
}
