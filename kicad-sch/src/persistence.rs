//! Loading, saving, cloning and backing up documents.

use atomicwrites::{AtomicFile, OverwriteBehavior};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{Result, SchematicError};
use crate::library::SymbolLibrary;
use crate::parser::kicad::KicadParser;
use crate::parser::writer;
use crate::schema::*;
use crate::schematic::Schematic;

impl Schematic {
    /// Read a `.kicad_sch` file, resolving symbols through the process-wide
    /// library.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_library(path, SymbolLibrary::global())
    }

    pub fn load_with_library(path: impl AsRef<Path>, library: Arc<SymbolLibrary>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let parsed = KicadParser::parse_schematic_str(&content)?;
        let schematic = Self::from_parsed(parsed, library, Some(path.to_path_buf()));
        tracing::info!(
            "Loaded {} ({} components)",
            path.display(),
            schematic.components().count()
        );
        Ok(schematic)
    }

    /// Parse document text that has no file association.
    pub fn parse_str(content: &str, library: Arc<SymbolLibrary>) -> Result<Self> {
        let parsed = KicadParser::parse_schematic_str(content)?;
        Ok(Self::from_parsed(parsed, library, None))
    }

    /// Write back to the associated file.
    pub fn save(&self) -> Result<()> {
        let path = self
            .file_path
            .as_deref()
            .ok_or(SchematicError::NoFileAssociation)?;
        write_atomic(path, &self.to_text())?;
        tracing::info!("Saved {}", path.display());
        Ok(())
    }

    /// Write to `path` and make it the document's file.
    pub fn save_as(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_atomic(path, &self.to_text())?;
        self.file_path = Some(path.to_path_buf());
        tracing::info!("Saved {}", path.display());
        Ok(())
    }

    /// Write the current state next to the document's file as
    /// `<stem><suffix>.<ext>`. The file association is unchanged.
    pub fn backup(&self, suffix: &str) -> Result<PathBuf> {
        let path = self
            .file_path
            .as_deref()
            .ok_or(SchematicError::NoFileAssociation)?;
        let target = backup_path(path, suffix);
        write_atomic(&target, &self.to_text())?;
        tracing::info!("Backed up {} to {}", path.display(), target.display());
        Ok(target)
    }

    /// Deep copy named `new_name` sharing no identity token with `self`.
    /// The copy has no file association.
    pub fn clone_as(&self, new_name: &str) -> Schematic {
        let mut copy = self.clone();
        let mut map = HashMap::new();
        for element in &mut copy.elements {
            writer::regenerate_uuids(element.node_mut(), &mut map);
        }
        for element in &mut copy.elements {
            let node = element.node_mut();
            writer::remap_paths(node, &map);
            node.walk_mut(&mut |n| {
                if n.tag() == Some("project") {
                    n.set_atom(1, new_name);
                }
            });
            if node.tag() == Some("title_block") {
                if let Some(title) = node.find_mut("title") {
                    title.set_atom(1, new_name);
                }
            }
            remap_ids(element, &map);
        }

        copy.uuid = map
            .get(&self.uuid)
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        copy.project = new_name.to_string();
        copy.file_path = None;
        tracing::debug!("Cloned {} as {}", self.project, new_name);
        copy
    }
}

impl std::str::FromStr for Schematic {
    type Err = SchematicError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s, SymbolLibrary::global())
    }
}

fn fresh(map: &HashMap<String, String>, old: &str) -> String {
    map.get(old)
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Point typed ids at the tokens written into the node.
fn remap_ids(element: &mut Element, map: &HashMap<String, String>) {
    match element {
        Element::Component(c) => {
            c.id = ComponentId(fresh(map, c.id.as_str()));
            for (_, uuid) in &mut c.pins {
                *uuid = fresh(map, uuid);
            }
        }
        Element::Wire(w) => w.id = WireId(fresh(map, w.id.as_str())),
        Element::Label(l) => l.id = LabelId(fresh(map, l.id.as_str())),
        Element::Text(t) => t.id = TextId(fresh(map, t.id.as_str())),
        Element::TextBox(t) => t.id = TextId(fresh(map, t.id.as_str())),
        Element::Sheet(s) => {
            s.id = SheetId(fresh(map, s.id.as_str()));
            for pin in &mut s.pins {
                pin.id = SheetPinId(fresh(map, pin.id.as_str()));
            }
        }
        Element::Junction(j) => j.id = JunctionId(fresh(map, j.id.as_str())),
        Element::NoConnect(n) => n.id = NoConnectId(fresh(map, n.id.as_str())),
        Element::LibSymbols(_) | Element::Other(_) => {}
    }
}

fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    path.with_file_name(name)
}

fn write_atomic(path: &Path, text: &str) -> Result<()> {
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|f| {
            f.write_all(text.as_bytes())?;
            f.flush()
        })
        .map_err(|err| match err {
            atomicwrites::Error::Internal(e) | atomicwrites::Error::User(e) => SchematicError::Io(e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn library() -> Arc<SymbolLibrary> {
        Arc::new(SymbolLibrary::builtin())
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/tmp/board.kicad_sch"), "_bak"),
            PathBuf::from("/tmp/board_bak.kicad_sch")
        );
        assert_eq!(backup_path(Path::new("notes"), ".old"), PathBuf::from("notes.old"));
    }

    #[test]
    fn test_save_requires_file_association() {
        let sch = Schematic::with_library("Unsaved", library());
        assert!(matches!(sch.save(), Err(SchematicError::NoFileAssociation)));
        assert!(matches!(sch.backup("_bak"), Err(SchematicError::NoFileAssociation)));
    }

    #[test]
    fn test_save_as_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.kicad_sch");
        let mut sch = Schematic::with_library("board", library());
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.save_as(&path).unwrap();
        assert_eq!(sch.file_path(), Some(path.as_path()));

        let loaded = Schematic::load_with_library(&path, library()).unwrap();
        assert_eq!(loaded.to_text(), sch.to_text());
        assert_eq!(loaded.uuid(), sch.uuid());
        assert_eq!(loaded.component("R1").unwrap().value, "10k");
        assert_eq!(loaded.project(), "board");
    }

    #[test]
    fn test_backup_keeps_association() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("board.kicad_sch");
        let mut sch = Schematic::with_library("board", library());
        sch.save_as(&path).unwrap();
        sch.add_label("A", (10.0, 10.0));

        let backup = sch.backup("_bak").unwrap();
        assert_eq!(backup, dir.path().join("board_bak.kicad_sch"));
        assert_eq!(sch.file_path(), Some(path.as_path()));
        assert_eq!(fs::read_to_string(&backup).unwrap(), sch.to_text());
        assert_ne!(fs::read_to_string(&path).unwrap(), sch.to_text());
    }

    #[test]
    fn test_clone_shares_no_tokens() {
        let mut sch = Schematic::with_library("board", library());
        sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
            .unwrap();
        sch.add_wire((0.0, 0.0), (10.0, 0.0));
        let sheet = sch.add_sheet("Sub", "sub.kicad_sch", (50.0, 50.0), Size::new(20.0, 10.0));
        sch.add_sheet_pin(&sheet, "IN", LabelShape::Input, (0.0, 5.0))
            .unwrap();

        let mut copy = sch.clone_as("copy");
        let original: HashSet<&str> = sch.elements().iter().filter_map(Element::uuid).collect();
        let cloned: HashSet<&str> = copy.elements().iter().filter_map(Element::uuid).collect();
        assert_eq!(original.len(), cloned.len());
        assert!(original.is_disjoint(&cloned));
        assert_ne!(copy.uuid(), sch.uuid());
        assert_eq!(copy.title(), Some("copy"));
        assert!(copy.file_path().is_none());

        let text = copy.to_text();
        assert!(!text.contains(sch.uuid()));
        assert!(text.contains(&format!("(path \"/{}\"", copy.uuid())));

        copy.set_component_value("R1", "22k").unwrap();
        assert_eq!(sch.component("R1").unwrap().value, "10k");
        assert_eq!(copy.component("R1").unwrap().value, "22k");
    }
}
