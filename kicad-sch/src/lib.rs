//! kicad-sch - KiCad schematic document engine
//!
//! This library reads, edits and writes KiCad `.kicad_sch` documents. It
//! resolves symbol pin geometry, derives nets from wires and labels, runs
//! design checks and keeps unmodified parts of a file byte-identical on
//! save.
//!
//! # Quick Start
//!
//! ```no_run
//! use kicad_sch::prelude::*;
//!
//! let mut sch = Schematic::new("Divider");
//! sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)?;
//! sch.add_component("Device:R", "R2", "10k", (100.0, 120.0), None)?;
//! sch.connect_pins_with_labels("R1", "2", "R2", "1", "VOUT")?;
//!
//! for issue in sch.validate() {
//!     println!("{:?}: {}", issue.severity, issue.message);
//! }
//! sch.save_as("divider.kicad_sch")?;
//! # Ok::<(), kicad_sch::SchematicError>(())
//! ```
//!
//! # Features
//!
//! - **Lossless round-trip**: untouched elements serialize exactly as read
//! - **Pin geometry**: absolute pin coordinates under rotation and mirroring
//! - **Connectivity**: nets derived from wires, labels and power symbols
//! - **Queries**: attribute filters, area search and bulk field updates
//! - **Validation**: dangling pins, overlaps, sheet pins and more

pub mod analyzer;
pub mod commands;
pub mod connectivity;
pub mod core;
pub mod geometry;
pub mod library;
pub mod parser;
pub mod persistence;
pub mod query;
pub mod schema;
pub mod schematic;

// Re-export main types
pub use analyzer::rules::{Issue, Rule, RuleContext, RulesEngine, Severity};
pub use commands::{Command, CommandFailure, CommandOutput, Session};
pub use connectivity::{Net, PinInfo, PinIter, PinRef};
pub use crate::core::{
    LibraryConfig, Result, SchematicError, ValidationOptions, ValidationReport, ValidationStats,
};
pub use geometry::{Mirror, Placement, Position, Rect, Rotation};
pub use library::{SymbolDefinition, SymbolLibrary, SymbolSource};
pub use parser::kicad::KicadParser;
pub use query::{ComponentCriteria, ComponentUpdate};
pub use schema::*;
pub use schematic::{NewComponent, Schematic};

/// Load a schematic file (convenience wrapper).
pub fn load_schematic(path: &std::path::Path) -> Result<Schematic> {
    Schematic::load(path)
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        ComponentCriteria, ComponentUpdate, Issue, LabelShape, Mirror, NewComponent, Position,
        Schematic, SchematicError, Severity, Size, SymbolLibrary, ValidationOptions,
    };
}
