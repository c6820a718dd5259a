//! Errors, configuration and validation reports shared by every module.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::analyzer::rules::{Issue, Severity};
use crate::parser::sexp::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum SchematicError {
    #[error("Reference {0} already exists")]
    DuplicateReference(String),
    #[error("Component {0} not found")]
    ComponentNotFound(String),
    #[error("Pin {pin} not found on {reference}")]
    PinNotFound { reference: String, pin: String },
    #[error("Symbol {lib_id} of {reference} could not be resolved")]
    UnresolvedSymbol { reference: String, lib_id: String },
    #[error("Wire {0} not found")]
    WireNotFound(String),
    #[error("Label {0} not found")]
    LabelNotFound(String),
    #[error("Sheet {0} not found")]
    SheetNotFound(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Schematic has no file association")]
    NoFileAssociation,
}

impl SchematicError {
    /// Stable identifier for structured failures.
    pub fn kind(&self) -> &'static str {
        match self {
            SchematicError::DuplicateReference(_) => "duplicate_reference",
            SchematicError::ComponentNotFound(_) => "component_not_found",
            SchematicError::PinNotFound { .. } => "pin_not_found",
            SchematicError::UnresolvedSymbol { .. } => "unresolved_symbol",
            SchematicError::WireNotFound(_) => "wire_not_found",
            SchematicError::LabelNotFound(_) => "label_not_found",
            SchematicError::SheetNotFound(_) => "sheet_not_found",
            SchematicError::Parse(_) => "parse_error",
            SchematicError::Io(_) => "io_error",
            SchematicError::InvalidArgument(_) => "invalid_argument",
            SchematicError::NoFileAssociation => "no_file_association",
        }
    }
}

impl From<ParseError> for SchematicError {
    fn from(e: ParseError) -> Self {
        SchematicError::Parse(e.to_string())
    }
}

pub type Result<T, E = SchematicError> = std::result::Result<T, E>;

/// Where symbol definitions are looked up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub symbol_dirs: Vec<PathBuf>,
    pub include_builtin: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            symbol_dirs: vec![],
            include_builtin: true,
        }
    }
}

const WELL_KNOWN_SYMBOL_DIRS: &[&str] = &[
    "/usr/share/kicad/symbols",
    "/usr/local/share/kicad/symbols",
    "/Applications/KiCad/KiCad.app/Contents/SharedSupport/symbols",
    "C:\\Program Files\\KiCad\\8.0\\share\\kicad\\symbols",
];

impl LibraryConfig {
    /// Directories from `KICAD_SYMBOL_DIR` (a path list), then the standard
    /// KiCad install locations that exist on this machine.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for var in ["KICAD_SYMBOL_DIR", "KICAD8_SYMBOL_DIR"] {
            if let Some(value) = std::env::var_os(var) {
                config
                    .symbol_dirs
                    .extend(std::env::split_paths(&value).filter(|p| p.is_dir()));
            }
        }
        for dir in WELL_KNOWN_SYMBOL_DIRS {
            let path = PathBuf::from(dir);
            if path.is_dir() && !config.symbol_dirs.contains(&path) {
                config.symbol_dirs.push(path);
            }
        }
        tracing::debug!("Symbol directories: {:?}", config.symbol_dirs);
        config
    }
}

/// Options for validation runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    /// Bounding boxes may share up to this much width and height (mm)
    /// before they count as overlapping.
    pub overlap_tolerance: f64,
    /// Enabled rule ids; empty enables every rule.
    pub rules: Vec<String>,
    /// Report warnings as errors.
    pub strict_mode: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            overlap_tolerance: 0.0,
            rules: vec![],
            strict_mode: false,
        }
    }
}

impl ValidationOptions {
    pub fn rule_enabled(&self, rule_id: &str) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|r| r == rule_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
    pub stats: ValidationStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
}

impl ValidationReport {
    pub fn new(issues: Vec<Issue>) -> Self {
        let stats = issues_to_stats(&issues);
        Self { issues, stats }
    }

    pub fn has_errors(&self) -> bool {
        self.stats.errors > 0
    }

    pub fn total_issues(&self) -> usize {
        self.stats.errors + self.stats.warnings + self.stats.info
    }

    pub fn by_rule<'a>(&'a self, rule_id: &'a str) -> impl Iterator<Item = &'a Issue> + 'a {
        self.issues.iter().filter(move |i| i.rule_id == rule_id)
    }
}

fn issues_to_stats(issues: &[Issue]) -> ValidationStats {
    let mut stats = ValidationStats::default();
    for i in issues {
        match i.severity {
            Severity::Error => stats.errors += 1,
            Severity::Warning => stats.warnings += 1,
            Severity::Info => stats.info += 1,
        }
    }
    stats
}
