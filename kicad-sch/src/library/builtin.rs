//! Built-in symbol catalog
//!
//! A small set of KiCad standard symbols (`Device`, `power`,
//! `Connector_Generic`) is compiled into the binary so that documents can be
//! built without a KiCad installation.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

use crate::library::symbol::{parse_library, SymbolDefinition};

const EMBEDDED_DEVICE: &str = include_str!("../../symbols/Device.kicad_sym");
const EMBEDDED_POWER: &str = include_str!("../../symbols/power.kicad_sym");
const EMBEDDED_CONNECTOR_GENERIC: &str = include_str!("../../symbols/Connector_Generic.kicad_sym");

static BUILTIN: Lazy<HashMap<String, Arc<SymbolDefinition>>> = Lazy::new(|| {
    let embedded = [
        ("Device", EMBEDDED_DEVICE),
        ("power", EMBEDDED_POWER),
        ("Connector_Generic", EMBEDDED_CONNECTOR_GENERIC),
    ];

    let mut symbols = HashMap::new();
    for (library, text) in embedded {
        match parse_library(text, library) {
            Ok(parsed) => {
                for symbol in parsed {
                    symbols.insert(symbol.lib_id.clone(), Arc::new(symbol));
                }
            }
            Err(e) => {
                tracing::warn!("Failed to parse embedded library {}: {}", library, e);
            }
        }
    }
    symbols
});

/// Look up a symbol in the built-in catalog.
pub fn builtin_symbol(lib_id: &str) -> Option<Arc<SymbolDefinition>> {
    BUILTIN.get(lib_id).cloned()
}
