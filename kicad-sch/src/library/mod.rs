//! Symbol Library Index and symbol definitions.

pub mod builtin;
pub mod index;
pub mod symbol;

pub use index::{BuiltinSymbols, SymbolDirectory, SymbolLibrary, SymbolSource};
pub use symbol::{parse_library, ElectricalType, SymbolDefinition, SymbolPin};
