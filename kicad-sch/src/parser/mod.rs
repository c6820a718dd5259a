pub mod kicad;
pub mod sexp;
pub mod writer;

// Re-export for convenience
pub use kicad::{KicadParseError, KicadParser, ParsedSchematic};
pub use sexp::{ParseError, SExp, SExpDocument, SExpParser};
