//! Symbol Library Index
//!
//! Resolves `Library:Name` identifiers through an ordered list of sources.
//! Results (hits and misses) are cached for the lifetime of the index; the
//! fill path is single-flight per identifier.

use once_cell::sync::{Lazy, OnceCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::LibraryConfig;
use crate::library::builtin::builtin_symbol;
use crate::library::symbol::{parse_library, SymbolDefinition};

/// A read-only catalog of symbol definitions.
pub trait SymbolSource: Send + Sync {
    fn name(&self) -> &str;
    fn lookup(&self, lib_id: &str) -> Option<Arc<SymbolDefinition>>;
}

/// Symbols compiled into the crate.
pub struct BuiltinSymbols;

impl SymbolSource for BuiltinSymbols {
    fn name(&self) -> &str {
        "builtin"
    }

    fn lookup(&self, lib_id: &str) -> Option<Arc<SymbolDefinition>> {
        builtin_symbol(lib_id)
    }
}

type LibraryFile = Arc<HashMap<String, Arc<SymbolDefinition>>>;

/// A directory of `<Library>.kicad_sym` files. Each file is parsed once on
/// first use.
pub struct SymbolDirectory {
    root: PathBuf,
    files: Mutex<HashMap<String, LibraryFile>>,
}

impl SymbolDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_file(&self, library: &str) -> LibraryFile {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = files.get(library) {
            return Arc::clone(file);
        }

        let path = self.root.join(format!("{}.kicad_sym", library));
        let mut symbols = HashMap::new();
        if path.is_file() {
            match std::fs::read_to_string(&path) {
                Ok(text) => match parse_library(&text, library) {
                    Ok(parsed) => {
                        tracing::debug!("Loaded {} symbols from {:?}", parsed.len(), path);
                        for symbol in parsed {
                            symbols.insert(symbol.lib_id.clone(), Arc::new(symbol));
                        }
                    }
                    Err(e) => tracing::warn!("Failed to parse symbol library {:?}: {}", path, e),
                },
                Err(e) => tracing::warn!("Failed to read symbol library {:?}: {}", path, e),
            }
        }

        let file = Arc::new(symbols);
        files.insert(library.to_string(), Arc::clone(&file));
        file
    }
}

impl SymbolSource for SymbolDirectory {
    fn name(&self) -> &str {
        self.root.to_str().unwrap_or("directory")
    }

    fn lookup(&self, lib_id: &str) -> Option<Arc<SymbolDefinition>> {
        let (library, _) = lib_id.split_once(':')?;
        self.load_file(library).get(lib_id).cloned()
    }
}

type Slot = Arc<OnceCell<Option<Arc<SymbolDefinition>>>>;

pub struct SymbolLibrary {
    sources: Vec<Box<dyn SymbolSource>>,
    cache: Mutex<HashMap<String, Slot>>,
}

static GLOBAL: Lazy<Arc<SymbolLibrary>> =
    Lazy::new(|| Arc::new(SymbolLibrary::from_config(&LibraryConfig::from_env())));

impl SymbolLibrary {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide index built from the environment on first use.
    pub fn global() -> Arc<SymbolLibrary> {
        Arc::clone(&GLOBAL)
    }

    /// Directory sources are consulted before the built-in catalog so that an
    /// installed KiCad library takes precedence.
    pub fn from_config(config: &LibraryConfig) -> Self {
        let mut library = Self::new();
        for dir in &config.symbol_dirs {
            library.add_source(Box::new(SymbolDirectory::new(dir)));
        }
        if config.include_builtin {
            library.add_source(Box::new(BuiltinSymbols));
        }
        library
    }

    pub fn builtin() -> Self {
        let mut library = Self::new();
        library.add_source(Box::new(BuiltinSymbols));
        library
    }

    pub fn add_source(&mut self, source: Box<dyn SymbolSource>) {
        self.sources.push(source);
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> + '_ {
        self.sources.iter().map(|s| s.name())
    }

    /// Resolve `lib_id`, or `None` when no source knows it.
    pub fn resolve(&self, lib_id: &str) -> Option<Arc<SymbolDefinition>> {
        let slot = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(cache.entry(lib_id.to_string()).or_default())
        };
        slot.get_or_init(|| {
            let found = self.sources.iter().find_map(|source| source.lookup(lib_id));
            if found.is_none() {
                tracing::warn!("Symbol {} not found in any library", lib_id);
            }
            found
        })
        .clone()
    }
}

impl Default for SymbolLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for SymbolLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolLibrary")
            .field("sources", &self.sources().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        hits: Arc<AtomicUsize>,
    }

    impl SymbolSource for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn lookup(&self, lib_id: &str) -> Option<Arc<SymbolDefinition>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            builtin_symbol(lib_id)
        }
    }

    #[test]
    fn test_resolve_builtin() {
        let library = SymbolLibrary::builtin();
        assert!(library.resolve("Device:R").is_some());
        assert!(library.resolve("Device:DoesNotExist").is_none());
    }

    #[test]
    fn test_resolution_is_cached_including_misses() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut library = SymbolLibrary::new();
        library.add_source(Box::new(Counting { hits: Arc::clone(&hits) }));

        library.resolve("Device:C");
        library.resolve("Device:C");
        library.resolve("Nope:X");
        library.resolve("Nope:X");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_resolution_single_flight() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut library = SymbolLibrary::new();
        library.add_source(Box::new(Counting { hits: Arc::clone(&hits) }));
        let library = Arc::new(library);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let library = Arc::clone(&library);
                std::thread::spawn(move || library.resolve("Device:L").is_some())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Custom.kicad_sym"),
            r#"(kicad_symbol_lib (version 20231120)
  (symbol "Jumper" (property "Reference" "JP" (at 0 0 0))
    (symbol "Jumper_1_1"
      (pin passive line (at -2.54 0 0) (length 1.27) (name "A") (number "1"))
      (pin passive line (at 2.54 0 180) (length 1.27) (name "B") (number "2")))))"#,
        )
        .unwrap();

        let config = LibraryConfig {
            symbol_dirs: vec![dir.path().to_path_buf()],
            include_builtin: true,
        };
        let library = SymbolLibrary::from_config(&config);
        let jumper = library.resolve("Custom:Jumper").unwrap();
        assert_eq!(jumper.pins.len(), 2);
        assert_eq!(jumper.reference_prefix(), "JP");
        assert!(library.resolve("Device:R").is_some());
    }
}
