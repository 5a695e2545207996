use std::collections::HashMap;

use object::{Object, ObjectSymbol};
use patch_reloc::SymbolResolver;
use proc_scan::LoadedObject;

/// Resolves undefined symbols in a patch object against every library
/// currently loaded in the target, the way the dynamic linker itself
/// would: first match wins, libraries searched in `objects` order (the
/// order `load_libraries` produced them in, i.e. `/proc/<pid>/maps` order).
pub struct LiveSymbolResolver {
    symbols: HashMap<String, u64>,
}

impl LiveSymbolResolver {
    pub fn from_objects(objects: &[LoadedObject]) -> Self {
        let mut symbols = HashMap::new();
        for object in objects {
            let Ok(data) = std::fs::read(&object.path) else { continue };
            let Ok(file) = object::File::parse(&*data) else { continue };
            for symbol in file.dynamic_symbols() {
                let Ok(name) = symbol.name() else { continue };
                if name.is_empty() || symbol.is_undefined() {
                    continue;
                }
                symbols.entry(name.to_string()).or_insert(object.base + symbol.address());
            }
        }
        Self { symbols }
    }
}

impl SymbolResolver for LiveSymbolResolver {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_list_resolves_nothing() {
        let resolver = LiveSymbolResolver::from_objects(&[]);
        assert_eq!(resolver.resolve("malloc"), None);
    }
}
