use std::collections::HashMap;

use object::{Object, ObjectSymbol};

use crate::jmp_table::JmpTable;
use crate::RelocError;

/// Looks up a symbol's address in the target process's already-loaded
/// image. `patch-engine` implements this over the live object files it has
/// scanned; tests use [`StaticResolver`].
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// A fixed name -> address table, for tests and for callers that already
/// know every symbol they need to hand in.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver(pub HashMap<String, u64>);

impl SymbolResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }
}

fn undefined_symbol_names<'a>(elf: &'a object::File<'a>) -> impl Iterator<Item = &'a str> {
    elf.symbols()
        .filter(|s| s.is_undefined())
        .filter_map(|s| s.name().ok())
        .filter(|name| !name.is_empty())
}

/// Counts the external symbols the patch object references but does not
/// define, each of which needs a jump-table slot.
pub fn count_undefined(elf: &object::File) -> usize {
    undefined_symbol_names(elf).count()
}

/// Resolves every undefined symbol against `resolver`, binding each one to
/// a slot in `jmp_table`, and returns the name -> address map relocation
/// uses for direct (non-jump-table) references.
pub fn resolve(
    elf: &object::File,
    resolver: &dyn SymbolResolver,
    jmp_table: &mut JmpTable,
) -> Result<HashMap<String, u64>, RelocError> {
    let mut resolved = HashMap::new();

    for name in undefined_symbol_names(elf) {
        if resolved.contains_key(name) {
            continue;
        }
        let addr = resolver
            .resolve(name)
            .ok_or_else(|| RelocError::UndefinedSymbol(name.to_string()))?;
        jmp_table.bind_next(name, addr)?;
        resolved.insert(name.to_string(), addr);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_looks_up_by_name() {
        let mut map = HashMap::new();
        map.insert("malloc".to_string(), 0x7f00_0000);
        let resolver = StaticResolver(map);
        assert_eq!(resolver.resolve("malloc"), Some(0x7f00_0000));
        assert_eq!(resolver.resolve("free"), None);
    }
}
