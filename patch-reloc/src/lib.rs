//! ELF section parsing, symbol resolution and relocation for the code
//! embedded in a patch blob: the `load_patch_info`, `resolve`, `relocate`,
//! `count_undefined` and `new_jmp_table` external collaborators.
//!
//! `patch-engine` treats this crate as a service over an already-parsed
//! `object::File`: it never walks ELF structures itself.

mod info;
mod jmp_table;
mod reloc;
mod resolve;

pub use info::load_patch_info;
pub use jmp_table::{new_jmp_table, JmpTable, JMP_ENTRY_SIZE};
pub use reloc::relocate;
pub use resolve::{count_undefined, resolve, StaticResolver, SymbolResolver};

#[derive(Debug, thiserror::Error)]
pub enum RelocError {
    #[error("patch object has no '{0}' section")]
    MissingSection(String),
    #[error("malformed patch info record ({0} bytes)")]
    MalformedInfo(usize),
    #[error("ELF parse error: {0}")]
    Object(#[source] object::Error),
    #[error("undefined symbol '{0}' could not be resolved against the target")]
    UndefinedSymbol(String),
    #[error("symbol '{0}' has no defining section")]
    UnresolvedSymbol(String),
    #[error("unsupported relocation kind {0:?} at offset {1:#x}")]
    UnsupportedRelocation(object::RelocationKind, u64),
    #[error("jump table has no free slot for '{0}'")]
    JmpTableFull(String),
    #[error("relocation at {addr:#x} writes {len} bytes past the end of the patch region")]
    OutOfBounds { addr: u64, len: usize },
}
