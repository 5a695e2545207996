use std::path::PathBuf;
use std::sync::Arc;

use coroutine_scan::Coroutine;
use patch_format::{BuildId, PatchHeader, PatchHunk};
use patch_reloc::JmpTable;
use proc_ctl::Tid;

use crate::storage::PatchBlob;

/// A live patch previously installed on an object: the header and hunk
/// table as last observed in target memory (recovered lazily by the
/// revoke engine, see [`crate::revoke`]).
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    pub kpta: u64,
    pub header: PatchHeader,
    pub info: Vec<PatchHunk>,
}

/// One ELF object loaded into the target, plus everything the apply/revoke
/// engines need to track while working on it.
///
/// Invariant: either `applied` is `None` (clean) or `kpta != 0` and the
/// mapped region is `applied.header.total_size` bytes long.
pub struct ObjectFile {
    pub path: PathBuf,
    pub build_id: Option<BuildId>,
    pub base: u64,
    pub is_patch_object: bool,

    /// Storage-side blob for this build-id, if one was found. Bytes are
    /// borrowed from the `Storage` cache until apply time.
    pub storage_blob: Option<Arc<PatchBlob>>,

    /// Live-side state, populated once a patch has actually been applied
    /// (or recovered from target memory during unpatch).
    pub applied: Option<AppliedPatch>,

    /// Apply-in-progress working state: the private duplicate of the
    /// storage blob, its parsed hunk table, the jump table, and the
    /// address the region was mapped at. Cleared once apply finishes or
    /// aborts.
    pub duplicate: Option<Vec<u8>>,
    pub info: Vec<PatchHunk>,
    pub jmp_table: Option<JmpTable>,
    pub kpta: u64,
}

impl ObjectFile {
    pub fn new(path: PathBuf, base: u64, build_id: Option<BuildId>) -> Self {
        Self {
            path,
            build_id,
            base,
            is_patch_object: false,
            storage_blob: None,
            applied: None,
            duplicate: None,
            info: Vec::new(),
            jmp_table: None,
            kpta: 0,
        }
    }

    pub fn name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }

    pub fn is_already_patched(&self) -> bool {
        self.applied.is_some()
    }

    pub fn matches_selector(&self, selector: &str) -> bool {
        self.build_id.as_ref().map(|b| b.as_str() == selector).unwrap_or(false) || self.name() == selector
    }
}

/// A single traced process: its threads, discovered objects, and the
/// coroutines found inside it. `init`/`attach`/`free` mirror the lifecycle
/// spec.md describes; this type just holds the state, the orchestrator
/// drives it.
pub struct Process {
    pub pid: Tid,
    pub threads: Vec<Tid>,
    pub objects: Vec<ObjectFile>,
    pub coroutines: Vec<Coroutine>,
}

impl Process {
    pub fn new(pid: Tid) -> Self {
        Self { pid, threads: Vec::new(), objects: Vec::new(), coroutines: Vec::new() }
    }

    pub fn object_mut(&mut self, build_id: &BuildId) -> Option<&mut ObjectFile> {
        self.objects.iter_mut().find(|o| o.build_id.as_ref() == Some(build_id))
    }
}
