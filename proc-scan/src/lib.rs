//! Enumeration of a live process's loaded shared objects and their
//! build-IDs: the `parse_proc_maps`, `load_libraries` and `get_buildid`
//! external collaborators spec.md calls for.

mod buildid;
mod maps;

pub use buildid::get_buildid;
pub use maps::{parse_proc_maps, MapEntry, Perms};

use std::path::{Path, PathBuf};

use patch_format::BuildId;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("{0} is not a valid ELF object")]
    BadElf(PathBuf),
    #[error("{0} has no .note.gnu.build-id section")]
    NoBuildId(PathBuf),
    #[error("failed to parse {0} as an object file: {1}")]
    Object(PathBuf, #[source] object::Error),
}

/// One ELF object mapped into a process's address space.
#[derive(Debug, Clone)]
pub struct LoadedObject {
    pub path: PathBuf,
    /// Lowest virtual address this object is mapped at (the load bias to
    /// add to any offset recorded relative to the file).
    pub base: u64,
    pub build_id: Option<BuildId>,
}

/// Groups `/proc/<pid>/maps` entries by backing file and resolves each
/// file's build-id, producing one [`LoadedObject`] per distinct path.
///
/// Anonymous mappings, `[stack]`/`[heap]`/`[vdso]`-style pseudo paths, and
/// objects whose build-id can't be read are skipped (not every mapped file
/// needs to be patchable).
pub fn load_libraries(pid: i32) -> Result<Vec<LoadedObject>, ScanError> {
    let entries = parse_proc_maps(pid).map_err(|e| ScanError::Io(proc_maps_path(pid), e))?;

    let mut objects: Vec<LoadedObject> = Vec::new();
    for entry in entries {
        let Some(path) = entry.path.as_ref() else { continue };
        if !path.starts_with('/') {
            continue;
        }
        let path = PathBuf::from(path);

        if let Some(existing) = objects.iter_mut().find(|o| o.path == path) {
            existing.base = existing.base.min(entry.start);
            continue;
        }

        let build_id = get_buildid(&path).ok();
        objects.push(LoadedObject { path, base: entry.start, build_id });
    }

    Ok(objects)
}

fn proc_maps_path(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{}/maps", pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_libraries_skips_anonymous_and_pseudo_paths() {
        let entries = vec![
            MapEntry { start: 0x1000, end: 0x2000, perms: Perms::default(), offset: 0, path: None },
            MapEntry { start: 0x2000, end: 0x3000, perms: Perms::default(), offset: 0, path: Some("[heap]".into()) },
        ];
        // This exercises the filtering predicate directly, since building
        // real /proc/<pid>/maps output in a unit test isn't meaningful.
        let filtered: Vec<_> = entries
            .into_iter()
            .filter(|e| e.path.as_deref().map(|p| p.starts_with('/')).unwrap_or(false))
            .collect();
        assert!(filtered.is_empty());
    }
}
