use std::path::Path;

use coroutine_scan::CoroutineSource;
use object::Object;
use patch_format::{PatchHeader, KPATCH_FILE_MAGIC1};
use proc_ctl::{ProcessControl, Tid, DEFAULT_DRIVE_TIMEOUT};
use proc_scan::LoadedObject;

use crate::apply::{apply_object, needs_upgrade};
use crate::driver::ActionDriver;
use crate::error::PatchEngineError;
use crate::process::{AppliedPatch, ObjectFile};
use crate::resolve::LiveSymbolResolver;
use crate::revoke::{recover_applied_info, revoke_object};
use crate::storage::{FindResult, Storage};

/// Per-object outcome of a `patch`/`unpatch` run against one process,
/// folded into the one-line-per-PID summary the CLI prints.
#[derive(Debug, Clone)]
pub enum ObjectOutcome {
    Applied { object: String, hunks: usize },
    Revoked { object: String, hunks: usize },
    Skipped { object: String, reason: String },
}

/// Attaches to every thread of `pid`, stopping them for the duration of
/// the call. Mirrors spec.md's `init` + `attach` step; shared by all three
/// orchestrator entry points.
fn attach_all(ctl: &mut dyn ProcessControl, pid: Tid) -> Result<Vec<Tid>, PatchEngineError> {
    let threads = ctl.list_threads(pid).map_err(PatchEngineError::ProcessAttach)?;
    for &tid in &threads {
        ctl.attach(tid).map_err(PatchEngineError::ProcessAttach)?;
    }
    Ok(threads)
}

fn to_object_files(loaded: &[LoadedObject]) -> Vec<ObjectFile> {
    loaded.iter().map(|o| ObjectFile::new(o.path.clone(), o.base, o.build_id.clone())).collect()
}

/// Scans every anonymous mapping in the target for an already-installed
/// patch region and associates it back to the `ObjectFile` it patches,
/// matched by the build-id recorded in the patch's own header (the full
/// blob, magic included, is what apply writes into the target, so the
/// mapping carries everything needed to identify it without a side
/// channel). Populates `object.applied` so callers that never themselves
/// applied the patch in this process lifetime (a fresh `unpatch` run) can
/// still find it.
fn associate_applied_patches(
    ctl: &dyn ProcessControl,
    tid: Tid,
    objects: &mut [ObjectFile],
) -> Result<(), PatchEngineError> {
    let entries = proc_scan::parse_proc_maps(tid.as_raw()).map_err(|e| PatchEngineError::StorageOpen(e.to_string()))?;
    let probe_len = KPATCH_FILE_MAGIC1.len() + PatchHeader::SIZE;

    for entry in entries {
        if entry.path.is_some() || !entry.perms.read {
            continue;
        }

        let Ok(probe) = ctl.mem_read(tid, entry.start, probe_len) else { continue };
        if probe[..KPATCH_FILE_MAGIC1.len()] != KPATCH_FILE_MAGIC1 {
            continue;
        }
        let Some(header) = PatchHeader::parse(&probe[KPATCH_FILE_MAGIC1.len()..]) else { continue };

        let Some(object) =
            objects.iter_mut().find(|o| o.build_id.as_ref().map(|b| b.as_str() == header.build_id()).unwrap_or(false))
        else {
            continue;
        };
        if object.applied.is_some() {
            continue;
        }

        let info = recover_applied_info(ctl, tid, entry.start + header.user_info as u64)?;
        object.kpta = entry.start;
        object.info = info.clone();
        object.applied = Some(AppliedPatch { kpta: entry.start, header, info });
    }

    Ok(())
}

/// Drives every thread in `threads` forward to the target executable's
/// entry point, for a just-exec'd process still inside the dynamic
/// loader's own startup code. A best-effort step: a thread that never
/// reaches the entry point within the drive timeout is left where it is
/// rather than failing the whole patch attempt, since the subsequent
/// `/proc/<pid>/maps` scan is still valid either way.
fn run_to_entry_point(ctl: &dyn ProcessControl, threads: &[Tid], executable: &Path) -> Result<(), PatchEngineError> {
    let data = std::fs::read(executable).map_err(|e| PatchEngineError::StorageOpen(e.to_string()))?;
    let file = object::File::parse(&*data)?;
    let entry = file.entry();

    for &tid in threads {
        let _ = ctl.execute_until(tid, entry, DEFAULT_DRIVE_TIMEOUT);
    }
    Ok(())
}

/// `process_patch`: init, attach, (if `just_started`, let the dynamic
/// loader finish before scanning) map objects, look each one up in
/// storage, find coroutines, apply. Objects with no match in storage are
/// skipped, not fatal; the process succeeds if at least one object was
/// patched.
pub fn process_patch(
    pid: Tid,
    ctl: &mut dyn ProcessControl,
    storage: &mut Storage,
    just_started: bool,
    coroutine_source: &dyn CoroutineSource,
) -> Result<Vec<ObjectOutcome>, PatchEngineError> {
    let threads = attach_all(ctl, pid)?;

    if just_started {
        if let Ok(exe) = std::fs::read_link(format!("/proc/{}/exe", pid)) {
            run_to_entry_point(ctl, &threads, &exe)?;
        }
    }

    let loaded = proc_scan::load_libraries(pid.as_raw())?;
    let mut objects = to_object_files(&loaded);
    let coroutines = coroutine_source.find_coroutines(pid)?;
    let resolver = LiveSymbolResolver::from_objects(&loaded);
    let driver = ActionDriver::default();

    let mut outcomes = Vec::new();

    for object in &mut objects {
        let Some(build_id) = object.build_id.clone() else {
            continue;
        };

        let blob = match storage.find(&build_id, true)? {
            FindResult::Found(blob) => blob,
            FindResult::Exists | FindResult::NotFound => {
                outcomes.push(ObjectOutcome::Skipped {
                    object: object.name(),
                    reason: "no applicable patch in storage".to_string(),
                });
                continue;
            }
        };

        if let Some(applied) = &object.applied {
            if !needs_upgrade(applied.header.user_level, blob.header.user_level) {
                outcomes.push(ObjectOutcome::Skipped {
                    object: object.name(),
                    reason: "already at or above the storage patch level".to_string(),
                });
                continue;
            }
            revoke_object(object, ctl, pid, &driver, &threads, &coroutines, false)?;
        }

        let hunks = apply_object(object, &blob, ctl, pid, &resolver, &driver, &threads, &coroutines)?;
        outcomes.push(ObjectOutcome::Applied { object: object.name(), hunks });
    }

    Ok(outcomes)
}

/// `process_unpatch`: init, attach, map objects, find coroutines, revoke
/// every object matching one of `selectors` (build-id or file name); an
/// empty selector list revokes every currently-applied patch.
pub fn process_unpatch(
    pid: Tid,
    ctl: &mut dyn ProcessControl,
    selectors: &[String],
    coroutine_source: &dyn CoroutineSource,
) -> Result<Vec<ObjectOutcome>, PatchEngineError> {
    let threads = attach_all(ctl, pid)?;
    let loaded = proc_scan::load_libraries(pid.as_raw())?;
    let mut objects = to_object_files(&loaded);
    let coroutines = coroutine_source.find_coroutines(pid)?;
    let driver = ActionDriver::default();

    associate_applied_patches(ctl, pid, &mut objects)?;

    let mut outcomes = Vec::new();
    for object in &mut objects {
        if object.applied.is_none() {
            continue;
        }
        if !selectors.is_empty() && !selectors.iter().any(|s| object.matches_selector(s)) {
            continue;
        }

        let hunks = revoke_object(object, ctl, pid, &driver, &threads, &coroutines, true)?;
        outcomes.push(ObjectOutcome::Revoked { object: object.name(), hunks });
    }

    Ok(outcomes)
}

/// One row of `process_info`'s output table.
pub struct InfoRow {
    pub build_id: String,
    pub path: String,
    pub status: InfoStatus,
}

/// `process_info` only parses `/proc/<pid>/maps`, so it cannot tell a
/// patch applied by a *different* tool invocation from one that was never
/// applied at all without redoing the same live trampoline scan `unpatch`
/// does; it reports the coarser `storage-only`/`none` split instead.
/// `Applied` is reserved for a caller that already holds recovered
/// `AppliedPatch` state (e.g. chained straight off a `process_patch` call
/// in the same run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoStatus {
    Applied,
    StorageOnly,
    None,
}

impl InfoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InfoStatus::Applied => "applied",
            InfoStatus::StorageOnly => "storage-only",
            InfoStatus::None => "none",
        }
    }
}

pub enum InfoFilter<'a> {
    BuildId(&'a str),
    NameRegex(&'a regex::Regex),
    HasStoragePatch,
}

/// `process_info`: attach, parse `/proc/<pid>/maps` only (lighter than a
/// full relocation-aware object map), and list every loaded ELF object
/// matching `filter`, sorted by path.
pub fn process_info(
    pid: Tid,
    ctl: &mut dyn ProcessControl,
    mut storage: Option<&mut Storage>,
    filter: &InfoFilter,
) -> Result<Vec<InfoRow>, PatchEngineError> {
    attach_all(ctl, pid)?;
    let loaded = proc_scan::load_libraries(pid.as_raw())?;

    let mut rows = Vec::new();

    for object in loaded {
        let Some(build_id) = object.build_id.clone() else { continue };

        let matches = match filter {
            InfoFilter::BuildId(want) => build_id.as_str() == *want,
            InfoFilter::NameRegex(re) => object
                .path
                .file_name()
                .map(|n| re.is_match(&n.to_string_lossy()))
                .unwrap_or(false),
            InfoFilter::HasStoragePatch => true,
        };
        if !matches {
            continue;
        }

        let has_storage = match storage.as_mut() {
            Some(s) => matches!(s.find(&build_id, false)?, FindResult::Found(_) | FindResult::Exists),
            None => false,
        };

        if matches!(filter, InfoFilter::HasStoragePatch) && !has_storage {
            continue;
        }

        let status = if has_storage { InfoStatus::StorageOnly } else { InfoStatus::None };
        rows.push(InfoRow { build_id: build_id.as_str().to_string(), path: object.path.display().to_string(), status });
    }

    rows.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(rows)
}

/// `/proc` fan-out for `-p all`: every all-digit entry except `.`, `..`,
/// PID 1 and the tool's own PID.
pub fn list_target_pids(own_pid: i32) -> std::io::Result<Vec<i32>> {
    let mut pids = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(pid) = name.parse::<i32>() else { continue };
        if pid == 1 || pid == own_pid {
            continue;
        }
        pids.push(pid);
    }
    pids.sort_unstable();
    Ok(pids)
}

/// Callback return-code convention for the `-p all` fan-out: `-1` is
/// recorded but iteration continues onto the next PID; `-2` stops the
/// fan-out immediately; any other negative aggregate makes the tool's
/// final exit code non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutControl {
    Continue,
    Stop,
}

pub fn fan_out_control(result: i32) -> FanOutControl {
    if result == -2 {
        FanOutControl::Stop
    } else {
        FanOutControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_stops_only_on_negative_two() {
        assert_eq!(fan_out_control(-1), FanOutControl::Continue);
        assert_eq!(fan_out_control(0), FanOutControl::Continue);
        assert_eq!(fan_out_control(-2), FanOutControl::Stop);
    }

    #[test]
    fn list_target_pids_excludes_self_and_init() {
        let own = std::process::id() as i32;
        let pids = list_target_pids(own).unwrap();
        assert!(!pids.contains(&1));
        assert!(!pids.contains(&own));
    }

    #[test]
    fn info_status_labels_match_table_format() {
        assert_eq!(InfoStatus::Applied.as_str(), "applied");
        assert_eq!(InfoStatus::StorageOnly.as_str(), "storage-only");
        assert_eq!(InfoStatus::None.as_str(), "none");
    }
}
