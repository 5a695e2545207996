use patch_format::BuildId;
use proc_ctl::Tid;

#[derive(Debug, thiserror::Error)]
pub enum PatchEngineError {
    #[error("invalid patch: {0}")]
    InvalidPatch(#[from] patch_format::ValidateError),
    #[error("failed to open patch storage: {0}")]
    StorageOpen(String),
    #[error("no patch found for build-id {0}")]
    StorageMiss(BuildId),
    #[error("failed to attach to process: {0}")]
    ProcessAttach(#[source] proc_ctl::CtlError),
    #[error("failed to read target memory: {0}")]
    MemRead(#[source] proc_ctl::CtlError),
    #[error("failed to write target memory: {0}")]
    MemWrite(#[source] proc_ctl::CtlError),
    #[error("failed to map patch region: {0}")]
    Remap(#[source] proc_ctl::CtlError),
    #[error("failed to initialize stack unwind: {0}")]
    UnwindInit(#[from] remote_unwind::UnwindError),
    #[error("thread {0} is executing inside a hazard interval")]
    SafetyUnsafeThread(Tid),
    #[error("a coroutine is executing inside a hazard interval")]
    SafetyUnsafeCoroutine,
    #[error("thread {0} did not clear its hazard interval before the drive timeout")]
    DriveTimeout(Tid),
    #[error("relocation failed: {0}")]
    Relocate(#[from] patch_reloc::RelocError),
    #[error("failed to allocate patch region: {0}")]
    Alloc(String),
    #[error("failed to scan loaded libraries: {0}")]
    Scan(#[from] proc_scan::ScanError),
    #[error("failed to scan coroutines: {0}")]
    Coroutine(#[from] coroutine_scan::CoroutineScanError),
    #[error("failed to parse embedded patch object: {0}")]
    Object(#[from] object::Error),
}

impl From<proc_ctl::CtlError> for PatchEngineError {
    /// Most `proc-ctl` failures surface as a generic memory-access error;
    /// call sites that need a more specific kind (`ProcessAttach`, `Remap`)
    /// construct that variant directly instead of relying on this impl.
    fn from(e: proc_ctl::CtlError) -> Self {
        PatchEngineError::MemRead(e)
    }
}
