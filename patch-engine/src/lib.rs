//! The patching engine proper: storage lookup, ELF relocation, the safety
//! verifier and action driver, and the apply/revoke state machines, wired
//! together by the orchestrator's `process_patch`/`process_unpatch`/
//! `process_info` entry points.
//!
//! Everything here talks to the target process only through
//! [`proc_ctl::ProcessControl`], to coroutines only through
//! [`coroutine_scan::CoroutineSource`], and to symbol resolution only
//! through [`patch_reloc::SymbolResolver`] — `hotpatch` is the only crate
//! that picks concrete implementations of these and wires a real `Tid` in.

mod apply;
mod driver;
mod error;
mod orchestrator;
mod process;
mod resolve;
mod revoke;
mod safety;
mod storage;

pub use driver::ActionDriver;
pub use error::PatchEngineError;
pub use orchestrator::{
    fan_out_control, list_target_pids, process_info, process_patch, process_unpatch, FanOutControl, InfoFilter,
    InfoRow, InfoStatus, ObjectOutcome,
};
pub use process::{AppliedPatch, ObjectFile};
pub use resolve::LiveSymbolResolver;
pub use safety::{Action, VerifyReport};
pub use storage::{FindResult, PatchBlob, Storage};
