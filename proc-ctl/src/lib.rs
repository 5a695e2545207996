//! Low-level control of a traced process: ptrace attach/detach, remote
//! memory read/write, remote `mmap`/`munmap`, register access, and driving
//! a thread forward to a target instruction pointer.
//!
//! This is the "external collaborator" spec.md calls `ptrace_attach`,
//! `remote_mmap`, `mem_read`/`mem_write`, `execute_until` and register
//! get/set. `patch-engine` only ever talks to the [`ProcessControl`] trait,
//! never to `nix` directly, so tests can swap in [`fake::FakeControl`]
//! instead of tracing a real PID.

mod fake;
mod ptrace_impl;
mod regs;

pub use fake::FakeControl;
pub use ptrace_impl::PtraceControl;
pub use regs::Registers;

use std::time::Duration;

pub type Tid = nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error("failed to attach to {0}: {1}")]
    Attach(Tid, #[source] nix::errno::Errno),
    #[error("failed to detach from {0}: {1}")]
    Detach(Tid, #[source] nix::errno::Errno),
    #[error("failed to read {len} bytes at {addr:#x} in {tid}: {source}")]
    MemRead { tid: Tid, addr: u64, len: usize, #[source] source: nix::errno::Errno },
    #[error("failed to write {len} bytes at {addr:#x} in {tid}: {source}")]
    MemWrite { tid: Tid, addr: u64, len: usize, #[source] source: nix::errno::Errno },
    #[error("remote mmap near {near:#x} failed: {source}")]
    Remap { near: u64, #[source] source: nix::errno::Errno },
    #[error("remote munmap of {addr:#x} ({len} bytes) failed: {source}")]
    Unmap { addr: u64, len: usize, #[source] source: nix::errno::Errno },
    #[error("failed to read registers of {0}: {1}")]
    GetRegs(Tid, #[source] nix::errno::Errno),
    #[error("failed to write registers of {0}: {1}")]
    SetRegs(Tid, #[source] nix::errno::Errno),
    #[error("{0} did not reach {1:#x} within the drive timeout")]
    DriveTimeout(Tid, u64),
    #[error("failed to enumerate threads of process {0}: {1}")]
    ListThreads(Tid, #[source] std::io::Error),
    #[error("wait on {0} failed: {1}")]
    Wait(Tid, #[source] nix::errno::Errno),
}

/// Capability over a single live process, so that patch-engine can be
/// written and tested against either a real traced process or a fake.
pub trait ProcessControl {
    fn attach(&mut self, tid: Tid) -> Result<(), CtlError>;
    fn detach(&mut self, tid: Tid) -> Result<(), CtlError>;

    /// Lists every thread currently in the thread group `pid` belongs to.
    fn list_threads(&self, pid: Tid) -> Result<Vec<Tid>, CtlError>;

    fn mem_read(&self, tid: Tid, addr: u64, len: usize) -> Result<Vec<u8>, CtlError>;
    fn mem_write(&self, tid: Tid, addr: u64, data: &[u8]) -> Result<(), CtlError>;

    /// Maps `len` bytes of RWX memory in the target as close to `near` as
    /// the kernel will allow, returning the mapped address. Ownership of
    /// the mapping passes to the target process once this returns.
    fn remote_mmap(&self, tid: Tid, near: u64, len: usize) -> Result<u64, CtlError>;
    fn remote_munmap(&self, tid: Tid, addr: u64, len: usize) -> Result<(), CtlError>;

    fn get_regs(&self, tid: Tid) -> Result<Registers, CtlError>;
    fn set_regs(&self, tid: Tid, regs: &Registers) -> Result<(), CtlError>;

    /// Resumes `tid` and blocks until its instruction pointer reaches
    /// `target_ip`, or `timeout` elapses.
    fn execute_until(&self, tid: Tid, target_ip: u64, timeout: Duration) -> Result<(), CtlError>;
}

/// The 3000-second drive bound spec.md hard-codes for `ensure_safety`.
pub const DEFAULT_DRIVE_TIMEOUT: Duration = Duration::from_secs(3000);
