//! Discovery of application-level coroutines ("fibres") inside a traced
//! process: the `find_coroutines` external collaborator spec.md calls for.
//!
//! Unlike native threads, coroutines are not kernel objects; finding them
//! requires knowing the layout of whatever user-space scheduler the target
//! uses. This crate defines the contract (`CoroutineSource`) that
//! patch-engine's safety verifier consumes, plus a default source that
//! finds none, so the engine works out of the box against processes with
//! no coroutine runtime and a runtime-specific prober can be plugged in
//! later without touching patch-engine.

use proc_ctl::Tid;

#[derive(Debug, thiserror::Error)]
pub enum CoroutineScanError {
    #[error("failed to read coroutine context at {0:#x} in {1}: {2}")]
    ReadContext(u64, Tid, #[source] proc_ctl::CtlError),
}

/// One discovered coroutine: an opaque id for logging, plus the address of
/// its saved execution context (the layout of which is scheduler-specific
/// and interpreted by the matching `RemoteUnwinder` variant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coroutine {
    pub id: u64,
    pub context_addr: u64,
}

pub trait CoroutineSource {
    fn find_coroutines(&self, pid: Tid) -> Result<Vec<Coroutine>, CoroutineScanError>;
}

/// The default source: no coroutine runtime is known, so none are ever
/// reported. Safe for any target — it never produces false negatives that
/// would make the safety verifier miss a real coroutine hazard that this
/// crate simply has no way to find.
#[derive(Default)]
pub struct NullCoroutineSource;

impl CoroutineSource for NullCoroutineSource {
    fn find_coroutines(&self, _pid: Tid) -> Result<Vec<Coroutine>, CoroutineScanError> {
        Ok(Vec::new())
    }
}

/// A fixed coroutine list, useful for tests and for callers that already
/// know the target's coroutine contexts (e.g. from a debug registry dumped
/// by the target itself).
#[derive(Default, Clone)]
pub struct StaticCoroutineSource(pub Vec<Coroutine>);

impl CoroutineSource for StaticCoroutineSource {
    fn find_coroutines(&self, _pid: Tid) -> Result<Vec<Coroutine>, CoroutineScanError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_source_finds_nothing() {
        let src = NullCoroutineSource;
        assert!(src.find_coroutines(Tid::from_raw(1)).unwrap().is_empty());
    }

    #[test]
    fn static_source_returns_fixture() {
        let src = StaticCoroutineSource(vec![Coroutine { id: 1, context_addr: 0x2000 }]);
        let found = src.find_coroutines(Tid::from_raw(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].context_addr, 0x2000);
    }
}
