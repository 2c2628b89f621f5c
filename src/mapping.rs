//! Memory-map advice wrappers.
//!
//! Every map in the pipeline is advised for its access pattern and advised
//! `DontNeed` before release. Advice is best-effort: a refused madvise is
//! logged at debug and ignored.

use memmap2::{Mmap, MmapMut};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Advice {
    Sequential,
    Random,
    WillNeed,
    DontNeed,
}

#[cfg(unix)]
impl Advice {
    fn into_checked(self) -> Option<memmap2::Advice> {
        match self {
            Advice::Sequential => Some(memmap2::Advice::Sequential),
            Advice::Random => Some(memmap2::Advice::Random),
            Advice::WillNeed => Some(memmap2::Advice::WillNeed),
            Advice::DontNeed => None,
        }
    }
}

#[cfg(unix)]
pub(crate) fn advise(map: &Mmap, advice: Advice) {
    let result = match advice.into_checked() {
        Some(a) => map.advise(a),
        // Safety: DontNeed is advisory only; no outstanding borrows of the
        // mapped contents are relied upon across this call at any call site.
        None => unsafe { map.unchecked_advise(memmap2::UncheckedAdvice::DontNeed) },
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "madvise failed");
    }
}

#[cfg(unix)]
pub(crate) fn advise_mut(map: &MmapMut, advice: Advice) {
    let result = match advice.into_checked() {
        Some(a) => map.advise(a),
        // Safety: DontNeed is advisory only; no outstanding borrows of the
        // mapped contents are relied upon across this call at any call site.
        None => unsafe { map.unchecked_advise(memmap2::UncheckedAdvice::DontNeed) },
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "madvise failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn advise(_map: &Mmap, _advice: Advice) {}

#[cfg(not(unix))]
pub(crate) fn advise_mut(_map: &MmapMut, _advice: Advice) {}
