//! Memory-pressure level codes consumed from the host.
//!
//! Hosts with richer level vocabularies map their codes to the nearest of
//! these four tiers before calling into the launcher.

/// A host memory-pressure signal, ordered from mildest to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum MemoryPressureLevel {
    /// The host is running with moderate memory pressure.
    #[display("running moderate")]
    RunningModerate,

    /// The host is running critically low on memory.
    #[display("running low")]
    RunningLow,

    /// The host UI is no longer visible. No immediate action; the
    /// background drain task covers this case.
    #[display("ui hidden")]
    UiHidden,

    /// The host must shed every reclaimable allocation.
    #[display("complete")]
    Complete,
}

impl MemoryPressureLevel {
    /// The fraction of the moderate-binding pool dropped, from the LRU end,
    /// when this level is signalled.
    pub(crate) fn drop_numerator(&self) -> usize {
        match self {
            MemoryPressureLevel::RunningModerate => 1,
            MemoryPressureLevel::RunningLow => 2,
            MemoryPressureLevel::UiHidden => 0,
            MemoryPressureLevel::Complete => 4,
        }
    }
}
