use thiserror::Error;

/// Construction-time failures for the datapath core.
///
/// These are the "Fatal" class of `spec.md`'s error taxonomy: they occur only
/// at startup, never on the packet hot path, and the caller is expected to
/// log and exit rather than recover.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("ring capacity {0} is not a power of two")]
    RingCapacityNotPowerOfTwo(usize),

    #[error("pool capacity must be non-zero")]
    PoolCapacityZero,

    #[error("huge-page, anonymous-mmap, and heap allocation all failed for the packet pool")]
    PoolAllocationFailed,

    #[error("neighbor table capacity must be non-zero")]
    NeighborTableCapacityZero,
}
