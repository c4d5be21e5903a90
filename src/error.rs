use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

/// Failures surfaced at the pool facade.
///
/// Internal helpers never recover silently; they propagate one of these to
/// the operation boundary.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A chunk with the requested key is already resident.
    #[error("chunk already exists")]
    AlreadyExists,

    /// The chunk is neither resident nor obtainable from a parent tier.
    #[error("chunk not found in pool or parent tiers")]
    NotFound,

    /// A single request can never span more than one slab.
    #[error("requested {requested} bytes exceeds slab capacity of {slab_size} bytes")]
    TooLarge { requested: usize, slab_size: usize },

    /// The eviction scan could not assemble a large enough window.
    #[error("could not evict enough pages to free {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The buffer's backing pages were reclaimed (evicted or deleted).
    #[error("buffer is not resident")]
    NotResident,

    /// Conflicting chunk state, e.g. writing over unflushed data.
    #[error("chunk inconsistency: {0}")]
    Inconsistency(&'static str),

    /// Operation not available at this tier.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Malformed argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(String),
}
