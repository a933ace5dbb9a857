use thiserror::Error;

/// Errors surfaced by the cache core.
///
/// Construction-time failures abort engine start. Step-admit failures
/// (`ResourceExhausted`, `OutOfDeviceMemory`) are returned to the scheduler,
/// which may retry after releasing slots. In-step failures discard the
/// in-flight step; no state beyond the current step has been mutated.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Block size, head size or layout constraint violated at construction.
    #[error("invalid cache configuration: {0}")]
    ConfigInvalid(String),

    /// The driver refused a virtual reservation or ran out of address space.
    #[error("device resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Physical page allocation failed.
    #[error("out of device memory: {0}")]
    OutOfDeviceMemory(String),

    /// Mapping physical pages into a reservation failed.
    #[error("failed to map pages: {0}")]
    MapFailed(String),

    /// Head size / dtype / kernel combination outside the supported set.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Internal metadata shape or consistency check failed. Indicates a
    /// programmer error, not a recoverable condition.
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Shorthand for `PreconditionViolated`, mirroring `candle_core::bail!`.
macro_rules! precondition {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::CacheError::PreconditionViolated(format!($($arg)*)));
        }
    };
}
pub(crate) use precondition;
