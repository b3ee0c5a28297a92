use thiserror::Error;

/// Rejected cache configuration, returned by the `build` methods of the cache builders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("refresh period must be greater than zero")]
    ZeroRefreshPeriod,
    #[error("max concurrency must be greater than zero")]
    ZeroConcurrency,
    #[error("entry store needs at least one shard")]
    ZeroShards,
}
