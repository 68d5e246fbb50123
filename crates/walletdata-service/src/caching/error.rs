use thiserror::Error;

/// An error that happens when fetching data through the caching layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The caller passed arguments the cache cannot work with, such as a
    /// blank scope id.
    ///
    /// Nothing was locked or cached; the call is safe to retry with fixed
    /// input.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The remote source failed.
    ///
    /// The attached string contains the underlying cause. The failed request
    /// left no partial data in the cache.
    #[error("api operation failed: {0}")]
    Api(String),

    /// An internal invariant was violated, for example a member missing from
    /// the cache after a successful remote call.
    ///
    /// This is a should-not-happen signal rather than an expected control
    /// flow branch.
    #[error("cache operation failed: {0}")]
    CacheOperation(String),
}

/// The result of a cache operation, either `Ok(T)` or a [`CacheError`]
/// denoting why the data could not be fetched.
pub type CacheContents<T = ()> = Result<T, CacheError>;
