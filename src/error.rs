//! Error taxonomy for the proxy.
//!
//! Mirrors the shape of `http-cache`'s own `CacheError`: a flat enum of
//! `#[from]`-convertible variants rather than a tree of nested error types,
//! so call sites can use `?` freely. [`CacheError`] covers the cache backend
//! (L1/L2, locks); [`PipelineError`] covers everything the request pipeline
//! itself can fail on before it has produced a response.

use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors from the two-tier cache and its lock primitives.
///
/// Per the caching contract, callers other than [`crate::cache`] should never
/// see this type: L2 transport errors and corrupt entries are swallowed and
/// reported as cache misses. It exists so the cache layer's internals can use
/// `?` and so tests can assert on the specific failure that was swallowed.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The shared (L2) store could not be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// An entry was present but could not be decoded.
    #[error("cache entry corrupt: {0}")]
    Corrupt(String),

    /// A lock operation failed for a reason other than contention.
    #[error("lock operation failed: {0}")]
    Lock(String),

    /// Catch-all for errors that don't fit another variant.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors the origin client can raise.
///
/// Only [`OriginError::Connect`] and [`OriginError::Timeout`] count as
/// breaker failures — a response actually received from the origin, even a
/// 4xx/5xx one, is not an `OriginError` at all; it is a normal
/// [`crate::origin::OriginResponse`].
#[derive(Error, Debug)]
pub enum OriginError {
    /// The origin could not be reached (DNS, TCP connect, TLS handshake).
    #[error("could not connect to origin: {0}")]
    Connect(String),

    /// The origin did not respond within the request deadline.
    #[error("origin request timed out: {0}")]
    Timeout(String),

    /// Anything else: a malformed response, a body read failure, etc.
    #[error("unexpected origin error: {0}")]
    Unexpected(String),
}

/// Errors surfaced by the caching pipeline itself.
///
/// Any pipeline error not otherwise classified causes the proxy to forward
/// the request without caching (fail-open), rather than failing the
/// request outright.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The inner (origin-forwarding) service returned an error.
    #[error("inner service error: {0}")]
    Inner(String),

    /// The request or response body could not be read.
    #[error("body error: {0}")]
    Body(String),
}

/// Errors that can prevent the proxy from starting.
#[derive(Error, Debug)]
pub enum StartupError {
    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The HTTP listener could not bind to its configured address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
