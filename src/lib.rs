//! CacheWarp — an HTTP caching reverse proxy.
//!
//! CacheWarp sits between clients and an origin service. For every forwarded
//! `GET` request it serves a cached response when one is available,
//! otherwise it fetches from the origin, stores the result under a
//! rule-derived time-to-live, and returns it to the client. It is designed to
//! absorb traffic spikes, reduce origin load, and tolerate transient origin
//! failures.
//!
//! The core of the crate is five pieces that interact tightly:
//!
//! - [`ttl`]: a rule-driven calculator that derives a TTL from a response's
//!   path, status code, and content type.
//! - [`cache`]: a two-tier cache — a bounded process-local L1 in front of a
//!   shared L2 — with staleness tracking and singleflight locks.
//! - [`origin`]: the HTTP client that fetches from the origin and classifies
//!   its failures.
//! - [`breaker`]: a circuit breaker that gates origin attempts and
//!   coordinates with stale serving.
//! - [`pipeline`]: the `tower::Service` that orchestrates all of the above
//!   per request.
//!
//! Everything else in the crate ([`config`], [`logging`], [`metrics`],
//! [`error`], [`app`]) is the ambient plumbing a deployable proxy needs
//! around that core.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod pipeline;
pub mod refresher;
pub mod ttl;

pub use config::Config;
pub use error::{CacheError, OriginError, PipelineError, StartupError};
