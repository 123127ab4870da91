//! Request and cache core for the creator platform.
//!
//! [`api::RequestPipeline`] executes calls with a deadline, bearer auth and
//! normalized errors. [`cache::PersistentCacheStore`] keeps their results,
//! persisting a whitelisted subset across restarts. [`client::PatronClient`]
//! wires one of each together with the session policy.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod logging;
pub mod session;

pub use api::{ApiError, ErrorKind, RequestDescriptor, RequestPipeline};
pub use cache::{CacheKey, PersistentCacheStore, SafeStorage};
pub use client::{ClientConfig, PatronClient};
