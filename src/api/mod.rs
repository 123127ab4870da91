//! HTTP request core.
//!
//! Call sites describe a request with a [`RequestDescriptor`] and hand it to
//! [`RequestPipeline::execute`]. Timeouts, cancellation, auth headers and
//! error normalization all live here so endpoint wrappers stay pure data.

mod auth;
mod error;
mod pipeline;
mod request;
mod signal;

pub use auth::{NoToken, TokenSource, UnauthorizedContext, UnauthorizedHandler};
pub use error::{normalize, ApiError, ErrorKind, SetupError};
pub use pipeline::{ApiConfig, RequestPipeline};
pub use request::{Body, RequestDescriptor};
pub use signal::{merge, AbortController, AbortSignal};
