//! `kvarto-http` is an async HTTP transport layer with streaming bodies.
//!
//! The crate is built from three pieces:
//! - [`Body`] and the flow-controlled [`bridge`] that moves body chunks
//!   between producers and consumers with at most one chunk in flight
//! - [`retry`] with pluggable [`BackoffStrategy`] implementations
//! - [`HttpClient`] and, with the `server` feature, [`HttpServer`], which run
//!   requests through the two above

mod backoff;
mod body;
pub mod bridge;
mod client;
mod error;
mod options;
mod retry;
#[cfg(feature = "server")]
mod server;
pub mod transport;
mod types;

pub use backoff::{BackoffStrategy, ConstantBackoff, ExponentialBackoff, FibonacciBackoff, NoBackoff};
pub use body::{Body, ByteStream, StreamBody, DEFAULT_MAX_BODY_BYTES};
pub use client::HttpClient;
pub use error::{BoxError, Error};
pub use options::ClientOptions;
pub use retry::{is_retryable, is_retryable_status, retry, RetryConfig};
#[cfg(feature = "server")]
pub use server::HttpServer;
pub use transport::{ReqwestTransport, Transport};
pub use types::{AcceptedStatuses, HttpRequest, HttpResponse, RequestContext, RequestMetadata};

pub type Result<T> = std::result::Result<T, Error>;
