//! Boundary to the engine that moves bytes over the network.

use std::{fmt, time::Duration};

use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use reqwest::{
    header::{HeaderMap, CONTENT_LENGTH},
    Method, StatusCode, Url,
};

use crate::{bridge::BridgeReceiver, ByteStream, Error, Result};

/// Everything a transport needs to open a request, except the body.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    /// Full target including the query string.
    pub url: Url,
    pub headers: HeaderMap,
    /// Body length when known up front; `None` means chunked.
    pub content_length: Option<u64>,
    /// Per-attempt timeout, used to classify transport timeouts.
    pub timeout: Duration,
}

/// Status line and headers of a response, plus its body chunks.
pub struct InboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl fmt::Debug for InboundResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// HTTP engine used by [`HttpClient`](crate::HttpClient).
///
/// `open` writes the chunks read from `body` as the request payload and
/// resolves once the response head arrived. Dropping the returned future
/// aborts the attempt.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, head: RequestHead, body: BridgeReceiver) -> BoxFuture<'static, Result<InboundResponse>>;
}

/// [`Transport`] backed by a `reqwest` client.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses a preconfigured client (proxies, TLS roots, pool settings).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Transport for ReqwestTransport {
    fn open(&self, head: RequestHead, body: BridgeReceiver) -> BoxFuture<'static, Result<InboundResponse>> {
        let http = self.http.clone();
        async move {
            let RequestHead {
                method,
                url,
                headers,
                content_length,
                timeout,
            } = head;

            let mut builder = http.request(method, url).headers(headers);
            match content_length {
                Some(0) => drop(body),
                Some(length) => {
                    builder = builder
                        .header(CONTENT_LENGTH, length)
                        .body(reqwest::Body::wrap_stream(body));
                }
                None => builder = builder.body(reqwest::Body::wrap_stream(body)),
            }

            let response = builder
                .send()
                .await
                .map_err(|err| Error::from_reqwest(err, timeout))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes_stream()
                .map(move |chunk| chunk.map_err(|err| Error::from_reqwest(err, timeout)))
                .boxed();

            Ok(InboundResponse {
                status,
                headers,
                body,
            })
        }
        .boxed()
    }
}
