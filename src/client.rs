use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::time::timeout;

use crate::{
    bridge,
    retry::retry,
    transport::{RequestHead, ReqwestTransport, Transport},
    AcceptedStatuses, Body, ByteStream, ClientOptions, Error, HttpRequest, HttpResponse, Result,
};

/// HTTP client that streams bodies through a [`Transport`] and retries
/// according to the request's [`RetryConfig`](crate::RetryConfig).
pub struct HttpClient<T = ReqwestTransport> {
    transport: Arc<T>,
    options: ClientOptions,
}

impl<T> Clone for HttpClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T> fmt::Debug for HttpClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("transport", &std::any::type_name::<T>())
            .field("options", &self.options)
            .finish()
    }
}

impl HttpClient {
    /// Creates a client over a default `reqwest` transport.
    pub fn new() -> Self {
        Self::with_transport(ReqwestTransport::new())
    }

    /// Creates a client configured from `KVARTO_HTTP_*` environment
    /// variables. See [`ClientOptions::from_env`].
    pub fn from_env() -> std::result::Result<Self, String> {
        Ok(Self::new().with_options(ClientOptions::from_env()?))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> HttpClient<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            options: ClientOptions::default(),
        }
    }

    /// Applies client options such as timeout and retry behavior.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Sends `request` and returns once the response head arrived; the
    /// response body streams afterwards.
    ///
    /// A status outside the request's accepted set fails with
    /// [`Error::UnexpectedStatus`]. Each attempt gets a fresh stream
    /// bridge; a read-once stream body that was already handed to the
    /// transport fails with [`Error::NonRetryableStreamBody`] instead of
    /// being retried. This includes a refused connection, since the stream is
    /// handed over before the transport connects. Dropping the returned
    /// future aborts the in-flight
    /// attempt and cancels both body bridges.
    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        let retry_config = request
            .metadata
            .retry
            .clone()
            .unwrap_or_else(|| self.options.retry_config());
        let attempt_timeout = request.metadata.timeout.unwrap_or_else(|| self.options.timeout());
        let accepted = request.metadata.accepted_statuses.clone();
        let max_body_bytes = self.options.max_body_bytes;
        let max_attempts = retry_config.max_retries.saturating_add(1);

        let mut head = RequestHead {
            method: request.method.clone(),
            url: request.target_url(),
            headers: request.headers.clone(),
            content_length: request.body.declared_length(),
            timeout: attempt_timeout,
        };
        if let Some((name, value)) = &request.context.correlation {
            if !head.headers.contains_key(name) {
                head.headers.insert(name.clone(), value.clone());
            }
        }

        let replayable = request.body.is_replayable();
        let transport = self.transport.as_ref();
        let config = &retry_config;
        let mut attempt = 0u32;

        retry(config, || {
            attempt += 1;
            let content = request.body.content();
            let head = head.clone();
            let accepted = &accepted;
            let current = attempt;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                operation_id = ?request.context.operation_id,
                method = %head.method,
                url = %head.url,
                attempt = current,
                "sending request"
            );

            async move {
                let result = match content {
                    Ok(content) => {
                        run_attempt(transport, head, content, attempt_timeout, accepted, max_body_bytes)
                            .await
                    }
                    Err(err) => Err(err),
                };
                match result {
                    Err(err)
                        if !replayable
                            && current < max_attempts
                            && (config.is_retryable)(&err) =>
                    {
                        Err(Error::NonRetryableStreamBody {
                            source: Box::new(err),
                        })
                    }
                    other => other,
                }
            }
        })
        .await
    }
}

async fn run_attempt<T: Transport>(
    transport: &T,
    head: RequestHead,
    content: ByteStream,
    attempt_timeout: Duration,
    accepted: &AcceptedStatuses,
    max_body_bytes: usize,
) -> Result<HttpResponse> {
    let outbound = bridge::spawn_pump(content);
    let inbound = match timeout(attempt_timeout, transport.open(head, outbound)).await {
        Ok(inbound) => inbound?,
        Err(_) => return Err(Error::Timeout(attempt_timeout)),
    };

    let mut response = HttpResponse {
        status: inbound.status,
        headers: inbound.headers,
        body: Body::from_stream(bridge::spawn_pump(inbound.body)),
    };
    if accepted.contains(response.status) {
        return Ok(response);
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(status = %response.status, "response status not accepted");

    let body = match timeout(
        attempt_timeout,
        response.body.materialize_with_limit(max_body_bytes),
    )
    .await
    {
        Ok(Ok(body)) => body,
        _ => Bytes::new(),
    };
    Err(Error::UnexpectedStatus {
        status: response.status,
        headers: response.headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use futures_util::{future::BoxFuture, stream, FutureExt, StreamExt};
    use reqwest::{header::HeaderMap, StatusCode};

    use super::*;
    use crate::{transport::InboundResponse, RetryConfig};

    type Scripted = Box<dyn FnOnce() -> Result<InboundResponse> + Send>;

    /// Transport that drains the outbound body and answers from a script.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        opened: AtomicUsize,
        received: Arc<Mutex<Vec<Bytes>>>,
        heads: Mutex<Vec<RequestHead>>,
    }

    impl ScriptedTransport {
        fn push(self, step: impl FnOnce() -> Result<InboundResponse> + Send + 'static) -> Self {
            self.script.lock().expect("lock").push_back(Box::new(step));
            self
        }
    }

    impl Transport for ScriptedTransport {
        fn open(
            &self,
            head: RequestHead,
            mut body: bridge::BridgeReceiver,
        ) -> BoxFuture<'static, Result<InboundResponse>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.heads.lock().expect("lock").push(head);
            let step = self.script.lock().expect("lock").pop_front();
            let received = self.received.clone();
            async move {
                while let Some(chunk) = body.recv().await {
                    received.lock().expect("lock").push(chunk?);
                }
                match step {
                    Some(step) => step(),
                    None => Err(Error::Connectivity("script exhausted".into())),
                }
            }
            .boxed()
        }
    }

    fn ok(text: &'static str) -> Result<InboundResponse> {
        Ok(InboundResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: stream::once(async move { Ok(Bytes::from_static(text.as_bytes())) }).boxed(),
        })
    }

    fn refused() -> Result<InboundResponse> {
        Err(Error::Connectivity("connection refused".into()))
    }

    fn request() -> HttpRequest {
        HttpRequest::parse("http://localhost/").expect("valid url")
    }

    #[tokio::test]
    async fn retries_connectivity_failures_with_fixed_body() {
        let transport = ScriptedTransport::default().push(refused).push(|| ok("done"));
        let client = HttpClient::with_transport(transport);

        let mut response = client
            .send(request().with_body("abc").with_retry(RetryConfig::new(2)))
            .await
            .expect("second attempt must succeed");

        assert_eq!(response.body.text().await.expect("body"), "done");
        assert_eq!(client.transport.opened.load(Ordering::SeqCst), 2);
        let received = client.transport.received.lock().expect("lock").clone();
        assert_eq!(received, vec!["abc", "abc"]);
    }

    #[tokio::test]
    async fn read_once_stream_is_not_resent() {
        let transport = ScriptedTransport::default().push(refused).push(|| ok("never"));
        let client = HttpClient::with_transport(transport);
        let body = Body::from_chunks(stream::iter(vec!["a", "b"]));

        let err = client
            .send(request().with_body(body).with_retry(RetryConfig::new(3)))
            .await
            .expect_err("stream must not be replayed");

        assert!(matches!(err, Error::NonRetryableStreamBody { .. }));
        assert!(matches!(err.last_cause(), Error::NonRetryableStreamBody { .. }));
        assert_eq!(client.transport.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restartable_stream_is_resent() {
        let transport = ScriptedTransport::default().push(refused).push(|| ok("done"));
        let client = HttpClient::with_transport(transport);
        let body = Body::restartable(|| stream::iter(vec![Ok(Bytes::from_static(b"xy"))]));

        client
            .send(request().with_body(body).with_retry(RetryConfig::new(1)))
            .await
            .expect("restartable body must be resent");

        let received = client.transport.received.lock().expect("lock").clone();
        assert_eq!(received, vec!["xy", "xy"]);
    }

    #[tokio::test]
    async fn last_attempt_failure_with_stream_body_is_exhausted() {
        let transport = ScriptedTransport::default().push(refused);
        let client = HttpClient::with_transport(transport);
        let body = Body::from_chunks(stream::iter(vec!["a"]));

        let err = client
            .send(request().with_body(body).with_retry(RetryConfig::none()))
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Connectivity(_)));
    }

    #[tokio::test]
    async fn unexpected_status_carries_body() {
        let transport = ScriptedTransport::default().push(|| {
            Ok(InboundResponse {
                status: StatusCode::SERVICE_UNAVAILABLE,
                headers: HeaderMap::new(),
                body: stream::iter(vec![Ok(Bytes::from_static(b"busy"))]).boxed(),
            })
        });
        let client = HttpClient::with_transport(transport);

        let err = client.send(request()).await.expect_err("503 is not accepted");
        match err {
            Error::UnexpectedStatus { status, body, .. } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "busy");
            }
            other => panic!("expected unexpected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_transport_times_out() {
        struct Stalled;

        impl Transport for Stalled {
            fn open(
                &self,
                _head: RequestHead,
                _body: bridge::BridgeReceiver,
            ) -> BoxFuture<'static, Result<InboundResponse>> {
                futures_util::future::pending().boxed()
            }
        }

        let client = HttpClient::with_transport(Stalled);
        let err = client
            .send(request().with_timeout(Duration::from_millis(20)))
            .await
            .expect_err("must time out");
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn dropping_send_cancels_attempt_and_producer() {
        #[derive(Default)]
        struct Hanging {
            opened: AtomicUsize,
        }

        impl Transport for Hanging {
            fn open(
                &self,
                _head: RequestHead,
                mut body: bridge::BridgeReceiver,
            ) -> BoxFuture<'static, Result<InboundResponse>> {
                self.opened.fetch_add(1, Ordering::SeqCst);
                async move {
                    let _ = body.recv().await;
                    futures_util::future::pending::<Result<InboundResponse>>().await
                }
                .boxed()
            }
        }

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let endless = Body::from_stream(stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"x"))
        }));
        let client = HttpClient::with_transport(Hanging::default());

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            client.send(request().with_body(endless).with_retry(RetryConfig::new(5))),
        )
        .await;
        assert!(outcome.is_err(), "send must still be pending");

        sleep_briefly().await;
        let seen = pulled.load(Ordering::SeqCst);
        assert!(seen >= 1);
        sleep_briefly().await;
        assert_eq!(pulled.load(Ordering::SeqCst), seen);
        assert_eq!(client.transport.opened.load(Ordering::SeqCst), 1);
    }

    async fn sleep_briefly() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn correlation_header_is_forwarded() {
        let transport = ScriptedTransport::default().push(|| ok("done"));
        let client = HttpClient::with_transport(transport);
        let context = crate::RequestContext::default().with_correlation(
            reqwest::header::HeaderName::from_static("x-correlation-id"),
            reqwest::header::HeaderValue::from_static("abc-123"),
        );

        client
            .send(request().add_parameter("name", "kvarto").with_context(context))
            .await
            .expect("must succeed");

        let heads = client.transport.heads.lock().expect("lock");
        assert_eq!(heads[0].headers["x-correlation-id"], "abc-123");
        assert_eq!(heads[0].url.as_str(), "http://localhost/?name=kvarto");
        assert_eq!(heads[0].content_length, Some(0));
    }
}
