//! Serves [`HttpRequest`] handlers through an `axum` router.

use std::{future::Future, sync::Arc};

use axum::{
    body::Body as AxumBody,
    extract::Request,
    http::{
        header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING},
        HeaderName, HeaderValue, Method, StatusCode,
    },
    response::Response,
    routing::{on, MethodFilter},
    Router,
};
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpListener;

use crate::{bridge, Body, Error, HttpRequest, HttpResponse, RequestContext, Result};

type Handler = Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> + Send + Sync>;

struct Route {
    path: String,
    method: Method,
    filter: MethodFilter,
    operation_id: Option<String>,
    handler: Handler,
}

/// Routes requests to `async fn(HttpRequest) -> Result<HttpResponse>`
/// handlers.
///
/// Inbound bodies reach the handler as [`Body::Stream`] fed through a stream
/// bridge. Response bodies are written with a fixed length for
/// [`Body::Bytes`] and chunked for [`Body::Stream`]. A handler returning
/// `Err` produces an empty `500` response.
#[derive(Default)]
pub struct HttpServer {
    routes: Vec<Route>,
    correlation_header: Option<HeaderName>,
}

impl HttpServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies header `name` from each request into its
    /// [`RequestContext`] and echoes it on the response.
    pub fn correlation_header(mut self, name: HeaderName) -> Self {
        self.correlation_header = Some(name);
        self
    }

    /// Registers `handler` for `method` on `path` (axum path syntax).
    ///
    /// A second registration for the same method and path replaces the
    /// first. Fails for methods the router cannot dispatch.
    pub fn route<H, Fut>(self, method: Method, path: &str, handler: H) -> Result<Self>
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.register(method, path, None, handler)
    }

    /// Like [`route`](Self::route), tagging requests with `operation_id`.
    pub fn operation<H, Fut>(
        self,
        method: Method,
        path: &str,
        operation_id: impl Into<String>,
        handler: H,
    ) -> Result<Self>
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.register(method, path, Some(operation_id.into()), handler)
    }

    pub fn get<H, Fut>(self, path: &str, handler: H) -> Self
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.add(MethodFilter::GET, Method::GET, path, handler)
    }

    pub fn post<H, Fut>(self, path: &str, handler: H) -> Self
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.add(MethodFilter::POST, Method::POST, path, handler)
    }

    pub fn put<H, Fut>(self, path: &str, handler: H) -> Self
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.add(MethodFilter::PUT, Method::PUT, path, handler)
    }

    pub fn patch<H, Fut>(self, path: &str, handler: H) -> Self
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.add(MethodFilter::PATCH, Method::PATCH, path, handler)
    }

    pub fn delete<H, Fut>(self, path: &str, handler: H) -> Self
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.add(MethodFilter::DELETE, Method::DELETE, path, handler)
    }

    fn register<H, Fut>(
        self,
        method: Method,
        path: &str,
        operation_id: Option<String>,
        handler: H,
    ) -> Result<Self>
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        let filter = MethodFilter::try_from(method.clone())
            .map_err(|err| Error::InvalidRequest(format!("cannot route {method}: {err}")))?;
        Ok(self.insert(Route {
            path: path.to_owned(),
            method,
            filter,
            operation_id,
            handler: Arc::new(move |request| handler(request).boxed()),
        }))
    }

    fn add<H, Fut>(self, filter: MethodFilter, method: Method, path: &str, handler: H) -> Self
    where
        H: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse>> + Send + 'static,
    {
        self.insert(Route {
            path: path.to_owned(),
            method,
            filter,
            operation_id: None,
            handler: Arc::new(move |request| handler(request).boxed()),
        })
    }

    fn insert(mut self, route: Route) -> Self {
        self.routes
            .retain(|existing| existing.path != route.path || existing.method != route.method);
        self.routes.push(route);
        self
    }

    /// Builds the `axum` router serving the registered handlers.
    pub fn into_router(self) -> Router {
        let correlation_header = self.correlation_header;
        self.routes.into_iter().fold(Router::new(), |router, route| {
            let Route {
                path,
                filter,
                operation_id,
                handler,
                ..
            } = route;
            let correlation_header = correlation_header.clone();
            let endpoint = move |request: Request| {
                dispatch(
                    handler.clone(),
                    operation_id.clone(),
                    correlation_header.clone(),
                    request,
                )
            };
            // Methods registered on the same path are merged by the router.
            router.route(&path, on(filter, endpoint))
        })
    }

    /// Serves on `listener` until the task is dropped or the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, self.into_router())
            .await
            .map_err(|err| Error::Connectivity(Box::new(err)))
    }

    /// Serves on `listener` until `shutdown` resolves, then drains open
    /// connections.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|err| Error::Connectivity(Box::new(err)))
    }
}

async fn dispatch(
    handler: Handler,
    operation_id: Option<String>,
    correlation_header: Option<HeaderName>,
    request: Request,
) -> Response {
    let correlation = correlation_header.and_then(|name| {
        let value = request.headers().get(&name).cloned()?;
        Some((name, value))
    });

    let request = match inbound(request, operation_id, correlation.clone()) {
        Ok(request) => request,
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_err, "rejecting malformed request");
            return empty(StatusCode::BAD_REQUEST, correlation);
        }
    };

    #[cfg(feature = "tracing")]
    let operation = request.context.operation_id.clone();

    match handler(request).await {
        Ok(response) => outbound(response, correlation),
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(operation_id = ?operation, error = %_err, "handler failed");
            empty(StatusCode::INTERNAL_SERVER_ERROR, correlation)
        }
    }
}

fn inbound(
    request: Request,
    operation_id: Option<String>,
    correlation: Option<(HeaderName, HeaderValue)>,
) -> Result<HttpRequest> {
    let (parts, body) = request.into_parts();

    let raw_url = if parts.uri.scheme().is_some() {
        parts.uri.to_string()
    } else {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}{}", parts.uri)
    };
    let url = Url::parse(&raw_url)
        .map_err(|err| Error::InvalidRequest(format!("invalid request target '{raw_url}': {err}")))?;

    let declared_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let chunked = parts.headers.contains_key(TRANSFER_ENCODING);

    let body = match declared_length {
        Some(0) => Body::Empty,
        None if !chunked => Body::Empty,
        _ => {
            let chunks = body
                .into_data_stream()
                .map(|chunk| chunk.map_err(|err| Error::Connectivity(Box::new(err))))
                .boxed();
            let streamed = Body::from_stream(bridge::spawn_pump(chunks));
            match declared_length {
                Some(length) => streamed.with_declared_length(length),
                None => streamed,
            }
        }
    };

    let mut request = HttpRequest::new(url).with_method(parts.method).with_body(body);
    request.headers = parts.headers;
    request.context = RequestContext {
        operation_id,
        correlation,
    };
    Ok(request)
}

fn outbound(response: HttpResponse, correlation: Option<(HeaderName, HeaderValue)>) -> Response {
    let HttpResponse {
        status,
        mut headers,
        body,
    } = response;

    let declared_length = body.declared_length();
    let content = match body {
        Body::Empty => AxumBody::empty(),
        Body::Bytes(bytes) => AxumBody::from(bytes),
        streamed @ Body::Stream(_) => match stream_body(streamed) {
            Ok(content) => {
                if let Some(length) = declared_length {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                }
                content
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "response body unavailable");
                return empty(StatusCode::INTERNAL_SERVER_ERROR, correlation);
            }
        },
    };

    let mut response = Response::new(content);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    echo(&mut response, correlation);
    response
}

fn stream_body(mut body: Body) -> Result<AxumBody> {
    let content = body.content()?;
    Ok(AxumBody::from_stream(bridge::spawn_pump(content)))
}

fn empty(status: StatusCode, correlation: Option<(HeaderName, HeaderValue)>) -> Response {
    let mut response = Response::new(AxumBody::empty());
    *response.status_mut() = status;
    echo(&mut response, correlation);
    response
}

fn echo(response: &mut Response, correlation: Option<(HeaderName, HeaderValue)>) {
    if let Some((name, value)) = correlation {
        response.headers_mut().entry(name).or_insert(value);
    }
}
