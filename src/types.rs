use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Url,
};

use crate::{Body, Error, Result, RetryConfig};

/// Statuses a caller accepts as a successful outcome.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum AcceptedStatuses {
    /// Any `2xx` status.
    #[default]
    Success,
    Any,
    Only(Vec<StatusCode>),
}

impl AcceptedStatuses {
    pub fn contains(&self, status: StatusCode) -> bool {
        match self {
            Self::Success => status.is_success(),
            Self::Any => true,
            Self::Only(statuses) => statuses.contains(&status),
        }
    }
}

/// Per-request overrides of the client defaults.
#[derive(Clone, Debug, Default)]
pub struct RequestMetadata {
    pub accepted_statuses: AcceptedStatuses,
    /// Deadline for the response head of each attempt.
    pub timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
}

/// Values that travel with a request through the pipeline.
///
/// Filled by [`HttpServer`](crate::HttpServer) for inbound requests and read
/// by [`HttpClient`](crate::HttpClient) when sending.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RequestContext {
    pub operation_id: Option<String>,
    /// Header echoed on responses and forwarded on outbound calls.
    pub correlation: Option<(HeaderName, HeaderValue)>,
}

impl RequestContext {
    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_correlation(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.correlation = Some((name, value));
        self
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    /// Target without query string; see [`HttpRequest::params`].
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    /// Query parameters in insertion order.
    pub params: Vec<(String, String)>,
    pub body: Body,
    pub metadata: RequestMetadata,
    pub context: RequestContext,
}

impl HttpRequest {
    /// Creates a `GET` request. Query pairs already present in `url` are
    /// moved into [`HttpRequest::params`].
    pub fn new(mut url: Url) -> Self {
        let params = url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        url.set_query(None);
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            params,
            body: Body::Empty,
            metadata: RequestMetadata::default(),
            context: RequestContext::default(),
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|err| Error::InvalidRequest(format!("invalid url '{url}': {err}")))?;
        Ok(Self::new(url))
    }

    /// Resolves `path` against the current url.
    pub fn with_path(mut self, path: &str) -> Result<Self> {
        self.url = self
            .url
            .join(path)
            .map_err(|err| Error::InvalidRequest(format!("invalid path '{path}': {err}")))?;
        Ok(self)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn add_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Result<Self> {
        let (name, value) = parse_header(name, value)?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_accepted_statuses(mut self, statuses: AcceptedStatuses) -> Self {
        self.metadata.accepted_statuses = statuses;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.metadata.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.metadata.retry = Some(retry);
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// First value of the query parameter `name`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First value of header `name` if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Url with the query parameters appended.
    pub fn target_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.params);
        }
        url
    }
}

#[derive(Debug, Default)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// `200 OK` with a text body.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Body::from(body.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Result<Self> {
        let (name, value) = parse_header(name, value)?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::try_from(name)
        .map_err(|err| Error::InvalidRequest(format!("invalid header name '{name}': {err}")))?;
    let header_value = HeaderValue::try_from(value)
        .map_err(|err| Error::InvalidRequest(format!("invalid value for header '{name}': {err}")))?;
    Ok((header_name, header_value))
}
