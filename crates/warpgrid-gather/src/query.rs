//! Prometheus instant-query client.
//!
//! [`QueryApi`] is the seam between the gatherer and the wire: one endpoint,
//! one instant query, one typed result. [`HttpQueryClient`] implements it
//! against the `/api/v1/query` HTTP endpoint using hyper's pooled client,
//! which is safe to share across concurrent calls.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri, header};
use http_body_util::{BodyExt, Empty};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use thiserror::Error;

/// Default per-request timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a single query against a single endpoint.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("query timed out")]
    Timeout,

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The server answered with `"status": "error"`.
    #[error("{error_type}: {error}")]
    Api { error_type: String, error: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

/// One labelled sample of an instant vector or a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: BTreeMap<String, String>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub value: f64,
}

/// One series of a range vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<(f64, f64)>,
}

/// Typed result of an instant query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Vector(Vec<Sample>),
    Scalar(Sample),
    Matrix(Vec<Series>),
    String(String),
}

impl QueryValue {
    /// The Prometheus `resultType` name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Vector(_) => "vector",
            Self::Scalar(_) => "scalar",
            Self::Matrix(_) => "matrix",
            Self::String(_) => "string",
        }
    }
}

/// Boxed future returned by [`QueryApi::query`].
pub type QueryFuture<'a> = Pin<Box<dyn Future<Output = Result<QueryValue, QueryError>> + Send + 'a>>;

/// A single query endpoint; tests substitute in-process doubles.
pub trait QueryApi: Send + Sync {
    /// The configured address, for logs and error tagging.
    fn address(&self) -> &str;

    /// Evaluate `query` as of `ts`.
    fn query<'a>(&'a self, query: &'a str, ts: SystemTime) -> QueryFuture<'a>;
}

/// HTTP(S) client for one Prometheus endpoint.
#[derive(Clone)]
pub struct HttpQueryClient {
    address: String,
    base: Uri,
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQueryClient")
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpQueryClient {
    /// Create a client for `address` (e.g. `http://prometheus:9090` or
    /// `https://prometheus.example.com`).
    ///
    /// HTTPS endpoints are verified against the Mozilla root store.
    ///
    /// # Errors
    /// Returns `QueryError::InvalidAddress` if the address is not an absolute
    /// `http://` or `https://` URL.
    pub fn new(address: &str, timeout: Duration) -> Result<Self, QueryError> {
        let base: Uri = address
            .parse()
            .map_err(|e| QueryError::InvalidAddress(format!("{address}: {e}")))?;

        match base.scheme_str() {
            Some("http" | "https") => {}
            Some(other) => {
                return Err(QueryError::InvalidAddress(format!(
                    "{address}: unsupported scheme {other:?}"
                )));
            }
            None => {
                return Err(QueryError::InvalidAddress(format!(
                    "{address}: missing scheme"
                )));
            }
        }
        if base.authority().is_none() {
            return Err(QueryError::InvalidAddress(format!("{address}: missing host")));
        }

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config()?)
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            address: address.to_string(),
            base,
            client,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn query_uri(&self, query: &str, ts: SystemTime) -> Result<Uri, QueryError> {
        let time = format_timestamp(ts);
        let params = serde_urlencoded::to_string([("query", query), ("time", time.as_str())])
            .map_err(|e| QueryError::InvalidAddress(format!("{}: {e}", self.address)))?;

        // Keep any path prefix (Prometheus behind a reverse proxy).
        let prefix = self.base.path().trim_end_matches('/');
        let scheme = self.base.scheme_str().unwrap_or("http");
        let authority = self
            .base
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();

        format!("{scheme}://{authority}{prefix}/api/v1/query?{params}")
            .parse()
            .map_err(|e| QueryError::InvalidAddress(format!("{}: {e}", self.address)))
    }

    async fn send(&self, uri: Uri) -> Result<QueryValue, QueryError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::ACCEPT, "application/json")
            .header(header::USER_AGENT, "warpgrid-gather/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?
            .to_bytes();

        decode_response(status, &body)
    }
}

impl QueryApi for HttpQueryClient {
    fn address(&self) -> &str {
        &self.address
    }

    fn query<'a>(&'a self, query: &'a str, ts: SystemTime) -> QueryFuture<'a> {
        Box::pin(async move {
            let uri = self.query_uri(query, ts)?;
            tokio::time::timeout(self.timeout, self.send(uri))
                .await
                .map_err(|_| QueryError::Timeout)?
        })
    }
}

/// Client TLS config using the Mozilla root certificate store.
fn tls_config() -> Result<rustls::ClientConfig, QueryError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok(rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| QueryError::Tls(format!("protocol version error: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth())
}

/// Unix seconds with millisecond precision, as the query API expects.
fn format_timestamp(ts: SystemTime) -> String {
    let d = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:03}", d.as_secs(), d.subsec_millis())
}

// ── Wire format ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    data: Option<ApiData>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Vector(Vec<ApiSample>),
    Scalar(ApiPoint),
    Matrix(Vec<ApiSeries>),
    String(ApiPoint),
}

#[derive(Deserialize)]
struct ApiSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: ApiPoint,
}

#[derive(Deserialize)]
struct ApiSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    values: Vec<ApiPoint>,
}

/// `[<unix seconds>, "<value>"]`
#[derive(Deserialize)]
struct ApiPoint(f64, String);

impl ApiPoint {
    fn value(&self) -> Result<f64, QueryError> {
        parse_sample_value(&self.1)
    }
}

/// Sample values are strings so that `NaN`, `+Inf` and `-Inf` survive JSON.
fn parse_sample_value(s: &str) -> Result<f64, QueryError> {
    s.parse::<f64>()
        .map_err(|_| QueryError::Decode(format!("invalid sample value {s:?}")))
}

/// Decode an `/api/v1/query` response body.
pub(crate) fn decode_response(status: StatusCode, body: &[u8]) -> Result<QueryValue, QueryError> {
    let resp: ApiResponse = match serde_json::from_slice(body) {
        Ok(resp) => resp,
        Err(e) if status.is_success() => return Err(QueryError::Decode(e.to_string())),
        Err(_) => {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(body).chars().take(256).collect(),
            });
        }
    };

    if resp.status != "success" {
        return Err(QueryError::Api {
            error_type: resp.error_type.unwrap_or_else(|| "unknown".to_string()),
            error: resp.error.unwrap_or_else(|| format!("status {status}")),
        });
    }

    let data = resp
        .data
        .ok_or_else(|| QueryError::Decode("missing data".to_string()))?;

    Ok(match data {
        ApiData::Vector(samples) => QueryValue::Vector(
            samples
                .into_iter()
                .map(|s| -> Result<Sample, QueryError> {
                    Ok(Sample {
                        timestamp: s.value.0,
                        value: s.value.value()?,
                        metric: s.metric,
                    })
                })
                .collect::<Result<_, QueryError>>()?,
        ),
        ApiData::Scalar(point) => QueryValue::Scalar(Sample {
            metric: BTreeMap::new(),
            timestamp: point.0,
            value: point.value()?,
        }),
        ApiData::Matrix(series) => QueryValue::Matrix(
            series
                .into_iter()
                .map(|s| -> Result<Series, QueryError> {
                    let values = s
                        .values
                        .iter()
                        .map(|p| -> Result<(f64, f64), QueryError> { Ok((p.0, p.value()?)) })
                        .collect::<Result<_, QueryError>>()?;
                    Ok(Series {
                        metric: s.metric,
                        values,
                    })
                })
                .collect::<Result<_, QueryError>>()?,
        ),
        ApiData::String(point) => QueryValue::String(point.1),
    })
}
