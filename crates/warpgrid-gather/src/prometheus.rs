//! Prometheus gatherer with ordered endpoint failover.
//!
//! Queries a list of redundant Prometheus endpoints in their configured
//! order, one at a time, and stops at the first that answers. The answer
//! must be an instant vector with exactly one sample, which is rounded into
//! a [`Quantity`].
//!
//! ```text
//! gather()
//!   ts = now()                        (once, shared by every attempt)
//!   for endpoint in addresses:
//!       ok  → validate shape → NaN? → round → Quantity
//!       err → remember (index, address, error), try next
//!   all failed → AllEndpointsFailed[err0, err1, ...]
//! ```

use std::time::SystemTime;

use tracing::{debug, warn};

use crate::context::GatherContext;
use crate::error::{EndpointQueryError, GatherError, GatherResult, ShapeError};
use crate::gatherer::{GatherFuture, Gatherer};
use crate::options::{GathererOptions, optional_duration, required_str, required_str_list};
use crate::quantity::Quantity;
use crate::query::{DEFAULT_QUERY_TIMEOUT, HttpQueryClient, QueryApi, QueryValue};

/// Registry name of the Prometheus gatherer.
pub const PROMETHEUS_METRIC: &str = "prometheus_metric";

/// Ordered endpoint addresses.
pub const OPT_ADDRESSES: &str = "addresses";
/// PromQL expression sent verbatim to every endpoint.
pub const OPT_QUERY: &str = "query";
/// Per-endpoint query timeout.
pub const OPT_TIMEOUT: &str = "timeout";

/// Gathers a single value from Prometheus.
pub struct PrometheusMetric {
    query: String,
    /// One client per endpoint, in failover order.
    endpoints: Vec<Box<dyn QueryApi>>,
    autoscaler: String,
}

impl std::fmt::Debug for PrometheusMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetric")
            .field("query", &self.query)
            .field("addresses", &self.addresses())
            .field("autoscaler", &self.autoscaler)
            .finish()
    }
}

impl PrometheusMetric {
    /// Build from untyped options (`addresses`, `query`, optional `timeout`).
    ///
    /// One HTTP client is created per address up front; an address that
    /// cannot be turned into a client fails the whole construction.
    pub fn from_options(ctx: &GatherContext, opts: &GathererOptions) -> GatherResult<Self> {
        let addresses = required_str_list(opts, OPT_ADDRESSES)?;
        let query = required_str(opts, OPT_QUERY)?;
        let timeout = optional_duration(opts, OPT_TIMEOUT)?.unwrap_or(DEFAULT_QUERY_TIMEOUT);
        if timeout.is_zero() {
            return Err(GatherError::config(OPT_TIMEOUT, "must be greater than zero"));
        }

        let endpoints = addresses
            .iter()
            .map(|address| {
                HttpQueryClient::new(address, timeout)
                    .map(|client| Box::new(client) as Box<dyn QueryApi>)
                    .map_err(|e| GatherError::config(OPT_ADDRESSES, e.to_string()))
            })
            .collect::<GatherResult<Vec<_>>>()?;

        Self::with_endpoints(ctx, query, endpoints)
    }

    /// Build from already-constructed endpoint clients, in failover order.
    pub fn with_endpoints(
        ctx: &GatherContext,
        query: impl Into<String>,
        endpoints: Vec<Box<dyn QueryApi>>,
    ) -> GatherResult<Self> {
        let query = query.into();
        if endpoints.is_empty() {
            return Err(GatherError::config(OPT_ADDRESSES, "option is required"));
        }
        if query.is_empty() {
            return Err(GatherError::config(OPT_QUERY, "option is required"));
        }

        Ok(Self {
            query,
            endpoints,
            autoscaler: ctx.autoscaler().to_string(),
        })
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Endpoint addresses in failover order.
    pub fn addresses(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.address()).collect()
    }

    /// Try each endpoint in order until one answers.
    async fn query_endpoints(
        &self,
        ctx: &GatherContext,
        ts: SystemTime,
    ) -> GatherResult<QueryValue> {
        let mut errors = Vec::with_capacity(self.endpoints.len());

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            ctx.check()?;

            let result = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                result = endpoint.query(&self.query, ts) => result,
            };

            match result {
                Ok(value) => {
                    if index > 0 {
                        debug!(
                            autoscaler = %self.autoscaler,
                            endpoint = index,
                            address = %endpoint.address(),
                            "prometheus failover endpoint answered"
                        );
                    }
                    return Ok(value);
                }
                Err(source) => {
                    warn!(
                        autoscaler = %self.autoscaler,
                        endpoint = index,
                        address = %endpoint.address(),
                        error = %source,
                        "prometheus endpoint failed"
                    );
                    errors.push(EndpointQueryError {
                        index,
                        address: endpoint.address().to_string(),
                        source,
                    });
                }
            }
        }

        Err(GatherError::AllEndpointsFailed(errors))
    }
}

impl Gatherer for PrometheusMetric {
    fn gather<'a>(&'a self, ctx: &'a GatherContext) -> GatherFuture<'a> {
        Box::pin(async move {
            let ts = SystemTime::now();
            let value = self.query_endpoints(ctx, ts).await?;
            let quantity = extract_quantity(&value)?;

            debug!(
                autoscaler = %self.autoscaler,
                gatherer = PROMETHEUS_METRIC,
                quantity = quantity.q,
                "got prometheus metric"
            );
            Ok(quantity)
        })
    }
}

/// Accept only a single-sample vector and normalize its value.
fn extract_quantity(value: &QueryValue) -> GatherResult<Quantity> {
    let samples = match value {
        QueryValue::Vector(samples) => samples,
        other => return Err(ShapeError::NotVector(other.type_name().to_string()).into()),
    };

    match samples.as_slice() {
        [sample] => Quantity::from_sample(sample.value),
        _ => Err(ShapeError::SampleCount(samples.len()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryError, QueryFuture, Sample};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;

    type Respond = Box<dyn Fn() -> Result<QueryValue, QueryError> + Send + Sync>;

    /// Scripted endpoint that counts attempts and records timestamps.
    struct MockEndpoint {
        address: String,
        respond: Option<Respond>,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<SystemTime>>>,
    }

    impl MockEndpoint {
        fn ok(address: &str, value: QueryValue) -> Self {
            Self::new(address, Some(Box::new(move || Ok(value.clone()))))
        }

        fn err(address: &str, message: &'static str) -> Self {
            Self::new(
                address,
                Some(Box::new(move || Err(QueryError::Transport(message.to_string())))),
            )
        }

        fn timeout(address: &str) -> Self {
            Self::new(address, Some(Box::new(|| Err(QueryError::Timeout))))
        }

        /// Never answers.
        fn hang(address: &str) -> Self {
            Self::new(address, None)
        }

        fn new(address: &str, respond: Option<Respond>) -> Self {
            Self {
                address: address.to_string(),
                respond,
                calls: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl QueryApi for MockEndpoint {
        fn address(&self) -> &str {
            &self.address
        }

        fn query<'a>(&'a self, query: &'a str, ts: SystemTime) -> QueryFuture<'a> {
            Box::pin(async move {
                assert_eq!(query, "up");
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.seen.lock().unwrap().push(ts);
                match &self.respond {
                    Some(respond) => respond(),
                    None => std::future::pending().await,
                }
            })
        }
    }

    fn vector(values: &[f64]) -> QueryValue {
        QueryValue::Vector(
            values
                .iter()
                .map(|v| Sample {
                    metric: BTreeMap::new(),
                    timestamp: 1.0,
                    value: *v,
                })
                .collect(),
        )
    }

    fn gatherer(endpoints: Vec<MockEndpoint>) -> (PrometheusMetric, Vec<Arc<AtomicUsize>>) {
        let calls = endpoints.iter().map(|e| Arc::clone(&e.calls)).collect();
        let endpoints = endpoints
            .into_iter()
            .map(|e| Box::new(e) as Box<dyn QueryApi>)
            .collect();
        let metric = PrometheusMetric::with_endpoints(&GatherContext::new("test"), "up", endpoints).unwrap();
        (metric, calls)
    }

    fn counts(calls: &[Arc<AtomicUsize>]) -> Vec<usize> {
        calls.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }

    #[tokio::test]
    async fn first_endpoint_success_short_circuits() {
        let (metric, calls) = gatherer(vec![
            MockEndpoint::ok("http://a", vector(&[5.0])),
            MockEndpoint::ok("http://b", vector(&[9.0])),
        ]);

        let q = metric.gather(&GatherContext::default()).await.unwrap();
        assert_eq!(q, Quantity::new(5));
        assert_eq!(counts(&calls), vec![1, 0]);
    }

    #[tokio::test]
    async fn attempts_stop_at_first_success() {
        let (metric, calls) = gatherer(vec![
            MockEndpoint::err("http://a", "refused a"),
            MockEndpoint::err("http://b", "refused b"),
            MockEndpoint::ok("http://c", vector(&[12.0])),
            MockEndpoint::ok("http://d", vector(&[99.0])),
        ]);

        let q = metric.gather(&GatherContext::default()).await.unwrap();
        assert_eq!(q.q, 12);
        assert_eq!(counts(&calls), vec![1, 1, 1, 0]);
    }

    #[tokio::test]
    async fn all_endpoints_failed_lists_every_error_in_order() {
        let (metric, calls) = gatherer(vec![
            MockEndpoint::err("http://a", "first boom"),
            MockEndpoint::timeout("http://b"),
            MockEndpoint::err("http://c", "third boom"),
        ]);

        let err = metric.gather(&GatherContext::default()).await.unwrap_err();
        assert_eq!(counts(&calls), vec![1, 1, 1]);

        match &err {
            GatherError::AllEndpointsFailed(errors) => {
                let indexes: Vec<_> = errors.iter().map(|e| e.index).collect();
                assert_eq!(indexes, vec![0, 1, 2]);
                assert_eq!(errors[1].address, "http://b");
            }
            other => panic!("expected AllEndpointsFailed, got {other:?}"),
        }

        let msg = err.to_string();
        let first = msg.find("first boom").unwrap();
        let second = msg.find("timed out").unwrap();
        let third = msg.find("third boom").unwrap();
        assert!(first < second && second < third, "{msg}");
    }

    #[tokio::test]
    async fn every_endpoint_sees_the_same_timestamp() {
        let a = MockEndpoint::err("http://a", "down");
        let b = MockEndpoint::ok("http://b", vector(&[1.0]));
        let (seen_a, seen_b) = (Arc::clone(&a.seen), Arc::clone(&b.seen));
        let (metric, _) = gatherer(vec![a, b]);

        metric.gather(&GatherContext::default()).await.unwrap();

        let ts_a = seen_a.lock().unwrap()[0];
        let ts_b = seen_b.lock().unwrap()[0];
        assert_eq!(ts_a, ts_b);
    }

    #[tokio::test]
    async fn wrong_sample_count_is_shape_error() {
        let cases: [&[f64]; 3] = [&[], &[1.0, 2.0], &[1.0, 2.0, 3.0]];
        for values in cases {
            let (metric, _) = gatherer(vec![MockEndpoint::ok("http://a", vector(values))]);
            let err = metric.gather(&GatherContext::default()).await.unwrap_err();
            assert!(
                matches!(err, GatherError::Shape(ShapeError::SampleCount(n)) if n == values.len()),
                "{err:?}"
            );
        }
    }

    #[tokio::test]
    async fn non_vector_is_shape_error() {
        let scalar = QueryValue::Scalar(Sample {
            metric: BTreeMap::new(),
            timestamp: 1.0,
            value: 4.0,
        });
        let (metric, _) = gatherer(vec![MockEndpoint::ok("http://a", scalar)]);

        let err = metric.gather(&GatherContext::default()).await.unwrap_err();
        assert!(matches!(err, GatherError::Shape(ShapeError::NotVector(ref t)) if t == "scalar"));
    }

    #[tokio::test]
    async fn nan_sample_is_no_data() {
        let (metric, _) = gatherer(vec![MockEndpoint::ok("http://a", vector(&[f64::NAN]))]);
        let err = metric.gather(&GatherContext::default()).await.unwrap_err();
        assert!(matches!(err, GatherError::NoData));
    }

    #[tokio::test]
    async fn rounding_boundaries() {
        for (raw, expected) in [(2.5, 3), (-2.5, -3), (2.4, 2), (-0.4, 0), (1e6 + 0.5, 1_000_001)] {
            let (metric, _) = gatherer(vec![MockEndpoint::ok("http://a", vector(&[raw]))]);
            let q = metric.gather(&GatherContext::default()).await.unwrap();
            assert_eq!(q.q, expected, "round({raw})");
        }
    }

    #[tokio::test]
    async fn timeout_then_success_on_second_endpoint() {
        let (metric, calls) = gatherer(vec![
            MockEndpoint::timeout("http://a"),
            MockEndpoint::ok("http://b", vector(&[3.0])),
        ]);

        let q = metric.gather(&GatherContext::default()).await.unwrap();
        assert_eq!(q, Quantity { q: 3 });
        assert_eq!(counts(&calls), vec![1, 1]);
    }

    #[tokio::test]
    async fn cancellation_stops_failover() {
        let (metric, calls) = gatherer(vec![
            MockEndpoint::hang("http://a"),
            MockEndpoint::ok("http://b", vector(&[3.0])),
        ]);
        let metric = Arc::new(metric);

        let (tx, rx) = watch::channel(false);
        let ctx = GatherContext::new("test").with_cancellation(rx);
        let task = {
            let metric = Arc::clone(&metric);
            tokio::spawn(async move { metric.gather(&ctx).await })
        };

        // Let the first attempt start before cancelling.
        while calls[0].load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, GatherError::Cancelled));
        assert_eq!(counts(&calls), vec![1, 0]);
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempts() {
        let (metric, calls) = gatherer(vec![MockEndpoint::ok("http://a", vector(&[1.0]))]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let ctx = GatherContext::new("test").with_cancellation(rx);
        let err = metric.gather(&ctx).await.unwrap_err();
        assert!(matches!(err, GatherError::Cancelled));
        assert_eq!(counts(&calls), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_hanging_endpoint() {
        let (metric, calls) = gatherer(vec![
            MockEndpoint::hang("http://a"),
            MockEndpoint::ok("http://b", vector(&[3.0])),
        ]);

        let ctx = GatherContext::new("test").with_timeout(Duration::from_secs(2));
        let err = metric.gather(&ctx).await.unwrap_err();
        assert!(matches!(err, GatherError::DeadlineExceeded));
        assert_eq!(counts(&calls), vec![1, 0]);
    }

    #[tokio::test]
    async fn concurrent_gathers_share_one_instance() {
        let (metric, calls) = gatherer(vec![
            MockEndpoint::err("http://a", "down"),
            MockEndpoint::ok("http://b", vector(&[8.0])),
        ]);
        let metric = Arc::new(metric);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metric = Arc::clone(&metric);
                tokio::spawn(async move { metric.gather(&GatherContext::default()).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().q, 8);
        }
        assert_eq!(counts(&calls), vec![8, 8]);
    }

    // ── Construction ───────────────────────────────────────────────

    fn opts(value: serde_json::Value) -> GathererOptions {
        value.as_object().cloned().unwrap()
    }

    fn config_option(result: GatherResult<PrometheusMetric>) -> String {
        match result {
            Err(GatherError::Config { option, .. }) => option,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn empty_addresses_is_config_error() {
        let result = PrometheusMetric::from_options(
            &GatherContext::default(),
            &opts(json!({ "addresses": [], "query": "up" })),
        );
        assert_eq!(config_option(result), OPT_ADDRESSES);
    }

    #[test]
    fn missing_addresses_is_config_error() {
        let result =
            PrometheusMetric::from_options(&GatherContext::default(), &opts(json!({ "query": "up" })));
        assert_eq!(config_option(result), OPT_ADDRESSES);
    }

    #[test]
    fn missing_query_is_config_error() {
        let result = PrometheusMetric::from_options(
            &GatherContext::default(),
            &opts(json!({ "addresses": ["http://a:9090"] })),
        );
        assert_eq!(config_option(result), OPT_QUERY);
    }

    #[test]
    fn wrongly_typed_options_are_config_errors() {
        let result = PrometheusMetric::from_options(
            &GatherContext::default(),
            &opts(json!({ "addresses": "http://a:9090", "query": "up" })),
        );
        assert_eq!(config_option(result), OPT_ADDRESSES);

        let result = PrometheusMetric::from_options(
            &GatherContext::default(),
            &opts(json!({ "addresses": ["http://a:9090"], "query": ["up"] })),
        );
        assert_eq!(config_option(result), OPT_QUERY);

        let result = PrometheusMetric::from_options(
            &GatherContext::default(),
            &opts(json!({ "addresses": ["http://a:9090"], "query": "up", "timeout": "later" })),
        );
        assert_eq!(config_option(result), OPT_TIMEOUT);
    }

    #[test]
    fn overflowing_or_zero_timeout_is_config_error() {
        for timeout in ["307445734561825861m", "0s", "0ms"] {
            let result = PrometheusMetric::from_options(
                &GatherContext::default(),
                &opts(json!({ "addresses": ["http://a:9090"], "query": "up", "timeout": timeout })),
            );
            assert_eq!(config_option(result), OPT_TIMEOUT, "timeout {timeout:?}");
        }
    }

    #[test]
    fn https_addresses_are_accepted() {
        let metric = PrometheusMetric::from_options(
            &GatherContext::default(),
            &opts(json!({ "addresses": ["https://prom.example.com", "http://b:9090"], "query": "up" })),
        )
        .unwrap();
        assert_eq!(metric.addresses(), vec!["https://prom.example.com", "http://b:9090"]);
    }

    #[test]
    fn client_creation_failure_fails_construction() {
        let result = PrometheusMetric::from_options(
            &GatherContext::default(),
            &opts(json!({ "addresses": ["http://a:9090", "ftp://b"], "query": "up" })),
        );
        assert_eq!(config_option(result), OPT_ADDRESSES);
    }

    #[test]
    fn from_options_keeps_address_order() {
        let metric = PrometheusMetric::from_options(
            &GatherContext::new("api"),
            &opts(json!({
                "addresses": ["http://b:9090", "http://a:9090"],
                "query": "sum(up)",
                "timeout": "5s",
            })),
        )
        .unwrap();
        assert_eq!(metric.addresses(), vec!["http://b:9090", "http://a:9090"]);
        assert_eq!(metric.query(), "sum(up)");
    }
}
