//! warpgrid-gather — pluggable metric sources for the autoscaler.
//!
//! A *gatherer* produces one integer [`Quantity`] per call from some external
//! system. Gatherers are built by name from untyped configuration through the
//! [`GathererRegistry`]; new kinds can be compiled in or supplied at runtime
//! by extension modules (see `warpgrid-plugin`).
//!
//! # Architecture
//!
//! ```text
//! GathererRegistry (name → factory)
//!   ├── prometheus_metric → PrometheusMetric
//!   │     ├── HttpQueryClient per endpoint (failover order)
//!   │     └── gather(): first answering endpoint wins
//!   └── plugin-registered factories
//!
//! caller loop:
//!   let g = registry.create(name, &ctx, &options)?;
//!   loop { let q = g.gather(&ctx).await?; ... }
//! ```
//!
//! Values are rounded half away from zero; NaN means "no data" and is an
//! error, never a zero quantity.

pub mod context;
pub mod error;
pub mod gatherer;
pub mod options;
pub mod prometheus;
pub mod quantity;
pub mod query;
pub mod registry;

pub use context::GatherContext;
pub use error::{EndpointQueryError, GatherError, GatherResult, ShapeError};
pub use gatherer::{GatherFuture, Gatherer};
pub use options::GathererOptions;
pub use prometheus::{PROMETHEUS_METRIC, PrometheusMetric};
pub use quantity::Quantity;
pub use query::{HttpQueryClient, QueryApi, QueryError, QueryValue, Sample};
pub use registry::{GathererFactory, GathererRegistry};
