//! Gatherer registry — name → factory table.
//!
//! Factories are registered during startup, either for built-in gatherers
//! ([`GathererRegistry::with_builtins`]) or by extension modules as they are
//! loaded. After that the table is only read: the control loop calls
//! [`GathererRegistry::create`] with a name and the per-gatherer options
//! taken from configuration.
//!
//! The table sits behind an `RwLock`, so registration racing with creation
//! is safe, but the expected order is all `register` calls first.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use tracing::{debug, info};

use crate::context::GatherContext;
use crate::error::{GatherError, GatherResult};
use crate::gatherer::Gatherer;
use crate::options::GathererOptions;
use crate::prometheus::{PROMETHEUS_METRIC, PrometheusMetric};

/// Builds a gatherer from validated options.
///
/// Factories must validate `options` eagerly and fail with
/// [`GatherError::Config`] naming the offending key.
pub type GathererFactory =
    Arc<dyn Fn(&GatherContext, &GathererOptions) -> GatherResult<Box<dyn Gatherer>> + Send + Sync>;

static GLOBAL: LazyLock<Arc<GathererRegistry>> =
    LazyLock::new(|| Arc::new(GathererRegistry::with_builtins()));

/// Table of gatherer factories keyed by name.
#[derive(Default)]
pub struct GathererRegistry {
    factories: RwLock<HashMap<String, GathererFactory>>,
}

impl std::fmt::Debug for GathererRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GathererRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl GathererRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the gatherers compiled into this crate.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        register_builtins(&registry);
        registry
    }

    /// The process-wide registry, seeded with the built-in gatherers.
    pub fn global() -> Arc<GathererRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Register a factory under `name`.
    ///
    /// # Errors
    /// Returns `GatherError::DuplicateName` if `name` is taken; the existing
    /// entry is left untouched.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> GatherResult<()>
    where
        F: Fn(&GatherContext, &GathererOptions) -> GatherResult<Box<dyn Gatherer>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(&name) {
            return Err(GatherError::DuplicateName(name));
        }
        debug!(gatherer = %name, "gatherer registered");
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Build the gatherer registered under `name`.
    ///
    /// The returned gatherer does not reference the registry.
    pub fn create(
        &self,
        name: &str,
        ctx: &GatherContext,
        options: &GathererOptions,
    ) -> GatherResult<Box<dyn Gatherer>> {
        // Clone the factory out so the lock is not held while it runs.
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| GatherError::UnknownGatherer(name.to_string()))?;

        let gatherer = factory(ctx, options)?;
        info!(autoscaler = %ctx.autoscaler(), gatherer = %name, "gatherer created");
        Ok(gatherer)
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Drop every registration. For test isolation.
    pub fn reset(&self) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Register the gatherers that ship with this crate.
pub fn register_builtins(registry: &GathererRegistry) {
    // The registry is fresh here, so the name cannot collide.
    let _ = registry.register(PROMETHEUS_METRIC, |ctx, opts| {
        Ok(Box::new(PrometheusMetric::from_options(ctx, opts)?) as Box<dyn Gatherer>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatherer::GatherFuture;
    use crate::quantity::Quantity;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(i64);

    impl Gatherer for Fixed {
        fn gather<'a>(&'a self, _ctx: &'a GatherContext) -> GatherFuture<'a> {
            let q = self.0;
            Box::pin(async move { Ok(Quantity::new(q)) })
        }
    }

    fn fixed(q: i64) -> impl Fn(&GatherContext, &GathererOptions) -> GatherResult<Box<dyn Gatherer>> {
        move |_, _| Ok(Box::new(Fixed(q)) as Box<dyn Gatherer>)
    }

    #[tokio::test]
    async fn register_and_create() {
        let registry = GathererRegistry::new();
        registry.register("fixed", fixed(7)).unwrap();

        let ctx = GatherContext::new("api");
        let gatherer = registry.create("fixed", &ctx, &GathererOptions::new()).unwrap();
        assert_eq!(gatherer.gather(&ctx).await.unwrap(), Quantity::new(7));
    }

    #[tokio::test]
    async fn duplicate_register_keeps_first() {
        let registry = GathererRegistry::new();
        registry.register("fixed", fixed(1)).unwrap();

        let err = registry.register("fixed", fixed(2)).unwrap_err();
        assert!(matches!(err, GatherError::DuplicateName(ref n) if n == "fixed"));

        let ctx = GatherContext::default();
        let gatherer = registry.create("fixed", &ctx, &GathererOptions::new()).unwrap();
        assert_eq!(gatherer.gather(&ctx).await.unwrap().q, 1);
    }

    #[test]
    fn unknown_name_constructs_nothing() {
        let registry = GathererRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry
            .register("counted", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Fixed(0)) as Box<dyn Gatherer>)
            })
            .unwrap();

        let result = registry.create("missing", &GatherContext::default(), &GathererOptions::new());
        assert!(matches!(result, Err(GatherError::UnknownGatherer(ref n)) if n == "missing"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn factory_config_errors_propagate() {
        let registry = GathererRegistry::with_builtins();
        let opts = json!({ "addresses": ["http://a"] }).as_object().cloned().unwrap();

        let result = registry.create(PROMETHEUS_METRIC, &GatherContext::default(), &opts);
        match result {
            Err(GatherError::Config { option, .. }) => assert_eq!(option, "query"),
            Err(other) => panic!("expected config error, got {other}"),
            Ok(_) => panic!("expected config error"),
        }
    }

    #[test]
    fn builtins_and_reset() {
        let registry = GathererRegistry::with_builtins();
        assert!(registry.contains(PROMETHEUS_METRIC));
        assert_eq!(registry.names(), vec![PROMETHEUS_METRIC.to_string()]);

        registry.reset();
        assert!(registry.names().is_empty());
        assert!(!registry.contains(PROMETHEUS_METRIC));
    }

    #[test]
    fn global_registry_has_builtins() {
        assert!(GathererRegistry::global().contains(PROMETHEUS_METRIC));
    }
}
