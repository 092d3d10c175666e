//! WasmGatherer — a gatherer backed by a plugin export.

use tracing::debug;

use warpgrid_gather::{
    GatherContext, GatherError, GatherFuture, GatherResult, Gatherer, GathererOptions, Quantity,
};

use crate::module::ExportedFunc;

/// Calls a `() -> f64` export and normalizes the result like any other
/// sample: NaN is [`GatherError::NoData`], finite values are rounded half
/// away from zero.
///
/// The guest runs on the blocking pool. Cancellation and deadlines return
/// promptly, but the guest call itself runs to completion in the background
/// and keeps the module's store busy until it does.
pub struct WasmGatherer {
    name: String,
    autoscaler: String,
    func: ExportedFunc<(), f64>,
}

impl std::fmt::Debug for WasmGatherer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmGatherer")
            .field("name", &self.name)
            .field("autoscaler", &self.autoscaler)
            .field("export", &self.func.name())
            .field("plugin", &self.func.plugin())
            .finish()
    }
}

impl WasmGatherer {
    pub fn new(ctx: &GatherContext, name: impl Into<String>, func: ExportedFunc<(), f64>) -> Self {
        Self {
            name: name.into(),
            autoscaler: ctx.autoscaler().to_string(),
            func,
        }
    }

    /// Registry name this gatherer was created under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Gatherer for WasmGatherer {
    fn gather<'a>(&'a self, ctx: &'a GatherContext) -> GatherFuture<'a> {
        Box::pin(async move {
            ctx.check()?;

            let func = self.func.clone();
            let call = tokio::task::spawn_blocking(move || func.call(()));

            let value = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                joined = call => joined
                    .map_err(|e| GatherError::Source(format!("plugin call aborted: {e}")))?
                    .map_err(|e| GatherError::Source(e.to_string()))?,
            };

            let quantity = Quantity::from_sample(value)?;
            debug!(
                autoscaler = %self.autoscaler,
                gatherer = %self.name,
                value,
                q = quantity.q,
                "plugin gather succeeded"
            );
            Ok(quantity)
        })
    }
}

/// Registry factory for a plugin-declared gatherer.
///
/// Plugin gatherers take no options; any key is a config error.
pub(crate) fn wasm_gatherer_factory(
    name: String,
    func: ExportedFunc<(), f64>,
) -> impl Fn(&GatherContext, &GathererOptions) -> GatherResult<Box<dyn Gatherer>> + Send + Sync + 'static
{
    move |ctx: &GatherContext, options: &GathererOptions| {
        if let Some(key) = options.keys().next() {
            return Err(GatherError::config(
                key.as_str(),
                format!("gatherer `{name}` takes no options"),
            ));
        }
        Ok(Box::new(WasmGatherer::new(ctx, name.clone(), func.clone())) as Box<dyn Gatherer>)
    }
}
