//! The gatherer capability.

use std::future::Future;
use std::pin::Pin;

use crate::context::GatherContext;
use crate::error::GatherError;
use crate::quantity::Quantity;

/// Boxed future returned by [`Gatherer::gather`].
pub type GatherFuture<'a> = Pin<Box<dyn Future<Output = Result<Quantity, GatherError>> + Send + 'a>>;

/// Anything that can produce a [`Quantity`] on demand.
///
/// Implementations hold only read-only configuration and shareable client
/// handles, so `gather` may be called repeatedly and concurrently on the same
/// instance. A call may wait on network I/O and must return promptly with
/// [`GatherError::Cancelled`] or [`GatherError::DeadlineExceeded`] once the
/// context says so.
pub trait Gatherer: Send + Sync {
    /// Produce one quantity.
    fn gather<'a>(&'a self, ctx: &'a GatherContext) -> GatherFuture<'a>;
}

impl<G: Gatherer + ?Sized> Gatherer for Box<G> {
    fn gather<'a>(&'a self, ctx: &'a GatherContext) -> GatherFuture<'a> {
        (**self).gather(ctx)
    }
}

impl<G: Gatherer + ?Sized> Gatherer for std::sync::Arc<G> {
    fn gather<'a>(&'a self, ctx: &'a GatherContext) -> GatherFuture<'a> {
        (**self).gather(ctx)
    }
}
