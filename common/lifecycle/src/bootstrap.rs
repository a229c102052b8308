use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{BoxError, Panicked};
use crate::task::TaskFn;

/// Runs every bootstrap function concurrently on one shared child of `ctx`.
///
/// The first failure cancels the shared context, the remaining functions are awaited,
/// and that first failure is returned. An empty list succeeds without spawning anything.
pub async fn run_bootstrap(ctx: &Context, fns: Vec<TaskFn>) -> Result<(), BoxError> {
    if fns.is_empty() {
        return Ok(());
    }

    let (shared, cancel) = Context::with_cancel(ctx);
    let _release = cancel.clone().drop_guard();

    debug!(count = fns.len(), "Lifecycle: running bootstrap functions");
    let mut set = JoinSet::new();
    for f in fns {
        set.spawn(f.call(shared.clone()));
    }

    let mut first: Option<BoxError> = None;
    while let Some(joined) = set.join_next().await {
        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(Panicked(panic).into()),
            Err(join_err) => Err(join_err.into()),
        };
        if let Err(e) = result {
            if first.is_none() {
                warn!(error = %e, "Lifecycle: bootstrap function failed, canceling siblings");
                cancel.cancel();
                first = Some(e);
            } else {
                debug!(error = %e, "Lifecycle: additional bootstrap failure");
            }
        }
    }

    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
