//! Parallel fan-out of many operations against one cluster.
use std::sync::Arc;

use futures::StreamExt;
use multik_core::operation::Operation;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ApiResponse, Cluster, OpContext},
    error::Error,
};

/// Knobs for a batch run.
#[derive(Clone, Debug, Default)]
pub struct BatchOptions {
    /// Cap on concurrently running operations; defaults to the pool size
    pub concurrency: Option<usize>,
    /// Deadline applied to every child operation
    pub deadline: Option<std::time::Duration>,
    /// Cancelling this token cancels every in-flight child
    pub cancel: Option<CancellationToken>,
}

/// Run every operation in parallel and gather results in input order.
///
/// One failed operation never cancels the others; its slot in the result
/// sequence carries the error. Cancelling the batch token yields
/// `Cancelled` for children that had not completed.
pub async fn run_many(
    cluster: &Arc<Cluster>,
    ops: Vec<Operation>,
    opts: &BatchOptions,
) -> Vec<Result<ApiResponse, Error>> {
    let limit = opts
        .concurrency
        .unwrap_or_else(|| cluster.pool_size())
        .max(1);
    let ctx = OpContext {
        deadline: opts.deadline,
        cancel: opts.cancel.clone(),
    };

    futures::stream::iter(ops.into_iter().map(|op| {
        let cluster = cluster.clone();
        let ctx = ctx.clone();
        async move { cluster.run_with(&op, &ctx).await }
    }))
    .buffered(limit)
    .collect()
    .await
}
