use std::future::Future;

use futures::{StreamExt, stream};
use tokio::task::JoinError;
use tokio_util::task::AbortOnDropHandle;

/// Runs `f` on every item with at most `thread_count` tasks in flight.
///
/// Every item runs on its own task, so a panicking worker turns into a [`JoinError`] for that
/// item instead of aborting the batch. The results are returned in input order.
///
/// Dropping the returned future aborts all running tasks and starts no new ones.
pub async fn run_concurrent<I, F, Fut>(
    items: I,
    thread_count: usize,
    f: F,
) -> Vec<Result<Fut::Output, JoinError>>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    stream::iter(items)
        .map(|item| AbortOnDropHandle::new(tokio::spawn(f(item))))
        .buffered(thread_count.max(1))
        .collect()
        .await
}
