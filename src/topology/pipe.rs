//! The bounded in-memory pipe used to chain two byte-to-byte stages.
//!
//! The upstream stage is serviced by one task; the bounded channel keeps it
//! from outrunning the downstream consumer. Dropping the receiving end stops
//! the task at its next send, which releases the upstream stage; cancellation
//! is never reported as an error.

use bytes::Bytes;
use futures::{pin_mut, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{ConvertError, Result};
use crate::sources::ChunkStream;

use super::WorkerPool;

/// Chunks buffered between two chained stages before backpressure stalls the
/// upstream task.
pub const PIPE_CAPACITY: usize = 16;

/// Runs `upstream` through a bounded pipe serviced by one task, returning the
/// downstream end.
///
/// The first error terminates the pipe after being forwarded. Without a
/// runtime to service the task, the pipe fails with a resource-exhausted
/// error: nothing would ever drain the bounded buffer.
pub fn spawn_through_pipe<S>(
    pool: Option<&WorkerPool>,
    upstream: S,
    capacity: usize,
) -> ChunkStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Result<Bytes>>(capacity.max(1));

    let task = async move {
        pin_mut!(upstream);
        while let Some(item) = upstream.next().await {
            let terminal = item.is_err();
            if tx.send(item).await.is_err() {
                // Downstream cancelled; stop quietly.
                break;
            }
            if terminal {
                break;
            }
        }
    };

    let handle = match pool {
        Some(WorkerPool::Runtime(handle)) => Ok(handle.clone()),
        _ => tokio::runtime::Handle::try_current().map_err(|_| {
            ConvertError::exhausted(
                "no task is available to service the inter-stage pipe",
            )
        }),
    };

    match handle {
        Ok(handle) => {
            handle.spawn(task);
            async_stream::try_stream! {
                while let Some(item) = rx.recv().await {
                    yield item?;
                }
            }
            .boxed()
        }
        Err(error) => futures::stream::iter([Err(error)]).boxed(),
    }
}
