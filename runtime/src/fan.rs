//! Fan-out / fan-in over Tokio channels.
//!
//! [`fan_out`] spreads one input stream across a fixed number of concurrent consumers;
//! [`fan_in`] merges several producer streams into one, closing the output only after
//! every input is exhausted.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Consume `input` with `workers` concurrent handlers.
///
/// Each item is handled by exactly one handler. Returns once the input channel is closed
/// and drained and every handler call has finished. A panicking handler call is logged
/// and does not stop the other consumers.
pub async fn fan_out<T, H, Fut>(input: mpsc::Receiver<T>, workers: usize, handler: H)
where
    T: Send + 'static,
    H: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let input = Arc::new(Mutex::new(input));
    let handler = Arc::new(handler);
    let mut consumers = JoinSet::new();

    for consumer_id in 0..workers.max(1) {
        let input = Arc::clone(&input);
        let handler = Arc::clone(&handler);
        consumers.spawn(async move {
            loop {
                let next = input.lock().await.recv().await;
                let Some(item) = next else {
                    break;
                };
                // A panic here would take the whole consumer down with it
                let call = tokio::spawn(handler(item));
                if let Err(e) = call.await {
                    tracing::error!(consumer_id, error = %e, "Fan-out handler failed");
                }
            }
        });
    }

    while let Some(joined) = consumers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Fan-out consumer exited abnormally");
        }
    }
}

/// Merge `inputs` into a single receiver with room for `capacity` buffered items.
///
/// The output closes once all inputs have closed. Items from one input keep their
/// relative order; there is no ordering across inputs. Must be called from within a
/// Tokio runtime.
#[must_use]
pub fn fan_in<T>(inputs: Vec<mpsc::Receiver<T>>, capacity: usize) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (output, merged) = mpsc::channel(capacity.max(1));
    for mut input in inputs {
        let output = output.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if output.send(item).await.is_err() {
                    // Consumer went away
                    break;
                }
            }
        });
    }
    merged
}
