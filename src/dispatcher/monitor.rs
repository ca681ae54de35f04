//! Background consumer of a dispatch's completion queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::messages::CompletionMessage;
use crate::queue::MessageQueue;

/// How long one blocking receive waits before looping.
const RECEIVE_SLICE: Duration = Duration::from_secs(5);

/// Forwards every completion from one queue into a channel.
///
/// The task stops when the token is cancelled or the receiving side is
/// dropped. Dropping the monitor cancels it.
pub struct CompletionMonitor {
    receiver: mpsc::Receiver<CompletionMessage>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CompletionMonitor {
    /// Starts consuming `queue_name`.
    pub fn spawn(
        queue: Arc<MessageQueue>,
        queue_name: impl Into<String>,
        buffer: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, receiver) = mpsc::channel(buffer.max(1));
        let queue_name = queue_name.into();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            debug!(queue = %queue_name, "Completion monitor started");
            while !task_cancel.is_cancelled() && !tx.is_closed() {
                let received = queue
                    .receive_blocking::<CompletionMessage>(&queue_name, RECEIVE_SLICE, &task_cancel)
                    .await;
                match received {
                    Ok(Some(item)) => {
                        if let Err(e) = queue.acknowledge(&item).await {
                            warn!(queue = %queue_name, id = %item.id, error = %e, "Failed to acknowledge completion");
                        }
                        if tx.send(item.data).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(queue = %queue_name, error = %e, "Completion receive failed, backing off");
                        tokio::select! {
                            _ = task_cancel.cancelled() => break,
                            _ = tokio::time::sleep(queue.poll_interval()) => {}
                        }
                    }
                }
            }
            debug!(queue = %queue_name, "Completion monitor stopped");
        });

        Self {
            receiver,
            cancel,
            handle,
        }
    }

    /// Next completion, or `None` once the monitor has stopped.
    pub async fn recv(&mut self) -> Option<CompletionMessage> {
        self.receiver.recv().await
    }

    /// Stops the consumer and waits for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.receiver.close();
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "Completion monitor task failed");
        }
    }
}

impl Drop for CompletionMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
