use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::retention::ArrivalEvent;

pub type ListenFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Producer side of the arrival event stream: a connection to the chat
/// platform that forwards new messages until it drops.
pub trait ArrivalSource: Send + Sync {
    fn name(&self) -> &str;

    fn listen<'a>(&'a self, tx: tokio::sync::mpsc::Sender<ArrivalEvent>) -> ListenFuture<'a>;
}

/// Keep `source` listening, restarting it with doubling backoff whenever it
/// returns. Stops once the receiving side is gone.
pub fn spawn_supervised_listener(
    source: Arc<dyn ArrivalSource>,
    tx: tokio::sync::mpsc::Sender<ArrivalEvent>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let component = format!("source:{}", source.name());
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            tracing::debug!(component, "arrival listener starting");
            let result = source.listen(tx.clone()).await;

            if tx.is_closed() {
                break;
            }

            match result {
                Ok(()) => {
                    tracing::warn!(component, "listener exited; restarting");
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!(
                        component,
                        backoff_secs = backoff,
                        "listener error: {e:#}; restarting"
                    );
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double after sleeping so the first error waits the initial backoff.
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
