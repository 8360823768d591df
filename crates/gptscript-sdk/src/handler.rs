use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gptscript_schema::Frame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::run::RunHandle;

pub type EventHandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;
/// Callback invoked for every protocol event of a run.
pub type EventHandler = Arc<dyn Fn(RunHandle, Arc<Frame>) -> EventHandlerFuture + Send + Sync>;

/// Wraps an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(RunHandle, Arc<Frame>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |run: RunHandle, frame: Arc<Frame>| Box::pin(handler(run, frame)))
}

/// Fans events out to one ordered worker per handler.
///
/// Each handler sees frames in stream order. Handlers run independently of
/// each other and of the decode loop; errors and panics are logged and do
/// not affect the run.
pub(crate) struct Dispatcher {
    queues: Vec<mpsc::UnboundedSender<Arc<Frame>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn spawn(handlers: &[EventHandler], run: RunHandle) -> Self {
        let mut queues = Vec::with_capacity(handlers.len());
        let mut workers = Vec::with_capacity(handlers.len());
        for (index, handler) in handlers.iter().enumerate() {
            let (sender, receiver) = mpsc::unbounded_channel();
            workers.push(tokio::spawn(drain_handler_queue(
                index,
                Arc::clone(handler),
                run.clone(),
                receiver,
            )));
            queues.push(sender);
        }
        Self { queues, workers }
    }

    pub(crate) fn dispatch(&self, frame: Frame) {
        let frame = Arc::new(frame);
        for queue in &self.queues {
            let _ = queue.send(Arc::clone(&frame));
        }
    }

    /// Closes every queue and waits until all handlers finished.
    pub(crate) async fn finish(self) {
        drop(self.queues);
        for (index, worker) in self.workers.into_iter().enumerate() {
            if let Err(error) = worker.await {
                tracing::warn!(handler = index, error = %error, "event handler worker failed");
            }
        }
    }
}

async fn drain_handler_queue(
    index: usize,
    handler: EventHandler,
    run: RunHandle,
    mut receiver: mpsc::UnboundedReceiver<Arc<Frame>>,
) {
    while let Some(frame) = receiver.recv().await {
        let event_type = frame.event_type();
        let task = tokio::spawn((handler)(run.clone(), frame));
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::warn!(
                    handler = index,
                    event_type = %event_type,
                    error = %error,
                    "event handler returned an error"
                );
            }
            Err(error) => {
                tracing::warn!(
                    handler = index,
                    event_type = %event_type,
                    error = %error,
                    "event handler panicked"
                );
            }
        }
    }
}
