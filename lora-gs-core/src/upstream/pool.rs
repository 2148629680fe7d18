use crate::context::RequestContext;
use futures::future::BoxFuture;
use lora_gs_error::{GSError, GSResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use tokio_util::task::TaskTracker;
use tracing::trace;

/// Upper bound of concurrent workers per pool.
pub const MAX_WORKERS: usize = 32;

/// Handler run by a worker for each published item.
pub type WorkFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unbounded queue drained by at most `max_workers` concurrent workers.
///
/// Items published before [`WorkerPool::wait`] are always handed to a worker,
/// also after the context is cancelled.
pub struct WorkerPool<T> {
    name: String,
    ctx: RequestContext,
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Starts the pool dispatcher.
    ///
    /// # Arguments
    /// * `ctx` - Context gating [`WorkerPool::publish`]; workers themselves are not
    ///   cancelled with it
    /// * `name` - Pool name used in logs and errors
    /// * `max_workers` - Concurrency bound, at least one
    /// * `work` - Handler invoked once per item
    pub fn new(
        ctx: RequestContext,
        name: impl Into<String>,
        max_workers: usize,
        work: WorkFn<T>,
    ) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let permits = Arc::new(Semaphore::new(max_workers.max(1)));
        let pool_name = name.clone();
        let dispatcher = tokio::spawn(async move {
            let workers = TaskTracker::new();
            while let Some(item) = rx.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let work = Arc::clone(&work);
                workers.spawn(async move {
                    work(item).await;
                    drop(permit);
                });
            }
            workers.close();
            workers.wait().await;
            trace!(pool = %pool_name, "Worker pool drained");
        });
        Self {
            name,
            ctx,
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues an item. Fails once the pool context is done or the pool is closed.
    pub fn publish(&self, item: T) -> GSResult<()> {
        if self.ctx.is_done() {
            return Err(GSError::Canceled);
        }
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(item).map_err(|_| GSError::Canceled),
            None => Err(GSError::Canceled),
        }
    }

    /// Closes the queue and waits until every queued item has been processed.
    pub async fn wait(&self) {
        drop(lock(&self.tx).take());
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test]
    async fn bounded_concurrency_and_drain() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (a, p, d) = (active.clone(), peak.clone(), done.clone());
        let pool = WorkerPool::new(
            RequestContext::background(),
            "test",
            4,
            Arc::new(move |_: usize| {
                let (a, p, d) = (a.clone(), p.clone(), d.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    d.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            }),
        );
        for i in 0..40 {
            pool.publish(i).unwrap();
        }
        pool.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 40);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(pool.publish(0).is_err());
    }

    #[tokio::test]
    async fn publish_fails_after_cancellation() {
        let ctx = RequestContext::background();
        let work: WorkFn<()> = Arc::new(|_| async {}.boxed());
        let pool = WorkerPool::new(ctx.clone(), "test", MAX_WORKERS, work);
        ctx.cancel();
        assert!(pool.publish(()).unwrap_err().is_canceled());
        pool.wait().await;
    }
}
