//! Bounded work queues and their worker pools. Enqueue never blocks:
//! a full queue reports the drop to the caller, which is how task
//! backpressure is accounted.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Non-blocking producer handle.
#[derive(Clone)]
pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl<T: Send + 'static> WorkQueue<T> {
    pub fn try_push(&self, item: T) -> Result<(), QueueFull> {
        self.tx.try_send(item).map_err(|_| QueueFull)
    }
}

/// Spawn `workers` consumers over one bounded queue. Workers run until
/// every producer handle is dropped and the queue drains.
pub fn work_pool<T, F, Fut>(
    name: &'static str,
    capacity: usize,
    workers: usize,
    handler: F,
) -> (WorkQueue<T>, Vec<JoinHandle<()>>)
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (tx, rx) = mpsc::channel::<T>(capacity);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        let rx = rx.clone();
        let handler = handler.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                match item {
                    Some(item) => handler(item).await,
                    None => break,
                }
            }
            tracing::debug!(pool = name, worker = n, "worker drained");
        }));
    }
    (WorkQueue { tx }, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn full_queue_reports_drop_instead_of_blocking() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let consumer_gate = gate.clone();
        let (queue, _handles) = work_pool("test", 2, 1, move |_item: u32| {
            let gate = consumer_gate.clone();
            async move {
                let _permit = gate.acquire().await;
            }
        });

        // one item in flight at the worker plus a full queue of two
        queue.try_push(1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.try_push(2).unwrap();
        queue.try_push(3).unwrap();
        assert_eq!(queue.try_push(4), Err(QueueFull));

        gate.add_permits(16);
    }

    #[tokio::test]
    async fn all_workers_consume() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let (queue, handles) = work_pool("test", 25, 4, move |_item: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for i in 0..20 {
            queue.try_push(i).unwrap();
        }
        drop(queue);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }
}
