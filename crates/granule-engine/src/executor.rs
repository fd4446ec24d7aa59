//! The executor driving the stack
//!
//! Every receive event and timer callback enters the engine as a job.
//! Jobs carrying the same ordering key are executed in submission order
//! by landing on the same worker queue, which gives each exchange a total
//! order over its events without a global lock. Jobs must run to
//! completion without blocking; I/O completions re-enter as fresh jobs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// A unit of stack work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Routes all events of one exchange to one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingKey(u64);

impl OrderingKey {
    /// Key from the peer address and token bytes, the identifiers every
    /// event of an exchange shares
    pub fn new(remote: SocketAddr, token: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        remote.hash(&mut hasher);
        token.hash(&mut hasher);
        OrderingKey(hasher.finish())
    }
}

enum Inner {
    /// Run the job on the caller; for tests
    Inline,
    /// Fixed worker tasks, one bounded queue each
    Pool {
        queues: Vec<mpsc::Sender<Job>>,
        workers: Vec<JoinHandle<()>>,
    },
}

/// The stack executor
pub struct Executor {
    inner: Inner,
}

impl Executor {
    /// A no-threading executor that runs jobs inline
    pub fn inline() -> Self {
        Executor {
            inner: Inner::Inline,
        }
    }

    /// A pool of `workers` tasks with `queue_depth` jobs of backlog each
    pub fn pool(workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Job>(queue_depth.max(1));
            let handle = tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job();
                }
            });
            queues.push(tx);
            handles.push(handle);
        }

        Executor {
            inner: Inner::Pool {
                queues,
                workers: handles,
            },
        }
    }

    /// Submit a job. A full worker queue drops the job (datagram
    /// semantics: the peer retransmits what matters).
    pub fn execute(&self, key: OrderingKey, job: Job) {
        match &self.inner {
            Inner::Inline => job(),
            Inner::Pool { queues, .. } => {
                let index = (key.0 % queues.len() as u64) as usize;
                if let Err(e) = queues[index].try_send(job) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            warn!("executor queue {} full, dropping job", index);
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            warn!("executor queue {} closed, dropping job", index);
                        }
                    }
                }
            }
        }
    }

    /// Stop all workers; queued jobs are discarded
    pub fn shutdown(&self) {
        if let Inner::Pool { workers, .. } = &self.inner {
            for worker in workers {
                worker.abort();
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_inline_runs_immediately() {
        let executor = Executor::inline();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        executor.execute(
            OrderingKey::new(addr(1), &[]),
            Box::new(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_preserves_order_per_key() {
        let executor = Executor::pool(4, 64);
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let key = OrderingKey::new(addr(2), &[0xaa]);

        for i in 0..16 {
            let log = log.clone();
            executor.execute(
                key,
                Box::new(move || {
                    log.lock().push(i);
                }),
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_inputs_same_key() {
        let a = OrderingKey::new(addr(3), &[1, 2]);
        let b = OrderingKey::new(addr(3), &[1, 2]);
        assert_eq!(a, b);
    }
}
