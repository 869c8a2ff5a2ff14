/// Bounded worker pool for relay frame handlers.
///
/// A fixed set of workers consumes a FIFO queue of jobs. The queue is
/// bounded: once it fills, `submit` blocks the caller — which is the
/// relay's reader loop, turning the bound into back-pressure toward the
/// client.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` workers over a queue of `depth` pending jobs.
    pub fn new(workers: usize, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(depth);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self { queue: tx, workers }
    }

    /// Enqueue a job, blocking while the queue is full. Errors only
    /// after shutdown.
    pub async fn submit<F>(&self, job: F) -> Result<(), ()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queue.send(Box::pin(job)).await.map_err(|_| ())
    }

    /// Stop accepting jobs and abort the workers. Queued jobs may be
    /// dropped; in-flight ones are cancelled.
    pub fn shutdown(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
