use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use log::{debug, error};
use thiserror::Error;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Fixed number of worker threads sharing one job queue.
///
/// At most `size` jobs run at once; the rest wait in the queue in submission order.
/// Dropping the pool lets the workers finish every queued job, then joins them.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    load: Arc<Load>,
}

#[derive(Debug, Default)]
struct Load {
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl ThreadPool {
    /// # Panics
    /// If `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "thread pool needs at least one worker");

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let load = Arc::new(Load::default());

        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver), Arc::clone(&load)));
        }

        Self {
            workers,
            sender: Some(sender),
            load,
        }
    }

    /// Queue `f` for the next free worker. Never blocks.
    pub fn execute<F>(&self, f: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolClosed)?;
        self.load.queued.fetch_add(1, Ordering::SeqCst);
        sender.send(Box::new(f)).map_err(|_| {
            self.load.queued.fetch_sub(1, Ordering::SeqCst);
            PoolClosed
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs currently running.
    pub fn active(&self) -> usize {
        self.load.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.load.queued.load(Ordering::SeqCst)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                error!("worker {} exited abnormally", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, load: Arc<Load>) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = receiver
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
                match msg {
                    Ok(job) => {
                        load.queued.fetch_sub(1, Ordering::SeqCst);
                        load.active.fetch_add(1, Ordering::SeqCst);
                        debug!("worker {id} picked up a job");

                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("worker {id} job panicked");
                        }
                        load.active.fetch_sub(1, Ordering::SeqCst);
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Barrier, atomic::AtomicUsize, mpsc::channel},
        time::Duration,
    };

    use super::*;

    #[test]
    #[should_panic(expected = "thread pool needs at least one worker")]
    fn zero_sized_pool() {
        ThreadPool::new(0);
    }

    #[test]
    fn runs_every_job_before_drop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(3);

        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        drop(pool);

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn bounds_concurrent_jobs() {
        let pool = ThreadPool::new(2);
        let release = Arc::new(Barrier::new(3));
        let (started, events) = channel();

        for i in 0..3 {
            let release = Arc::clone(&release);
            let started = started.clone();
            pool.execute(move || {
                started.send(i).unwrap();
                if i < 2 {
                    release.wait();
                }
            })
            .unwrap();
        }

        let mut first = vec![
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        first.sort();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.queued(), 1);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        release.wait();
        assert_eq!(events.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let pool = ThreadPool::new(1);
        let (done, finished) = channel();

        pool.execute(|| panic!("job failure")).unwrap();
        pool.execute(move || done.send(()).unwrap()).unwrap();

        assert!(finished.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(pool.size(), 1);
    }
}
