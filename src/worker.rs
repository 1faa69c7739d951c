//! Background query workers.
//!
//! A fixed pool of threads shares one mutex-guarded FIFO and a condvar. Each
//! item carries an argument, the function to run on it and a completion
//! callback that runs on the worker thread. Panics inside an item are caught
//! and reported to its callback as `Err`.
//!
//! Shutdown drains: items queued before [`WorkerPool::shutdown`] still run
//! before the workers exit. A pool with zero threads runs items inline in
//! [`WorkerPool::submit`].

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::error::{CogentResult, WorkerError};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    items: VecDeque<Job>,
    shutting_down: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // Jobs run outside the lock, so a poisoned guard still holds a
        // consistent queue.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    threads: usize,
}

impl WorkerPool {
    pub fn new(threads: usize) -> CogentResult<Self> {
        let shared = Arc::new(Shared::default());
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("cogent-worker-{i}"))
                .spawn(move || worker_loop(&shared))
                .map_err(|e| WorkerError::Spawn {
                    message: e.to_string(),
                })?;
            handles.push(handle);
        }
        debug!(threads, "worker pool started");
        Ok(Self {
            shared,
            handles,
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Items waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// Queue `run(arg)`; `on_complete` receives its result or the panic
    /// message.
    pub fn submit<A, R, F, C>(&self, arg: A, run: F, on_complete: C) -> CogentResult<()>
    where
        A: Send + 'static,
        R: Send + 'static,
        F: FnOnce(A) -> R + Send + 'static,
        C: FnOnce(Result<R, String>) + Send + 'static,
    {
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| run(arg))).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!(%message, "background query panicked");
                message
            });
            on_complete(result);
        });

        if self.threads == 0 {
            if self.shared.lock().shutting_down {
                return Err(WorkerError::ShutDown.into());
            }
            job();
            return Ok(());
        }
        let mut queue = self.shared.lock();
        if queue.shutting_down {
            return Err(WorkerError::ShutDown.into());
        }
        queue.items.push_back(job);
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Stop accepting items, run everything already queued, then join the
    /// workers. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.lock().shutting_down = true;
        self.shared.ready.notify_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited by panic");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shutting_down
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    let mut queue = shared.lock();
    loop {
        if let Some(job) = queue.items.pop_front() {
            drop(queue);
            job();
            queue = shared.lock();
        } else if queue.shutting_down {
            return;
        } else {
            queue = shared.ready.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn results_reach_the_callback() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10u32 {
            let tx = tx.clone();
            pool.submit(i, |x| x * 2, move |r| tx.send(r).unwrap()).unwrap();
        }
        let mut got: Vec<u32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..10).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_queued_items() {
        let mut pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        // Hold the only worker until everything is queued.
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.submit(
            gate_rx,
            |gate| {
                let _ = gate.recv();
                0
            },
            |_| {},
        )
        .unwrap();
        for i in 1..=20u32 {
            let tx = tx.clone();
            pool.submit(i, |x| x, move |r| tx.send(r.unwrap()).unwrap()).unwrap();
        }
        gate_tx.send(()).unwrap();
        pool.shutdown();
        drop(tx);
        let done: Vec<u32> = rx.iter().collect();
        assert_eq!(done, (1..=20).collect::<Vec<_>>(), "FIFO order, nothing dropped");
        assert!(pool.submit(0u32, |x| x, |_| {}).is_err());
    }

    #[test]
    fn panics_are_reported_not_propagated() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        pool.submit((), |_| -> u32 { panic!("boom") }, move |r| tx.send(r).unwrap())
            .unwrap();
        pool.submit((), |_| 7u32, move |r| tx2.send(r).unwrap()).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.unwrap_err(), "boom");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(7));
    }

    #[test]
    fn zero_threads_runs_inline() {
        let pool = WorkerPool::new(0).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(3u32, |x| x + 1, move |r| tx.send(r).unwrap()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(4));
        assert_eq!(pool.pending(), 0);
    }
}
