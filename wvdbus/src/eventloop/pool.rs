//! Worker threads for actions that must not run on the loop thread.

use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::{Mutex, RwLock};

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Terminate,
}

pub(crate) struct ThreadPool {
    max_workers: usize,
    workers: Vec<Worker>,
    num_busy: Arc<RwLock<usize>>,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl ThreadPool {
    /// Create a pool with `initial_workers` threads that grows up to
    /// `max_workers` while all workers are busy.
    ///
    /// # Panics
    ///
    /// Panics if `initial_workers` is zero.
    pub(crate) fn new(initial_workers: usize, max_workers: usize) -> ThreadPool {
        assert!(initial_workers > 0);

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let num_busy = Arc::new(RwLock::new(0_usize));

        let workers = (0..initial_workers)
            .map(|id| Worker::new(id, Arc::clone(&receiver), Arc::clone(&num_busy)))
            .collect();

        ThreadPool {
            max_workers: max_workers.max(initial_workers),
            workers,
            num_busy,
            sender,
            receiver,
        }
    }

    pub(crate) fn execute<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The receiver lives as long as the pool, so sending cannot fail.
        let _ = self.sender.send(Job::Run(Box::new(f)));
        if self.num_busy() + 1 >= self.workers.len() && self.workers.len() < self.max_workers {
            let id = self.workers.len();
            self.workers.push(Worker::new(
                id,
                Arc::clone(&self.receiver),
                Arc::clone(&self.num_busy),
            ));
        }
    }

    pub(crate) fn num_busy(&self) -> usize {
        *self.num_busy.read()
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Job::Terminate);
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                // A job may drop the last reference to the pool from a worker.
                if thread.thread().id() == thread::current().id() {
                    continue;
                }
                if thread.join().is_err() {
                    log::error!("pool worker {} panicked", worker.id);
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
        num_busy: Arc<RwLock<usize>>,
    ) -> Worker {
        let thread = thread::Builder::new()
            .name(format!("wvdbus-pool-{}", id))
            .spawn(move || loop {
                let job = receiver.lock().recv();

                match job {
                    Ok(Job::Run(f)) => {
                        *num_busy.write() += 1;
                        f();
                        *num_busy.write() -= 1;
                    }
                    Ok(Job::Terminate) | Err(_) => break,
                }
            });

        let thread = match thread {
            Ok(t) => Some(t),
            Err(e) => {
                log::error!("cannot spawn pool worker {}: {}", id, e);
                None
            }
        };

        Worker { id, thread }
    }
}
