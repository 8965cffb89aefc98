use crate::error::QueueFull;
use crate::sync::Semaphore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    pending: Semaphore,
    capacity: usize,
    stop: AtomicBool,
}

/// Fixed set of threads draining a bounded FIFO of tasks.
///
/// `submit` never blocks: a full queue hands the task straight back.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(workers: usize, capacity: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 || capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one thread and one queue slot",
            ));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            pending: Semaphore::new(0),
            capacity,
            stop: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);
        let mut pool = Self { shared, threads: Vec::with_capacity(workers) };

        for i in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("staticd-worker-{i}"))
                .spawn(move || work::<T, F>(&shared, &handler))?;
            debug!(worker = i, "spawned worker thread");
            pool.threads.push(handle);
        }
        Ok(pool)
    }

    pub fn submit(&self, task: T) -> Result<(), QueueFull<T>> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.capacity {
            return Err(QueueFull { task, capacity: self.shared.capacity });
        }
        queue.push_back(task);
        drop(queue);
        self.shared.pending.post();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn workers(&self) -> usize {
        self.threads.len()
    }
}

fn work<T, F: Fn(T)>(shared: &Shared<T>, handler: &F) {
    loop {
        shared.pending.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let task = shared.queue.lock().pop_front();
        if let Some(task) = task {
            handler(task);
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for _ in &self.threads {
            self.shared.pending.post();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_fifo_order_on_one_worker() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(1, 16, move |n: u32| {
            tx.lock().send(n).unwrap();
        })
        .unwrap();
        for n in 0..10 {
            pool.submit(n).unwrap();
        }
        let got: Vec<u32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();
        let hooks = Mutex::new((started_tx, release_rx, done_tx));

        let pool = WorkerPool::new(1, 2, move |n: u32| {
            let hooks = hooks.lock();
            if n == 0 {
                hooks.0.send(()).unwrap();
                hooks.1.recv().unwrap();
            }
            hooks.2.send(n).unwrap();
        })
        .unwrap();

        pool.submit(0).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.submit(1).unwrap();
        pool.submit(2).unwrap();

        let rejected = pool.submit(3).unwrap_err();
        assert_eq!(rejected.task, 3);
        assert_eq!(rejected.capacity, 2);
        assert_eq!(pool.queued(), 2);

        release_tx.send(()).unwrap();
        let mut done: Vec<u32> = (0..3).map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        done.sort_unstable();
        assert_eq!(done, vec![0, 1, 2]);

        pool.submit(rejected.task).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
    }

    #[test]
    fn tasks_spread_over_workers_and_drop_joins() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = {
            let seen = Arc::clone(&seen);
            WorkerPool::new(4, 1024, move |buf: Vec<u8>| {
                let canary = buf[0];
                assert!(buf.iter().all(|&b| b == canary));
                seen.lock().push(canary);
            })
            .unwrap()
        };
        assert_eq!(pool.workers(), 4);
        for n in 0..200u8 {
            pool.submit(vec![n; 512]).unwrap();
        }
        while seen.lock().len() < 200 {
            thread::sleep(Duration::from_millis(5));
        }
        drop(pool);
        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..200u8).collect::<Vec<_>>());
    }

    #[test]
    fn zero_sized_pool_is_refused() {
        assert!(WorkerPool::new(0, 1, |_: u8| {}).is_err());
        assert!(WorkerPool::new(1, 0, |_: u8| {}).is_err());
    }
}
