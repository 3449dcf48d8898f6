use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Fixed-size worker pool over a lazily pulled item sequence.
///
/// With one worker, items run in order on the calling thread. With more,
/// each submission waits for an idle worker and is followed by
/// `submit_delay`, so a lazy source is never drained ahead of the workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
    submit_delay: Duration,
}

impl WorkerPool {
    pub fn new(workers: usize, submit_delay: Duration) -> Self {
        Self {
            workers: workers.max(1),
            submit_delay,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `job` for each item until the source ends or `should_stop`
    /// returns true before a dispatch. Returns once every dispatched job has
    /// finished.
    pub fn run<I, T, S, F>(&self, items: I, should_stop: S, job: F)
    where
        I: IntoIterator<Item = T>,
        T: Send,
        S: Fn() -> bool,
        F: Fn(T) + Sync,
    {
        if self.workers == 1 {
            for item in items {
                if should_stop() {
                    break;
                }
                job(item);
            }
            return;
        }

        let (tx, rx) = mpsc::sync_channel::<T>(0);
        let rx = Mutex::new(rx);
        thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| {
                    loop {
                        let next = match rx.lock() {
                            Ok(guard) => guard.recv(),
                            Err(_) => break,
                        };
                        match next {
                            Ok(item) => job(item),
                            Err(_) => break,
                        }
                    }
                });
            }

            for item in items {
                if should_stop() {
                    break;
                }
                if tx.send(item).is_err() {
                    break;
                }
                if !self.submit_delay.is_zero() {
                    thread::sleep(self.submit_delay);
                }
            }
            drop(tx);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn sequential_pool_preserves_order() {
        let pool = WorkerPool::new(1, Duration::ZERO);
        let seen = Mutex::new(Vec::new());
        pool.run(0..5, || false, |item| seen.lock().unwrap().push(item));
        assert_eq!(seen.into_inner().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn parallel_pool_runs_every_item() {
        let pool = WorkerPool::new(4, Duration::ZERO);
        let total = AtomicUsize::new(0);
        pool.run(1..=100, || false, |item| {
            total.fetch_add(item, Ordering::SeqCst);
        });
        assert_eq!(total.load(Ordering::SeqCst), 5050);
    }

    #[test]
    fn stop_prevents_new_dispatch() {
        let pool = WorkerPool::new(2, Duration::ZERO);
        let ran = AtomicUsize::new(0);
        pool.run(
            0..50,
            || ran.load(Ordering::SeqCst) >= 3,
            |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            },
        );
        let ran = ran.load(Ordering::SeqCst);
        assert!(ran >= 3 && ran < 50);
    }
}
