use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver};

/// Fixed set of worker threads fed through a bounded job queue.
#[derive(Clone, Copy, Debug)]
pub struct WorkerPool {
    workers: usize,
    queue_depth: usize,
}

/// Results of a dispatch. Exactly `count` results arrive unless the workers die.
pub struct Dispatch<R> {
    pub count: usize,
    results: Receiver<R>,
}

impl<R> Dispatch<R> {
    pub fn recv(&self) -> Option<R> {
        self.results.recv().ok()
    }
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        Self {
            workers: workers.max(1),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn dispatch<T, R, F>(&self, items: Vec<T>, job: F) -> std::io::Result<Dispatch<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let count = items.len();
        let (job_tx, job_rx) = bounded::<T>(self.queue_depth);
        let (result_tx, result_rx) = unbounded::<R>();
        let job = Arc::new(job);

        for index in 0..self.workers.min(count.max(1)) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let job = Arc::clone(&job);
            thread::Builder::new()
                .name(format!("scan-worker-{}", index))
                .spawn(move || {
                    for item in job_rx.iter() {
                        if result_tx.send(job(item)).is_err() {
                            break;
                        }
                    }
                })?;
        }
        drop(job_rx);
        drop(result_tx);

        thread::Builder::new()
            .name("scan-feeder".to_string())
            .spawn(move || {
                for item in items {
                    if job_tx.send(item).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Dispatch {
            count,
            results: result_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn every_dispatched_item_yields_one_result() {
        let pool = WorkerPool::new(3, 2);
        let dispatch = pool.dispatch((0..50u64).collect(), |n| n * n).unwrap();
        assert_eq!(dispatch.count, 50);
        let mut results: Vec<u64> = (0..dispatch.count).filter_map(|_| dispatch.recv()).collect();
        results.sort();
        assert_eq!(results, (0..50u64).map(|n| n * n).collect::<Vec<_>>());
        assert!(dispatch.recv().is_none());
    }

    #[test]
    fn concurrency_is_bounded_by_worker_count() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_job, peak_job) = (Arc::clone(&running), Arc::clone(&peak));
        let pool = WorkerPool::new(2, 1);
        let dispatch = pool
            .dispatch((0..12).collect(), move |n: u32| {
                let now = running_job.fetch_add(1, Ordering::SeqCst) + 1;
                peak_job.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running_job.fetch_sub(1, Ordering::SeqCst);
                n
            })
            .unwrap();
        for _ in 0..dispatch.count {
            dispatch.recv().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_dispatch_finishes_immediately() {
        let dispatch = WorkerPool::new(4, 4).dispatch(Vec::<u8>::new(), |n| n).unwrap();
        assert_eq!(dispatch.count, 0);
        assert!(dispatch.recv().is_none());
    }
}
