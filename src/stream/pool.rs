//! Encoder worker pool.
//!
//! N OS threads, each bound to the shared encoder dispatcher. The pipeline
//! thread owns dispatch: it waits for a free worker, posts a one-slot job
//! into that worker's mailbox, and consumes finished results strictly in
//! dispatch order so the exposed frame never goes backwards in time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capture::Capture;
use crate::clock;
use crate::encoder::Encoder;
use crate::frame::Frame;

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Job {
    buf_index: usize,
    grab_ts: f64,
}

#[derive(Default)]
struct Mailbox {
    job: Option<Job>,
    stop: bool,
}

struct WorkerShared {
    number: usize,
    mailbox: Mutex<Mailbox>,
    cond: Condvar,
    /// Written by the worker between jobs, read by the pipeline afterwards.
    result: Mutex<Frame>,
    job_failed: AtomicBool,
    has_job: AtomicBool,
    /// `(job_start_ts, last_encode_duration)`
    timing: Mutex<(f64, f64)>,
}

/// Free-worker admission counter shared by the pool and all workers.
struct FreeCounter {
    count: Mutex<usize>,
    cond: Condvar,
}

pub struct WorkerPool {
    workers: Vec<Arc<WorkerShared>>,
    handles: Vec<thread::JoinHandle<()>>,
    free: Arc<FreeCounter>,
    /// Dispatch-order FIFO of worker numbers with unconsumed jobs/results.
    order: VecDeque<usize>,
}

impl WorkerPool {
    /// Spawns `min(requested, capture buffers)` workers; zero requests one
    /// worker per capture buffer.
    pub fn new(capture: Arc<Capture>, encoder: Arc<Encoder>, requested: usize) -> Self {
        let max_workers = capture.n_bufs().max(1);
        let n_workers = if requested == 0 {
            max_workers
        } else {
            requested.min(max_workers)
        };
        tracing::info!(workers = n_workers, "spawning encoder workers");

        let free = Arc::new(FreeCounter {
            count: Mutex::new(n_workers),
            cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for number in 0..n_workers {
            let shared = Arc::new(WorkerShared {
                number,
                mailbox: Mutex::new(Mailbox::default()),
                cond: Condvar::new(),
                result: Mutex::new(Frame::new()),
                job_failed: AtomicBool::new(false),
                has_job: AtomicBool::new(false),
                timing: Mutex::new((0.0, 0.0)),
            });
            let handle = thread::Builder::new()
                .name(format!("worker-{number}"))
                .spawn({
                    let shared = Arc::clone(&shared);
                    let capture = Arc::clone(&capture);
                    let encoder = Arc::clone(&encoder);
                    let free = Arc::clone(&free);
                    move || worker_loop(shared, capture, encoder, free)
                })
                .expect("spawning a worker thread never fails");
            workers.push(shared);
            handles.push(handle);
        }

        Self {
            workers,
            handles,
            free,
            order: VecDeque::new(),
        }
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    /// Blocks until at least one worker is free, rechecking `stop`.
    pub fn wait_free(&self, stop: &AtomicBool) -> bool {
        let mut count = self.free.count.lock().unwrap();
        loop {
            if *count > 0 {
                return true;
            }
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            let (guard, _) = self.free.cond.wait_timeout(count, WAIT_SLICE).unwrap();
            count = guard;
        }
    }

    /// True when the oldest-dispatched worker has a finished result waiting.
    pub fn oldest_done(&self) -> bool {
        match self.order.front() {
            Some(&number) => !self.workers[number].has_job.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Consumes the oldest finished result. Returns `Err(())` when that job
    /// failed and the capture session must restart.
    pub fn consume_oldest<F: FnOnce(&Frame)>(&mut self, consume: F) -> Result<(), ()> {
        let number = self.order.pop_front().expect("caller checked oldest_done");
        let worker = &self.workers[number];
        if worker.job_failed.swap(false, Ordering::SeqCst) {
            return Err(());
        }
        let result = worker.result.lock().unwrap();
        consume(&result);
        debug!(worker = number, "accepted result");
        Ok(())
    }

    /// Picks a free worker for dispatch, oldest job-start first.
    pub fn pick_free(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for worker in &self.workers {
            if worker.has_job.load(Ordering::SeqCst) {
                continue;
            }
            let start_ts = worker.timing.lock().unwrap().0;
            match best {
                Some((_, best_ts)) if best_ts <= start_ts => {}
                _ => best = Some((worker.number, start_ts)),
            }
        }
        best.map(|(number, _)| number)
    }

    /// Submits a grabbed buffer to `number`'s mailbox.
    ///
    /// If the worker still holds an unconsumed result, that result is
    /// discarded; finished frames are only ever exposed in dispatch order.
    pub fn dispatch(&mut self, number: usize, buf_index: usize, grab_ts: f64) {
        if self.order.contains(&number) {
            self.order.retain(|&n| n != number);
            debug!(worker = number, "dropped unconsumed result");
        }
        self.order.push_back(number);

        let worker = &self.workers[number];
        worker.has_job.store(true, Ordering::SeqCst);
        {
            let mut mailbox = worker.mailbox.lock().unwrap();
            mailbox.job = Some(Job { buf_index, grab_ts });
        }
        worker.cond.notify_one();

        let mut count = self.free.count.lock().unwrap();
        *count -= 1;
    }

    /// Average encode duration divided by the worker count; admission delay
    /// for the next grab.
    pub fn fluency_delay(&self) -> f64 {
        let n = self.workers.len() as f64;
        let mut sum = 0.0;
        for worker in &self.workers {
            let (_, duration) = *worker.timing.lock().unwrap();
            if duration > 0.0 {
                sum += duration;
            }
        }
        sum / n / n
    }

    /// True while any dispatched job is unfinished.
    pub fn busy(&self) -> bool {
        self.order
            .iter()
            .any(|&n| self.workers[n].has_job.load(Ordering::SeqCst))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            let mut mailbox = worker.mailbox.lock().unwrap();
            mailbox.stop = true;
            worker.cond.notify_one();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(
    shared: Arc<WorkerShared>,
    capture: Arc<Capture>,
    encoder: Arc<Encoder>,
    free: Arc<FreeCounter>,
) {
    debug!(worker = shared.number, "worker started");
    loop {
        let job = {
            let mut mailbox = shared.mailbox.lock().unwrap();
            loop {
                if mailbox.stop {
                    debug!(worker = shared.number, "worker stopped");
                    return;
                }
                if let Some(job) = mailbox.job.take() {
                    break job;
                }
                mailbox = shared.cond.wait(mailbox).unwrap();
            }
        };

        let start_ts = clock::now_monotonic();
        let hw = capture.buffer(job.buf_index);
        hw.incref();
        let compressed = {
            let mut raw = capture.hw_frame(job.buf_index);
            raw.grab_ts = job.grab_ts;
            let mut result = shared.result.lock().unwrap();
            encoder.compress(&raw, &mut result, false)
        };
        hw.decref();

        let released = capture.release(job.buf_index);
        let duration = clock::now_monotonic() - start_ts;

        match (&compressed, &released) {
            (Ok(()), Ok(())) => {
                let mut timing = shared.timing.lock().unwrap();
                *timing = (start_ts, duration);
                debug!(
                    worker = shared.number,
                    buffer = job.buf_index,
                    duration,
                    "compressed frame"
                );
            }
            _ => {
                if let Err(err) = compressed {
                    warn!(worker = shared.number, error = %err, "compression failed");
                }
                if released.is_err() {
                    warn!(worker = shared.number, buffer = job.buf_index, "buffer release failed");
                }
                shared.job_failed.store(true, Ordering::SeqCst);
            }
        }
        shared.has_job.store(false, Ordering::SeqCst);

        let mut count = free.count.lock().unwrap();
        *count += 1;
        drop(count);
        free.cond.notify_one();
    }
}
