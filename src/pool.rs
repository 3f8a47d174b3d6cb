use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::KiraError;

/// Cooperative cancellation flag, optionally chained to a parent token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled either directly or through `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .map(|parent| parent.is_cancelled())
                .unwrap_or(false)
    }

    pub fn check(&self) -> Result<(), KiraError> {
        if self.is_cancelled() {
            return Err(KiraError::interrupted(0));
        }
        Ok(())
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-width pool of fetch threads.
pub struct FetchPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
    width: usize,
}

impl FetchPool {
    pub fn new(width: usize) -> Result<Self, KiraError> {
        let width = width.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..width)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("kira-scf-fetch-{index}"))
                    .spawn(move || worker_loop(receiver))
                    .map_err(|err| KiraError::Filesystem(format!("spawn fetch thread: {err}")))
            })
            .collect::<Result<Vec<_>, KiraError>>()?;
        info!("created fetch pool with {width} threads");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers,
            width,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Starts a batch whose results come back in completion order.
    pub fn batch<T: Send + 'static>(&self, cancel: &CancelToken) -> Batch<'_, T> {
        let (sender, receiver) = mpsc::channel();
        Batch {
            pool: self,
            sender,
            receiver,
            cancel: cancel.child(),
            submitted: 0,
        }
    }

    fn execute(&self, job: Job) -> Result<(), KiraError> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| KiraError::Filesystem("fetch pool lock poisoned".to_string()))?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| KiraError::Unsupported("fetch pool is shut down".to_string()))?;
        sender
            .send(job)
            .map_err(|_| KiraError::Unsupported("fetch pool is shut down".to_string()))
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = match receiver.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

/// Completion queue for tasks submitted to a [`FetchPool`].
pub struct Batch<'a, T> {
    pool: &'a FetchPool,
    sender: Sender<T>,
    receiver: Receiver<T>,
    cancel: CancelToken,
    submitted: usize,
}

impl<T: Send + 'static> Batch<'_, T> {
    /// Token handed to tasks; cancelled when the batch is interrupted.
    pub fn token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn submit<F>(&mut self, task: F) -> Result<(), KiraError>
    where
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let sender = self.sender.clone();
        let cancel = self.cancel.clone();
        self.pool.execute(Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| task(&cancel))) {
                // the receiver is gone once the batch was abandoned
                Ok(result) => {
                    sender.send(result).ok();
                }
                Err(_) => error!("a fetch task panicked, its result is lost"),
            }
        }))?;
        self.submitted += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.submitted
    }

    pub fn is_empty(&self) -> bool {
        self.submitted == 0
    }

    /// Waits for every task, in completion order. On interruption the remaining tasks
    /// are cancelled and the results gathered so far are returned alongside the error,
    /// as they are when a task panicked.
    pub fn join(self, interrupt: &CancelToken) -> Result<Vec<T>, (KiraError, Vec<T>)> {
        let Batch {
            sender,
            receiver,
            cancel,
            submitted,
            ..
        } = self;
        // only the tasks hold senders now, so a lost task shows up as a disconnect
        drop(sender);
        let mut results = Vec::with_capacity(submitted);
        while results.len() < submitted {
            if interrupt.is_cancelled() {
                debug!(
                    "interrupted, cancelling {} outstanding task(s)",
                    submitted - results.len()
                );
                cancel.cancel();
                let completed = results.len();
                return Err((KiraError::interrupted(completed), results));
            }
            match receiver.recv_timeout(Duration::from_millis(50)) {
                Ok(result) => results.push(result),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let lost = submitted - results.len();
                    return Err((
                        KiraError::TaskFailed(format!("{lost} of {submitted} task(s) did not complete")),
                        results,
                    ));
                }
            }
        }
        Ok(results)
    }
}
