//! Delayed work for the orchestrator.
//!
//! Retries and waits are re-invoked through a [`Scheduler`]:
//!
//! - `TimerScheduler` runs each function after its delay on a tokio timer.
//! - `QueueScheduler` ignores delays and runs functions in FIFO order when a
//!   test calls [`QueueScheduler::process_next`], for fully manual stepping.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::TestError;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A unit of delayed work.
pub type ScheduledFn = Box<dyn FnOnce() -> BoxFuture<Result<(), TestError>> + Send>;

/// Receives the error of a scheduled function that failed.
pub type ErrorHandler = Box<dyn FnOnce(TestError) + Send>;

pub trait Scheduler: Send + Sync {
    /// Arms `func` to run after `delay`; `on_error` receives its failure.
    fn schedule_function(&self, func: ScheduledFn, delay: Duration, on_error: ErrorHandler);

    /// Returns true while any armed function has not finished.
    fn has_scheduled_function(&self) -> bool;

    /// Drops every armed function without running it.
    fn flush_timers(&self);

    /// Resolves the next time a function is armed after this call.
    fn wait_for_scheduled_function(&self) -> BoxFuture<()>;
}

fn armed_waiter(armed: &watch::Sender<u64>) -> BoxFuture<()> {
    let mut rx = armed.subscribe();
    Box::pin(async move {
        // A closed channel means the scheduler is gone; nothing will arm.
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    })
}

async fn run(func: ScheduledFn, on_error: ErrorHandler) {
    if let Err(e) = func().await {
        on_error(e);
    }
}

#[derive(Debug)]
pub struct TimerScheduler {
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    armed: watch::Sender<u64>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        let (armed, _) = watch::channel(0);
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            armed,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule_function(&self, func: ScheduledFn, delay: Duration, on_error: ErrorHandler) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run(func, on_error).await;
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, h| !h.is_finished());
            tasks.insert(id, handle);
        }
        self.armed.send_modify(|n| *n += 1);
        tracing::trace!(delay_ms = delay.as_millis() as u64, "Scheduled function");
    }

    fn has_scheduled_function(&self) -> bool {
        self.pending_count() > 0
    }

    fn flush_timers(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }

    fn wait_for_scheduled_function(&self) -> BoxFuture<()> {
        armed_waiter(&self.armed)
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.flush_timers();
    }
}

pub struct QueueScheduler {
    queue: Mutex<VecDeque<(ScheduledFn, ErrorHandler)>>,
    armed: watch::Sender<u64>,
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl QueueScheduler {
    pub fn new() -> Self {
        let (armed, _) = watch::channel(0);
        Self {
            queue: Mutex::new(VecDeque::new()),
            armed,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Runs the oldest queued function. Returns false if the queue was empty.
    pub async fn process_next(&self) -> bool {
        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some((func, on_error)) => {
                run(func, on_error).await;
                true
            }
            None => false,
        }
    }

    /// Runs queued functions until the queue is empty, including any they
    /// enqueue. Returns how many ran.
    pub async fn process_all(&self) -> usize {
        let mut processed = 0;
        while self.process_next().await {
            processed += 1;
        }
        processed
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for QueueScheduler {
    fn schedule_function(&self, func: ScheduledFn, _delay: Duration, on_error: ErrorHandler) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back((func, on_error));
        }
        self.armed.send_modify(|n| *n += 1);
    }

    fn has_scheduled_function(&self) -> bool {
        self.queue_len() > 0
    }

    fn flush_timers(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn wait_for_scheduled_function(&self) -> BoxFuture<()> {
        armed_waiter(&self.armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> ScheduledFn {
        let counter = Arc::clone(counter);
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn failing() -> ScheduledFn {
        Box::new(|| Box::pin(async { Err(TestError::checkpoint_server_error("boom")) }))
    }

    #[tokio::test]
    async fn test_queue_scheduler_fifo() {
        let scheduler = QueueScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            scheduler.schedule_function(
                Box::new(move || {
                    Box::pin(async move {
                        order.lock().unwrap().push(i);
                        Ok(())
                    })
                }),
                Duration::from_secs(60 - i),
                Box::new(|_| {}),
            );
        }
        assert!(scheduler.has_scheduled_function());
        assert_eq!(scheduler.process_all().await, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(!scheduler.has_scheduled_function());
        assert!(!scheduler.process_next().await);
    }

    #[tokio::test]
    async fn test_queue_scheduler_reports_errors() {
        let scheduler = QueueScheduler::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        scheduler.schedule_function(
            failing(),
            Duration::ZERO,
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.process_next().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_scheduler_flush() {
        let scheduler = QueueScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_function(counting(&counter), Duration::ZERO, Box::new(|_| {}));
        scheduler.flush_timers();
        assert!(!scheduler.process_next().await);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_scheduler_runs_after_delay() {
        let scheduler = TimerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_function(counting(&counter), Duration::from_secs(5), Box::new(|_| {}));
        assert!(scheduler.has_scheduled_function());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_scheduled_function());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_scheduler_flush() {
        let scheduler = TimerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_function(counting(&counter), Duration::from_secs(1), Box::new(|_| {}));
        scheduler.flush_timers();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!scheduler.has_scheduled_function());
    }

    #[tokio::test]
    async fn test_wait_for_scheduled_function() {
        let scheduler = Arc::new(QueueScheduler::new());
        let waiter = scheduler.wait_for_scheduled_function();
        let handle = tokio::spawn(waiter);

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_function(counting(&counter), Duration::ZERO, Box::new(|_| {}));

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should resolve once a function is armed")
            .unwrap();
    }
}
