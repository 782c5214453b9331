use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{event, Level};

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// the polled function reported that it is done
    Done,
    /// the overall timeout elapsed before the function was done
    TimedOut,
    /// the handle was cancelled or the scheduler was shut down
    Cancelled,
}

///
/// A handle to a running poll loop. Dropping the handle does not stop the
/// loop, call `cancel` for that.
///
#[derive(Debug)]
pub struct PollHandle {
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> PollOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(_) => PollOutcome::Cancelled,
        }
    }
}

///
/// Runs functions repeatedly on the tokio runtime, bounded by an overall
/// timeout. Every loop spawned here also listens to the scheduler's shutdown
/// channel, so `shutdown` ends all of them at their next suspension point.
///
#[derive(Debug)]
pub struct PollScheduler {
    notify_shutdown: broadcast::Sender<()>,
}

impl PollScheduler {
    pub fn new() -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        PollScheduler { notify_shutdown }
    }

    /// Call `f` now and then once every `interval` until it returns true.
    ///
    /// The elapsed time is checked before each call, so the tick which
    /// observes the timeout still calls `f` one last time.
    pub fn poll_func<F>(&self, mut f: F, timeout: Duration, interval: Duration) -> PollHandle
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.poll_func_stagger(
            move || if f() { None } else { Some(interval) },
            timeout,
            interval,
        )
    }

    /// Like `poll_func`, but `f` picks the delay before its next call.
    /// `None` stops the loop and `Some(Duration::ZERO)` falls back to
    /// `interval`.
    pub fn poll_func_stagger<F>(&self, mut f: F, timeout: Duration, interval: Duration) -> PollHandle
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let mut shutdown = self.notify_shutdown.subscribe();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            loop {
                let can_poll = started.elapsed() <= timeout;
                let delay = match f() {
                    None => return PollOutcome::Done,
                    Some(delay) if delay.is_zero() => interval,
                    Some(delay) => delay,
                };
                if !can_poll {
                    event!(Level::DEBUG, "poll loop timed out after {:?}", timeout);
                    return PollOutcome::TimedOut;
                }
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.recv() => return PollOutcome::Cancelled,
                }
            }
        });
        PollHandle { task }
    }

    /// A receiver which fires once `shutdown` is called.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify_shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        // no receivers just means no loop is running
        let _ = self.notify_shutdown.send(());
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}
