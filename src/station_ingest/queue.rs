// station_ingest - Rate-limited ingestion and backfill for weather station APIs
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Single consumer broker for every outbound API call.
//!
//! Callers hand the queue a closure producing a future. The consumer task pops
//! requests in FIFO order, waits on the [`RateLimiter`], runs the future, and sends
//! the outcome back over a channel owned by that one request.

use crate::client::ClientError;
use crate::limiter::RateLimiter;
use crate::metrics::QueueMetrics;
use serde::Serialize;
use std::error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Result produced by a queued callable.
pub type CallResult<T> = Result<T, ClientError>;

#[derive(Debug)]
pub enum QueueError {
    NotRunning,
    NoRuntime,
    Full,
    Timeout,
    Cancelled,
    Panicked,
    Upstream(ClientError),
}

impl QueueError {
    /// True when retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Full => true,
            Self::Upstream(e) => e.is_transient(),
            _ => false,
        }
    }

    /// True when the queue itself is gone and no further calls can be made.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotRunning | Self::NoRuntime | Self::Cancelled)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Upstream(ClientError::RateLimited))
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "request queue is not running"),
            Self::NoRuntime => write!(f, "request queue must be started from within a tokio runtime"),
            Self::Full => write!(f, "request queue is full"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Cancelled => write!(f, "request cancelled by queue shutdown"),
            Self::Panicked => write!(f, "request panicked while executing"),
            Self::Upstream(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for QueueError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Upstream(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Minimum gap between outbound calls.
    pub min_interval: Duration,
    /// Upper bound on a single call's execution once it reaches the head of the queue.
    pub call_timeout: Duration,
    /// Number of requests that may wait in the queue.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            min_interval: RateLimiter::DEFAULT_INTERVAL,
            call_timeout: Duration::from_secs(10),
            capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub running: bool,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub depth: u64,
}

enum Outcome {
    Completed,
    Failed,
}

/// Where the result of a request goes.
pub(crate) enum Reply<T> {
    Async(oneshot::Sender<Result<T, QueueError>>),
    Blocking {
        tx: std::sync::mpsc::SyncSender<Result<T, QueueError>>,
        abandoned: Arc<AtomicBool>,
    },
}

impl<T> Reply<T> {
    fn is_abandoned(&self) -> bool {
        match self {
            Self::Async(tx) => tx.is_closed(),
            Self::Blocking { abandoned, .. } => abandoned.load(Ordering::Acquire),
        }
    }

    fn deliver(self, result: Result<T, QueueError>) {
        // The receiver may have given up waiting, in which case the result is dropped here.
        match self {
            Self::Async(tx) => {
                let _ = tx.send(result);
            }
            Self::Blocking { tx, .. } => {
                let _ = tx.try_send(result);
            }
        }
    }
}

trait Pending: Send {
    fn is_abandoned(&self) -> bool;

    fn execute(self: Box<Self>, call_timeout: Duration, cancel: CancellationToken) -> BoxFuture<Outcome>;

    fn reject(self: Box<Self>, err: QueueError);
}

struct Call<F, T> {
    callable: F,
    reply: Reply<T>,
}

impl<F, Fut, T> Pending for Call<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = CallResult<T>> + Send + 'static,
    T: Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.reply.is_abandoned()
    }

    fn execute(self: Box<Self>, call_timeout: Duration, cancel: CancellationToken) -> BoxFuture<Outcome> {
        let Call { callable, reply } = *self;

        Box::pin(async move {
            // Run on its own task so that a panic lands in the JoinError instead of
            // taking down the consumer.
            let mut handle = tokio::spawn(callable());
            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = tokio::time::timeout(call_timeout, &mut handle) => Some(res),
            };

            let result = match waited {
                Some(Ok(Ok(Ok(v)))) => Ok(v),
                Some(Ok(Ok(Err(e)))) => Err(QueueError::Upstream(e)),
                Some(Ok(Err(e))) if e.is_panic() => Err(QueueError::Panicked),
                Some(Ok(Err(_))) => Err(QueueError::Cancelled),
                Some(Err(_)) => {
                    handle.abort();
                    Err(QueueError::Timeout)
                }
                None => {
                    handle.abort();
                    Err(QueueError::Cancelled)
                }
            };

            let outcome = if result.is_ok() {
                Outcome::Completed
            } else {
                Outcome::Failed
            };

            reply.deliver(result);
            outcome
        })
    }

    fn reject(self: Box<Self>, err: QueueError) {
        self.reply.deliver(Err(err));
    }
}

/// A callable waiting in the queue along with the channel its result goes to.
pub struct Request {
    submitted: Instant,
    call: Box<dyn Pending>,
}

impl Request {
    pub(crate) fn new<F, Fut, T>(callable: F, reply: Reply<T>) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        Request {
            submitted: Instant::now(),
            call: Box::new(Call { callable, reply }),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("submitted", &self.submitted).finish()
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Running {
        tx: mpsc::Sender<Request>,
        consumer: JoinHandle<()>,
    },
    Stopped,
}

#[derive(Debug)]
struct Inner {
    config: QueueConfig,
    limiter: Arc<RateLimiter>,
    metrics: QueueMetrics,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the broker. Cheap to clone; every clone refers to the same consumer.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_metrics(config, QueueMetrics::default())
    }

    pub fn with_metrics(config: QueueConfig, metrics: QueueMetrics) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.min_interval));
        RequestQueue {
            inner: Arc::new(Inner {
                config,
                limiter,
                metrics,
                cancel: CancellationToken::new(),
                state: Mutex::new(State::Idle),
            }),
        }
    }

    /// Spawn the consumer on the current tokio runtime. Calling this on a running
    /// queue does nothing; a queue that has been shut down can't be started again.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut state = self.inner.state();
        match *state {
            State::Running { .. } => return Ok(()),
            State::Stopped => return Err(QueueError::NotRunning),
            State::Idle => {}
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(self.inner.config.capacity.max(1));
        let consumer = runtime.spawn(consume(
            rx,
            self.inner.limiter.clone(),
            self.inner.metrics.clone(),
            self.inner.config.call_timeout,
            self.inner.cancel.clone(),
        ));

        tracing::info!(
            message = "request queue started",
            min_interval_ms = self.inner.config.min_interval.as_millis() as u64,
            capacity = self.inner.config.capacity,
        );

        *state = State::Running { tx, consumer };
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state(), State::Running { .. })
    }

    /// Submit a callable from async code and wait for its result.
    ///
    /// `timeout` covers both waiting for a slot in the queue and waiting for the
    /// result. A caller that times out leaves its request behind; the consumer skips
    /// it if it hasn't started yet, otherwise the result is discarded.
    pub async fn enqueue<F, Fut, T>(&self, callable: F, timeout: Duration) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let sender = self.sender()?;
        let (tx, rx) = oneshot::channel();
        let request = Request::new(callable, Reply::Async(tx));

        self.inner.metrics.enqueued();
        match tokio::time::timeout_at(deadline, sender.send(request)).await {
            Ok(Ok(())) => self.inner.metrics.accepted(),
            Ok(Err(_)) => {
                self.inner.metrics.enqueue_failed();
                return Err(QueueError::NotRunning);
            }
            Err(_) => {
                self.inner.metrics.enqueue_failed();
                return Err(QueueError::Timeout);
            }
        }

        drop(sender);
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueueError::Cancelled),
            Err(_) => Err(QueueError::Timeout),
        }
    }

    /// Non-blocking submission used by the thread bridge.
    pub(crate) fn try_submit(&self, sender: &mpsc::Sender<Request>, request: Request) -> Result<(), QueueError> {
        if !self.is_running() {
            return Err(QueueError::NotRunning);
        }

        self.inner.metrics.enqueued();
        match sender.try_send(request) {
            Ok(()) => {
                self.inner.metrics.accepted();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.metrics.enqueue_failed();
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.metrics.enqueue_failed();
                Err(QueueError::NotRunning)
            }
        }
    }

    /// Weak handle to the running consumer's channel. It stops upgrading once the
    /// queue is shut down and the last in-progress submission has finished.
    pub(crate) fn downgrade(&self) -> Result<mpsc::WeakSender<Request>, QueueError> {
        match &*self.inner.state() {
            State::Running { tx, .. } => Ok(tx.downgrade()),
            _ => Err(QueueError::NotRunning),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Request>, QueueError> {
        match &*self.inner.state() {
            State::Running { tx, .. } => Ok(tx.clone()),
            _ => Err(QueueError::NotRunning),
        }
    }

    /// Stop accepting work, give queued and in-flight requests up to `drain_timeout`
    /// to finish, then cancel whatever is left.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let consumer = {
            let mut state = self.inner.state();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running { tx, consumer } => {
                    drop(tx);
                    Some(consumer)
                }
                _ => None,
            }
        };

        let mut consumer = match consumer {
            Some(c) => c,
            None => return,
        };

        tracing::info!(
            message = "draining request queue",
            depth = self.inner.metrics.depth(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
        );

        if tokio::time::timeout(drain_timeout, &mut consumer).await.is_err() {
            tracing::warn!(
                message = "request queue did not drain in time, cancelling remaining requests",
                depth = self.inner.metrics.depth(),
            );

            self.inner.cancel.cancel();
            if let Err(e) = consumer.await {
                tracing::error!(message = "request queue consumer failed", error = %e);
            }
        }

        tracing::info!(message = "request queue stopped");
    }

    pub fn stats(&self) -> QueueStats {
        let metrics = &self.inner.metrics;
        QueueStats {
            running: self.is_running(),
            submitted: metrics.submitted_total(),
            completed: metrics.completed_total(),
            failed: metrics.failed_total(),
            abandoned: metrics.abandoned_total(),
            depth: metrics.depth(),
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Request>,
    limiter: Arc<RateLimiter>,
    metrics: QueueMetrics,
    call_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(r) => r,
                None => break,
            },
        };

        metrics.dequeued(request.submitted.elapsed());
        if request.call.is_abandoned() {
            metrics.abandoned();
            tracing::debug!(message = "skipping request abandoned by its caller");
            continue;
        }

        if limiter.acquire(&cancel).await.is_err() {
            request.call.reject(QueueError::Cancelled);
            metrics.failed();
            break;
        }

        let started = Instant::now();
        let outcome = request.call.execute(call_timeout, cancel.clone()).await;
        limiter.touch().await;

        match outcome {
            Outcome::Completed => metrics.completed(),
            Outcome::Failed => metrics.failed(),
        }

        tracing::debug!(
            message = "executed queued request",
            elapsed_ms = started.elapsed().as_millis() as u64,
            depth = metrics.depth(),
        );
    }

    rx.close();
    while let Ok(request) = rx.try_recv() {
        metrics.dequeued(request.submitted.elapsed());
        request.call.reject(QueueError::Cancelled);
        metrics.failed();
    }
}

#[cfg(test)]
mod test {
    use super::{QueueConfig, QueueError, RequestQueue};
    use crate::client::ClientError;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::oneshot;

    fn config(min_interval: Duration) -> QueueConfig {
        QueueConfig {
            min_interval,
            call_timeout: Duration::from_secs(5),
            capacity: 64,
        }
    }

    async fn wait_for_submitted(queue: &RequestQueue, submitted: u64) {
        while queue.stats().submitted < submitted {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_enqueue_before_start() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        let res = queue.enqueue(|| async { Ok(1) }, Duration::from_secs(1)).await;
        assert!(matches!(res, Err(QueueError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        queue.start().unwrap();
        queue.start().unwrap();

        let res = queue.enqueue(|| async { Ok("ok") }, Duration::from_secs(1)).await;
        assert_eq!("ok", res.unwrap());
    }

    #[test]
    fn test_start_outside_runtime() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        assert!(matches!(queue.start(), Err(QueueError::NoRuntime)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fifo_order_and_no_overlap() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        queue.start().unwrap();

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let executed = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(Mutex::new(0usize));

        // Block the consumer so that everything after this is queued behind it
        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        move || async move {
                            let _ = gate_rx.await;
                            Ok(())
                        },
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        // Wait until the blocker has been taken off the queue and is executing
        while queue.stats().submitted < 1 || queue.stats().depth > 0 {
            tokio::task::yield_now().await;
        }

        let mut handles = Vec::new();
        for i in 0..10usize {
            let submitter = queue.clone();
            let executed = executed.clone();
            let active = active.clone();

            handles.push(tokio::spawn(async move {
                submitter
                    .enqueue(
                        move || async move {
                            {
                                let mut a = active.lock().unwrap();
                                assert_eq!(0, *a, "two requests executing at once");
                                *a += 1;
                            }
                            executed.lock().unwrap().push(i);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            *active.lock().unwrap() -= 1;
                            Ok(i)
                        },
                        Duration::from_secs(5),
                    )
                    .await
            }));

            wait_for_submitted(&queue, i as u64 + 2).await;
        }

        gate_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(i, h.await.unwrap().unwrap());
        }

        assert_eq!((0..10).collect::<Vec<_>>(), *executed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_executions_respect_min_interval() {
        let interval = Duration::from_millis(40);
        let queue = RequestQueue::new(config(interval));
        queue.start().unwrap();

        let starts = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let queue = queue.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(
                        move || async move {
                            starts.lock().unwrap().push(Instant::now());
                            Ok(())
                        },
                        Duration::from_secs(5),
                    )
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        let starts = starts.lock().unwrap();
        assert_eq!(5, starts.len());
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= interval, "gap {:?} below interval", pair[1] - pair[0]);
        }
    }

    #[tokio::test]
    async fn test_error_goes_only_to_its_caller() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        queue.start().unwrap();

        let failing = queue.enqueue(
            || async { Err::<u32, _>(ClientError::RateLimited) },
            Duration::from_secs(1),
        );
        let ok = queue.enqueue(|| async { Ok(7u32) }, Duration::from_secs(1));
        let (failing, ok) = tokio::join!(failing, ok);

        assert!(matches!(failing, Err(QueueError::Upstream(ClientError::RateLimited))));
        assert_eq!(7, ok.unwrap());

        let stats = queue.stats();
        assert_eq!(2, stats.submitted);
        assert_eq!(1, stats.completed);
        assert_eq!(1, stats.failed);
        assert_eq!(0, stats.depth);
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_loop_continues() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        queue.start().unwrap();

        let res = queue
            .enqueue(
                || async {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(res, Err(QueueError::Panicked)));

        let res = queue.enqueue(|| async { Ok(2) }, Duration::from_secs(1)).await;
        assert_eq!(2, res.unwrap());
    }

    #[tokio::test]
    async fn test_slow_call_hits_call_timeout() {
        let queue = RequestQueue::new(QueueConfig {
            min_interval: Duration::from_millis(1),
            call_timeout: Duration::from_millis(20),
            capacity: 8,
        });
        queue.start().unwrap();

        let res = queue
            .enqueue(
                || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(res, Err(QueueError::Timeout)));

        let res = queue.enqueue(|| async { Ok(3) }, Duration::from_secs(1)).await;
        assert_eq!(3, res.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work() {
        let queue = RequestQueue::new(config(Duration::from_millis(5)));
        queue.start().unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.enqueue(move || async move { Ok(i) }, Duration::from_secs(5)).await
            }));
        }

        wait_for_submitted(&queue, 3).await;
        queue.shutdown(Duration::from_secs(5)).await;

        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(i, h.await.unwrap().unwrap());
        }

        let res = queue.enqueue(|| async { Ok(()) }, Duration::from_secs(1)).await;
        assert!(matches!(res, Err(QueueError::NotRunning)));
        assert!(matches!(queue.start(), Err(QueueError::NotRunning)));

        // Second shutdown is a no-op
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_work_past_drain_timeout() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        queue.start().unwrap();

        let slow = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        || async {
                            tokio::time::sleep(Duration::from_secs(3)).await;
                            Ok(())
                        },
                        Duration::from_secs(10),
                    )
                    .await
            })
        };

        wait_for_submitted(&queue, 1).await;
        let queued = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(|| async { Ok(()) }, Duration::from_secs(10)).await })
        };

        wait_for_submitted(&queue, 2).await;

        queue.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(slow.await.unwrap(), Err(QueueError::Cancelled)));
        assert!(matches!(queued.await.unwrap(), Err(QueueError::Cancelled)));
    }

    #[tokio::test]
    async fn test_abandoned_request_is_skipped() {
        let queue = RequestQueue::new(config(Duration::from_millis(1)));
        queue.start().unwrap();

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(
                        move || async move {
                            let _ = gate_rx.await;
                            Ok(())
                        },
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        wait_for_submitted(&queue, 1).await;

        let ran = Arc::new(Mutex::new(false));
        let res = {
            let ran = ran.clone();
            queue
                .enqueue(
                    move || async move {
                        *ran.lock().unwrap() = true;
                        Ok(())
                    },
                    Duration::from_millis(20),
                )
                .await
        };
        assert!(matches!(res, Err(QueueError::Timeout)));

        gate_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();

        // Anything submitted after the abandoned request runs only once it has been skipped
        queue.enqueue(|| async { Ok(()) }, Duration::from_secs(1)).await.unwrap();
        assert!(!*ran.lock().unwrap());
        assert_eq!(1, queue.stats().abandoned);
    }
}
