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

use crate::queue::{CallResult, QueueError, Reply, Request, RequestQueue};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::WeakSender;

/// Submits work to a running [`RequestQueue`] from plain OS threads.
///
/// The bridge holds on to the channel of the consumer that was running when
/// [`ThreadBridge::start`] was called and every submission goes to that consumer.
/// Callers block on a std channel for the result so no async runtime is needed
/// on the calling thread.
///
/// `enqueue_blocking` must not be called from inside an async task: it parks the
/// calling thread until the result arrives or the timeout passes.
#[derive(Clone)]
pub struct ThreadBridge {
    queue: RequestQueue,
    consumer: WeakSender<Request>,
}

impl ThreadBridge {
    /// Attach to the queue's running consumer. Fails with `NotRunning` when the
    /// queue hasn't been started (or has been shut down).
    pub fn start(queue: &RequestQueue) -> Result<Self, QueueError> {
        let consumer = queue.downgrade()?;
        Ok(ThreadBridge {
            queue: queue.clone(),
            consumer,
        })
    }

    /// Submit a callable and block the current thread until it resolves.
    ///
    /// Returns `Timeout` when no result arrives within `timeout`. The request is
    /// then marked abandoned: the consumer skips it if it hasn't run yet and any
    /// late result is dropped.
    pub fn enqueue_blocking<F, Fut, T>(&self, callable: F, timeout: Duration) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.consumer.upgrade().ok_or(QueueError::NotRunning)?;
        let (tx, rx) = mpsc::sync_channel(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let request = Request::new(
            callable,
            Reply::Blocking {
                tx,
                abandoned: abandoned.clone(),
            },
        );

        let submitted = self.queue.try_submit(&sender, request);
        drop(sender);
        submitted?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::Release);
                tracing::warn!(
                    message = "blocking request timed out",
                    timeout_ms = timeout.as_millis() as u64,
                );
                Err(QueueError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Cancelled),
        }
    }
}

impl fmt::Debug for ThreadBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBridge")
            .field("running", &self.queue.is_running())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::ThreadBridge;
    use crate::queue::{QueueConfig, QueueError, RequestQueue};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::oneshot;

    fn queue(min_interval: Duration) -> RequestQueue {
        RequestQueue::new(QueueConfig {
            min_interval,
            call_timeout: Duration::from_secs(5),
            capacity: 128,
        })
    }

    #[test]
    fn test_start_requires_running_queue() {
        let queue = queue(Duration::from_millis(1));
        assert!(matches!(ThreadBridge::start(&queue), Err(QueueError::NotRunning)));
    }

    // A current_thread runtime is the case that deadlocks when a second consumer is
    // created for blocking callers: nothing would ever drive it.
    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_submit_on_single_threaded_runtime() {
        let queue = queue(Duration::from_millis(1));
        queue.start().unwrap();
        let bridge = ThreadBridge::start(&queue).unwrap();

        let res = tokio::task::spawn_blocking(move || {
            bridge.enqueue_blocking(|| async { Ok(21 * 2) }, Duration::from_secs(5))
        })
        .await
        .unwrap();

        assert_eq!(42, res.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_submit_under_loop_traffic() {
        let queue = queue(Duration::from_millis(1));
        queue.start().unwrap();
        let bridge = ThreadBridge::start(&queue).unwrap();

        let mut loop_callers = Vec::new();
        for i in 0..50u32 {
            let queue = queue.clone();
            loop_callers.push(tokio::spawn(async move {
                queue.enqueue(move || async move { Ok(i) }, Duration::from_secs(10)).await
            }));
        }

        let results = Arc::new(Mutex::new(Vec::new()));
        let threads: Vec<_> = (0..4u32)
            .map(|t| {
                let bridge = bridge.clone();
                let results = results.clone();
                thread::spawn(move || {
                    for j in 0..5u32 {
                        let res = bridge
                            .enqueue_blocking(move || async move { Ok(t * 100 + j) }, Duration::from_secs(10));
                        results.lock().unwrap().push(res.unwrap());
                    }
                })
            })
            .collect();

        for h in loop_callers {
            h.await.unwrap().unwrap();
        }

        let joined = tokio::task::spawn_blocking(move || {
            for t in threads {
                t.join().unwrap();
            }
        });
        joined.await.unwrap();

        assert_eq!(20, results.lock().unwrap().len());
        assert_eq!(70, queue.stats().completed);
    }

    async fn wait_for_submitted(queue: &RequestQueue, submitted: u64) {
        while queue.stats().submitted < submitted {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mixed_submitters_run_in_arrival_order_and_spaced() {
        let interval = Duration::from_millis(20);
        let queue = queue(interval);
        queue.start().unwrap();
        let bridge = ThreadBridge::start(&queue).unwrap();

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let blocker = {
            let submitter = queue.clone();
            tokio::spawn(async move {
                submitter
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

        let executed = Arc::new(Mutex::new(Vec::new()));
        let mut loop_callers = Vec::new();
        let mut threads = Vec::new();

        // Alternate loop and thread submissions, each accepted before the next is made
        for i in 0..8u32 {
            let executed = executed.clone();
            let callable = move || async move {
                executed.lock().unwrap().push((i, Instant::now()));
                Ok(i)
            };

            if i % 2 == 0 {
                let submitter = queue.clone();
                loop_callers.push(tokio::spawn(async move {
                    submitter.enqueue(callable, Duration::from_secs(10)).await
                }));
            } else {
                let bridge = bridge.clone();
                threads.push(thread::spawn(move || {
                    bridge.enqueue_blocking(callable, Duration::from_secs(10))
                }));
            }

            wait_for_submitted(&queue, i as u64 + 2).await;
        }

        gate_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for h in loop_callers {
            h.await.unwrap().unwrap();
        }

        let joined = tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .map(|t| t.join().unwrap().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(vec![1, 3, 5, 7], joined.await.unwrap());

        let executed = executed.lock().unwrap();
        let order: Vec<u32> = executed.iter().map(|(i, _)| *i).collect();
        assert_eq!((0..8).collect::<Vec<_>>(), order);
        for pair in executed.windows(2) {
            let gap = pair[1].1 - pair[0].1;
            assert!(gap >= interval, "gap {:?} below interval", gap);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_is_discarded_and_bridge_keeps_working() {
        let queue = queue(Duration::from_millis(1));
        queue.start().unwrap();
        let bridge = ThreadBridge::start(&queue).unwrap();

        let res = tokio::task::spawn_blocking(move || {
            let slow = bridge.enqueue_blocking(
                || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(1)
                },
                Duration::from_millis(20),
            );
            let next = bridge.enqueue_blocking(|| async { Ok(2) }, Duration::from_secs(5));
            (slow, next)
        })
        .await
        .unwrap();

        assert!(matches!(res.0, Err(QueueError::Timeout)));
        assert_eq!(2, res.1.unwrap());
    }

    #[tokio::test]
    async fn test_not_running_after_shutdown() {
        let queue = queue(Duration::from_millis(1));
        queue.start().unwrap();
        let bridge = ThreadBridge::start(&queue).unwrap();
        queue.shutdown(Duration::from_secs(1)).await;

        let res = tokio::task::spawn_blocking(move || {
            bridge.enqueue_blocking(|| async { Ok(()) }, Duration::from_secs(1))
        })
        .await
        .unwrap();
        assert!(matches!(res, Err(QueueError::NotRunning)));
    }
}
