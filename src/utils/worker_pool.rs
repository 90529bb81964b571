// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::service::Shutdown;
use crate::{AppError, AppResult};

/// Work done by every worker of a [`WorkerPool`].
pub trait PoolHandler<T>: Clone + Send + Sync + 'static {
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// depth of every worker queue
    pub queue_depth: usize,
    pub num_workers: usize,
    /// how often the monitor looks for dead workers
    pub monitor_interval: Duration,
    /// how long the monitor waits on one worker before moving on
    pub worker_check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1,
            num_workers: 10,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

/// A fixed set of workers, each draining its own queue.
///
/// Tasks sent to the same worker run one after another. A worker that panics
/// is replaced by the monitor and the replacement keeps draining the same
/// queue, so nothing queued behind the panicking task is lost.
#[derive(Debug)]
pub struct WorkerPool<T> {
    queues: Vec<async_channel::Sender<T>>,
    config: PoolConfig,
}

/// The monitor's view of one worker.
struct WorkerSlot<T> {
    id: usize,
    queue: async_channel::Receiver<T>,
    /// `None` once the worker has retired
    running: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: PoolConfig,
    ) -> Self {
        let mut queues = Vec::with_capacity(config.num_workers);
        let mut slots = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let (tx, rx) = async_channel::bounded(config.queue_depth);
            let running = spawn_worker(id, rx.clone(), handler.clone(), &notify_shutdown);
            queues.push(tx);
            slots.push(WorkerSlot {
                id,
                queue: rx,
                running: Some(running),
            });
        }
        tokio::spawn(monitor(slots, handler, notify_shutdown, config.clone()));
        debug!("worker pool of {} started", config.num_workers);

        WorkerPool { queues, config }
    }

    /// Queues `task` for worker `worker_id`, waiting while its queue is full.
    pub async fn send(&self, task: T, worker_id: usize) -> AppResult<()> {
        let queue = self.queues.get(worker_id).ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "no worker {} in a pool of {}",
                worker_id,
                self.queues.len()
            ))
        })?;
        queue
            .send(task)
            .await
            .map_err(|_| AppError::ChannelSendError(format!("worker {} queue is closed", worker_id)))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.queues.len()
    }
}

fn spawn_worker<T, H>(
    id: usize,
    queue: async_channel::Receiver<T>,
    handler: H,
    notify_shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()>
where
    T: Send + 'static,
    H: PoolHandler<T>,
{
    let mut shutdown = Shutdown::subscribe(notify_shutdown);
    tokio::spawn(async move {
        trace!("worker {} running", id);
        loop {
            let task = tokio::select! {
                res = queue.recv() => match res {
                    Ok(task) => task,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };
            handler.handle(task).await;
        }
        debug!("worker {} retired", id);
    })
}

/// Respawns panicked workers until shutdown.
async fn monitor<T, H>(
    mut slots: Vec<WorkerSlot<T>>,
    handler: H,
    notify_shutdown: broadcast::Sender<()>,
    config: PoolConfig,
) where
    T: Send + 'static,
    H: PoolHandler<T>,
{
    let mut shutdown = Shutdown::subscribe(&notify_shutdown);
    let mut interval = time::interval(config.monitor_interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }
        for slot in slots.iter_mut() {
            let Some(running) = slot.running.as_mut() else {
                continue;
            };
            // still running if it does not finish within the check timeout
            let Ok(joined) = time::timeout(config.worker_check_timeout, running).await else {
                continue;
            };
            slot.running = None;
            match joined {
                Ok(()) => trace!("worker {} finished", slot.id),
                Err(e) => {
                    report_failure(slot.id, e);
                    slot.running = Some(spawn_worker(
                        slot.id,
                        slot.queue.clone(),
                        handler.clone(),
                        &notify_shutdown,
                    ));
                    warn!("worker {} restarted", slot.id);
                }
            }
        }
    }
    debug!("worker monitor exiting");
}

fn report_failure(worker_id: usize, e: JoinError) {
    if e.is_panic() {
        error!(
            "worker {} panicked: {}",
            worker_id,
            panic_message(e.into_panic().as_ref())
        );
    } else {
        error!("worker {} was cancelled", worker_id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn fast_config(num_workers: usize) -> PoolConfig {
        PoolConfig {
            queue_depth: 1,
            num_workers,
            monitor_interval: Duration::from_millis(50),
            worker_check_timeout: Duration::from_millis(10),
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !check() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Records handled values, panics on negative ones.
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<i32>>>,
    }

    impl PoolHandler<i32> for Recorder {
        fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
            let seen = self.seen.clone();
            async move {
                if task < 0 {
                    panic!("negative task {}", task);
                }
                seen.lock().push(task);
            }
        }
    }

    #[tokio::test]
    async fn test_tasks_on_one_worker_keep_order() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let recorder = Recorder::default();
        let pool = WorkerPool::new(notify_shutdown, recorder.clone(), fast_config(3));
        assert_eq!(pool.num_workers(), 3);

        for task in 0..20 {
            pool.send(task, 1).await.unwrap();
        }
        wait_until(|| recorder.seen.lock().len() == 20).await;
        assert_eq!(*recorder.seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unknown_worker_is_rejected() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let pool = WorkerPool::new(notify_shutdown, Recorder::default(), fast_config(2));
        assert!(matches!(
            pool.send(1, 2).await,
            Err(AppError::IllegalStateError(_))
        ));
    }

    #[tokio::test]
    async fn test_panicked_worker_is_replaced() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let recorder = Recorder::default();
        let pool = WorkerPool::new(notify_shutdown, recorder.clone(), fast_config(1));

        pool.send(-1, 0).await.unwrap();
        // queued behind the panic, handled by the replacement
        pool.send(7, 0).await.unwrap();
        wait_until(|| *recorder.seen.lock() == vec![7]).await;
    }

    #[tokio::test]
    async fn test_workers_retire_on_shutdown() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let handled = Arc::new(AtomicUsize::new(0));

        #[derive(Clone)]
        struct Counter(Arc<AtomicUsize>);

        impl PoolHandler<()> for Counter {
            fn handle(&self, _task: ()) -> impl Future<Output = ()> + Send {
                self.0.fetch_add(1, Ordering::SeqCst);
                async {}
            }
        }

        let pool = WorkerPool::new(notify_shutdown.clone(), Counter(handled.clone()), fast_config(1));
        notify_shutdown.send(()).unwrap();
        time::sleep(Duration::from_millis(100)).await;

        // nobody drains the queue any more: one task fits, the next one waits
        pool.send((), 0).await.unwrap();
        assert!(time::timeout(Duration::from_millis(100), pool.send((), 0))
            .await
            .is_err());
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_message() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(owned.as_ref()), "bang");
        let other: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
