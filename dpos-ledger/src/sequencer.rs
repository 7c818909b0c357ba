//! Strict FIFO task sequencer
//!
//! Ledger-mutating work is funneled through a [`Sequencer`] so that tasks
//! submitted by concurrent callers run one at a time, in submission order:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │            Sequencer (Clone): enqueue()              │
//! │       never blocks, pushes onto an unbounded FIFO    │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::unbounded_channel
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              SequencerWorker (single task)           │
//! │   tick: warn if depth >= limit → run one task to     │
//! │   completion → on_complete(result) → sleep(delay)    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The pause after every task keeps a burst of queued work from monopolizing
//! the runtime. The depth warning is advisory only: the queue stays
//! unbounded and keeps accepting work.
//!
//! Separate instances partition independent mutation domains; there is no
//! ordering between instances. A dequeued task is never cancelled.
//!
//! Each task runs on its own tokio task and the worker awaits it, so a
//! panicking task fails only its own caller (with [`Error::Concurrency`])
//! and the queue keeps draining.

use crate::config::SequencerConfig;
use crate::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback fired with `(depth, limit)` when the queue is over its limit
pub type WarningHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// A queued unit of work: runs the task and delivers its result
struct Job {
    run: Box<dyn FnOnce() -> BoxFuture + Send>,
}

enum SequencerMessage {
    Run(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Handle for submitting tasks to a sequencer worker
#[derive(Clone)]
pub struct Sequencer {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<SequencerMessage>,
    depth: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("name", &self.name)
            .field("depth", &self.len())
            .finish()
    }
}

impl Sequencer {
    /// Spawn a sequencer that logs a warning when over its limit
    pub fn spawn(name: &str, config: &SequencerConfig) -> (Self, JoinHandle<()>) {
        let label: Arc<str> = Arc::from(name);
        let hook_label = label.clone();
        let hook: WarningHook = Arc::new(move |depth, limit| {
            tracing::warn!(
                sequencer = %hook_label,
                depth,
                limit,
                "Sequencer queue over warning limit"
            );
        });
        Self::spawn_with_hook(name, config, Some(hook))
    }

    /// Spawn a sequencer with a custom (or no) warning hook
    pub fn spawn_with_hook(
        name: &str,
        config: &SequencerConfig,
        on_warning: Option<WarningHook>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let name: Arc<str> = Arc::from(name);

        let worker = SequencerWorker {
            name: name.clone(),
            mailbox: rx,
            depth: depth.clone(),
            tick_delay: Duration::from_millis(config.tick_delay_ms),
            warning_limit: config.warning_limit,
            on_warning,
        };

        let handle = tokio::spawn(worker.run());

        (
            Self {
                name,
                sender: tx,
                depth,
            },
            handle,
        )
    }

    /// Sequencer name (for logs)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks waiting to run
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Whether no task is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a task to the queue and return immediately
    ///
    /// `on_complete` receives the task's result once it has run. Fails only
    /// if the worker has shut down.
    pub fn enqueue<F, Fut, T, C>(&self, task: F, on_complete: Option<C>) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        let job = Job {
            run: Box::new(move || -> BoxFuture {
                Box::pin(async move {
                    let result = task().await;
                    if let Some(done) = on_complete {
                        done(result);
                    }
                })
            }),
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        self.sender.send(SequencerMessage::Run(job)).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            Error::Concurrency(format!("Sequencer {} closed", self.name))
        })
    }

    /// Enqueue a task and wait for its result
    pub async fn run<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            task,
            Some(move |result: Result<T>| {
                let _ = tx.send(result);
            }),
        )?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Stop the worker after every task queued so far has run
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SequencerMessage::Shutdown(tx))
            .map_err(|_| Error::Concurrency(format!("Sequencer {} closed", self.name)))?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Worker that drains the queue one task per tick
struct SequencerWorker {
    name: Arc<str>,
    mailbox: mpsc::UnboundedReceiver<SequencerMessage>,
    depth: Arc<AtomicUsize>,
    tick_delay: Duration,
    warning_limit: usize,
    on_warning: Option<WarningHook>,
}

impl SequencerWorker {
    async fn run(mut self) {
        tracing::debug!(sequencer = %self.name, "Sequencer started");

        loop {
            let message = match self.mailbox.recv().await {
                Some(message) => message,
                None => break,
            };

            let depth = self.depth.load(Ordering::SeqCst);
            if depth >= self.warning_limit {
                if let Some(hook) = &self.on_warning {
                    hook(depth, self.warning_limit);
                }
            }

            match message {
                SequencerMessage::Run(job) => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = tokio::spawn((job.run)()).await {
                        tracing::error!(sequencer = %self.name, error = %e, "Sequencer task failed");
                    }
                }
                SequencerMessage::Shutdown(response) => {
                    let _ = response.send(());
                    break;
                }
            }

            tokio::time::sleep(self.tick_delay).await;
        }

        tracing::debug!(sequencer = %self.name, "Sequencer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn fast_config() -> SequencerConfig {
        SequencerConfig {
            tick_delay_ms: 1,
            warning_limit: 50,
        }
    }

    #[tokio::test]
    async fn test_completions_fire_in_submission_order() {
        let (sequencer, _worker) = Sequencer::spawn("test", &fast_config());
        let completed = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);

        for i in 0..5u64 {
            let completed = completed.clone();
            let last = if i == 4 { done_tx.take() } else { None };
            sequencer
                .enqueue(
                    move || async move {
                        // earlier tasks take longer
                        tokio::time::sleep(Duration::from_millis(20 - i * 4)).await;
                        Ok(i)
                    },
                    Some(move |result: Result<u64>| {
                        completed.lock().push(result.unwrap());
                        if let Some(tx) = last {
                            let _ = tx.send(());
                        }
                    }),
                )
                .unwrap();
        }

        done_rx.await.unwrap();
        assert_eq!(*completed.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_tasks_never_overlap() {
        let (sequencer, _worker) = Sequencer::spawn("overlap", &fast_config());
        let running = Arc::new(AtomicUsize::new(0));
        let mut results = Vec::new();

        for _ in 0..4 {
            let running = running.clone();
            let seq = sequencer.clone();
            results.push(tokio::spawn(async move {
                seq.run(move || async move {
                    let before = running.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(before)
                })
                .await
            }));
        }

        for handle in results {
            assert_eq!(handle.await.unwrap().unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_run_propagates_task_error() {
        let (sequencer, _worker) = Sequencer::spawn("errors", &fast_config());
        let result: Result<()> = sequencer
            .run(|| async { Err(Error::Ledger("write failed".to_string())) })
            .await;
        assert!(matches!(result, Err(Error::Ledger(_))));
    }

    #[tokio::test]
    async fn test_warning_is_advisory() {
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let hook_warnings = warnings.clone();
        let hook: WarningHook = Arc::new(move |depth, limit| {
            hook_warnings.lock().push((depth, limit));
        });
        let config = SequencerConfig {
            tick_delay_ms: 1,
            warning_limit: 3,
        };
        let (sequencer, _worker) = Sequencer::spawn_with_hook("warn", &config, Some(hook));

        let mut pending = Vec::new();
        for i in 0..6u32 {
            let (tx, rx) = oneshot::channel();
            sequencer
                .enqueue(
                    move || async move { Ok(i) },
                    Some(move |result: Result<u32>| {
                        let _ = tx.send(result);
                    }),
                )
                .unwrap();
            pending.push(rx);
        }
        assert!(sequencer.len() <= 6);

        for (i, rx) in pending.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap().unwrap(), i as u32);
        }

        let warnings = warnings.lock();
        assert!(!warnings.is_empty());
        assert!(warnings.iter().all(|&(depth, limit)| depth >= limit && limit == 3));
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_the_worker() {
        let (sequencer, _worker) = Sequencer::spawn("panics", &fast_config());

        let failed: Result<usize> = sequencer
            .run(|| async {
                let empty: Vec<usize> = Vec::new();
                Ok(empty[1])
            })
            .await;
        assert!(matches!(failed, Err(Error::Concurrency(_))));

        let healthy = sequencer.run(|| async { Ok(7u32) }).await;
        assert_eq!(healthy.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_tasks() {
        let (sequencer, worker) = Sequencer::spawn("drain", &fast_config());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            sequencer
                .enqueue(
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None::<fn(Result<()>)>,
                )
                .unwrap();
        }

        sequencer.shutdown().await.unwrap();
        worker.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(sequencer.enqueue(|| async { Ok(()) }, None::<fn(Result<()>)>).is_err());
    }
}
