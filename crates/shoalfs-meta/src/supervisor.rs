//! Background task supervision.
//!
//! A panic in a partition's background task (reclaimer, sweeper) must
//! never take the process down or silently stop the work. The supervisor
//! runs the task body in a child task, logs a critical alarm if it
//! panics, and restarts it after a short delay; the partition's stop
//! signal ends the loop.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Delay before restarting a panicked task.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Restart counter shared with tests and health reporting.
#[derive(Clone, Default)]
pub struct RestartCounter(Arc<AtomicU64>);

impl RestartCounter {
    /// Number of restarts so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs `factory`'s future until it completes cleanly or the stop signal
/// fires, restarting it after a panic.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    mut stop: watch::Receiver<bool>,
    mut factory: F,
) -> (JoinHandle<()>, RestartCounter)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let restarts = RestartCounter::default();
    let counter = restarts.clone();
    let handle = tokio::spawn(async move {
        'outer: loop {
            if *stop.borrow() {
                break;
            }
            let mut task = tokio::spawn(factory());
            let restart = loop {
                tokio::select! {
                    res = &mut task => {
                        match res {
                            Ok(()) => break false,
                            Err(e) if e.is_panic() => {
                                tracing::error!(
                                    task = name,
                                    "background task panicked; restarting"
                                );
                                counter.bump();
                                break true;
                            }
                            Err(_) => break false,
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            task.abort();
                            break false;
                        }
                        // Spurious wake; keep waiting on the same task.
                    }
                }
            };
            if !restart {
                break 'outer;
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }
        tracing::debug!(task = name, "supervisor exited");
    });
    (handle, restarts)
}
