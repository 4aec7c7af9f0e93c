//! Scheduler for the supervisor work loops.
//!
//! Each registered [`Doer`] gets its own task multiplexing a periodic
//! tick and an explicit poke; a supervisor therefore never runs two
//! cycles concurrently. API mutations poke the scheduler to expedite
//! the next cycle. On shutdown, in-flight cycles complete before the
//! tasks exit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A background component the scheduler drives.
#[async_trait]
pub trait Doer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Performs one work cycle. Implementations log their own failures;
    /// a failed cycle is retried on the next tick.
    async fn do_work(&self);
}

/// Drives registered doers periodically and on demand.
pub struct Scheduler {
    notifiers: Vec<Arc<Notify>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns one work loop per doer. A zero `period` disables the
    /// periodic tick; doers then run only when poked.
    #[must_use]
    pub fn new(doers: Vec<Arc<dyn Doer>>, period: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        let mut notifiers = Vec::with_capacity(doers.len());
        let mut handles = Vec::with_capacity(doers.len());
        for doer in doers {
            let notify = Arc::new(Notify::new());
            notifiers.push(Arc::clone(&notify));
            handles.push(spawn_doer(doer, notify, shutdown_tx.subscribe(), period));
        }

        Self {
            notifiers,
            shutdown_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Expedites the next cycle of every doer. Non-blocking; a poke
    /// received while a cycle is running schedules one more cycle.
    pub fn poke(&self) {
        for notify in &self.notifiers {
            notify.notify_one();
        }
    }

    /// Signals all work loops to stop and waits for in-flight cycles to
    /// complete.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

fn spawn_doer(
    doer: Arc<dyn Doer>,
    notify: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = if period.is_zero() {
            debug!(task = doer.name(), "periodic tick disabled");
            None
        } else {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        };

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = notify.notified() => {
                    doer.do_work().await;
                }
                _ = tick(&mut interval) => {
                    doer.do_work().await;
                }
            }
        }

        debug!(task = doer.name(), "supervisor loop stopped");
    })
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDoer {
        cycles: AtomicUsize,
    }

    #[async_trait]
    impl Doer for CountingDoer {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn do_work(&self) {
            self.cycles.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn poke_runs_a_cycle_when_tick_is_disabled() {
        let doer = Arc::new(CountingDoer {
            cycles: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(vec![doer.clone()], Duration::ZERO);

        scheduler.poke();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(doer.cycles.load(Ordering::SeqCst) >= 1);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_tick_runs_cycles() {
        let doer = Arc::new(CountingDoer {
            cycles: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(vec![doer.clone()], Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(doer.cycles.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loops() {
        let doer = Arc::new(CountingDoer {
            cycles: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(vec![doer.clone()], Duration::from_millis(5));
        scheduler.shutdown().await;

        let after_shutdown = doer.cycles.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(doer.cycles.load(Ordering::SeqCst), after_shutdown);
    }
}
