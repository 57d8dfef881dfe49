//! The shared lock heartbeat.
//!
//! One task per session refreshes every held lock with a single read of the
//! canvas locks and a single batched write, regardless of how many locks are
//! held. Locks that were lost in the meantime are dropped from the held set
//! and their disconnect cleanup is withdrawn.

use crate::lock::{LockManager, LockRecord};
use crate::store::{PathWrite, StoreResult, paths};
use std::sync::PoisonError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Outcome of one heartbeat tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub refreshed: usize,
    pub lost: usize,
}

pub struct Heartbeat {
    locks: LockManager,
    interval: Duration,
    sweep_interval: Option<Duration>,
}

impl Heartbeat {
    pub fn new(locks: LockManager, interval: Duration, sweep_interval: Option<Duration>) -> Self {
        Self {
            locks,
            interval,
            sweep_interval,
        }
    }

    /// Refresh every held lock once.
    pub async fn tick(&self) -> StoreResult<TickReport> {
        let held: Vec<_> = {
            let held = self.locks.held_locks().lock().unwrap_or_else(PoisonError::into_inner);
            held.iter().map(|(id, lease)| (*id, lease.clone())).collect()
        };
        if held.is_empty() {
            return Ok(TickReport::default());
        }

        let current = self.locks.fetch_all().await?;
        let now = self.locks.store().server_time();
        let canvas_id = self.locks.canvas_id();

        let mut writes = Vec::with_capacity(held.len());
        let mut lost = Vec::new();
        for (id, lease) in held {
            match current.get(&id) {
                Some(record) if record.locked_by == lease.user_id => {
                    let refreshed = LockRecord::new(lease.user_id, now);
                    writes.push(PathWrite::set(
                        paths::lock(canvas_id, id),
                        serde_json::to_value(&refreshed)?,
                    ));
                }
                Some(record) => {
                    log::warn!("Lock on {} was taken over by {}", id, record.locked_by);
                    lost.push((id, lease.epoch));
                }
                None => {
                    log::warn!("Lock on {} disappeared", id);
                    lost.push((id, lease.epoch));
                }
            }
        }

        if !lost.is_empty() {
            {
                let mut held = self.locks.held_locks().lock().unwrap_or_else(PoisonError::into_inner);
                for (id, epoch) in &lost {
                    // Re-acquired while the locks were being read
                    if held.get(id).is_some_and(|lease| lease.epoch == *epoch) {
                        held.remove(id);
                    }
                }
            }
            let lost_paths = lost.iter().map(|(id, _)| paths::lock(canvas_id, *id)).collect();
            if let Err(e) = self.locks.store().cancel_on_disconnect(lost_paths).await {
                log::warn!("Failed to withdraw cleanup for lost locks: {}", e);
            }
        }

        let refreshed = writes.len();
        if refreshed > 0 {
            self.locks.store().update(writes).await?;
        }
        log::trace!("Heartbeat refreshed {} locks, lost {}", refreshed, lost.len());
        Ok(TickReport {
            refreshed,
            lost: lost.len(),
        })
    }

    /// Run the heartbeat (and the stale-lock sweep, if configured) until the
    /// returned handle is stopped or dropped.
    pub fn spawn(self) -> HeartbeatHandle {
        let task = tokio::spawn(async move {
            let mut beat = interval_after(self.interval);
            let mut sweep = self.sweep_interval.map(interval_after);
            loop {
                tokio::select! {
                    _ = beat.tick() => {
                        if let Err(e) = self.tick().await {
                            log::warn!("Heartbeat failed, retrying next tick: {}", e);
                        }
                    }
                    _ = next_sweep(&mut sweep) => {
                        if let Err(e) = self.locks.sweep_expired().await {
                            log::warn!("Stale lock sweep failed: {}", e);
                        }
                    }
                }
            }
        });
        HeartbeatHandle { task: Some(task) }
    }
}

/// An interval whose first tick is one period from now.
fn interval_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_sweep(sweep: &mut Option<Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Stops the heartbeat task when stopped or dropped.
pub struct HeartbeatHandle {
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
