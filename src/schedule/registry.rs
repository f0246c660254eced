// dbbackup/src/schedule/registry.rs
use chrono::{DateTime, FixedOffset, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BackupSchedule, LastRunStatus, ScheduleRequest, ScheduleRule, compute_next_run};
use crate::backup::{BackupRunner, RunReport, RunRequest};
use crate::errors::{BackupError, Result};
use crate::store::{BackupStore, ScheduleRunUpdate};

// Timers re-check the wall clock at least this often.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(60);

struct TimerEntry {
    config: BackupSchedule,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Removes the owner from the running set when dropped.
struct RunGuard {
    running: Arc<DashSet<String>>,
    owner: String,
}

impl RunGuard {
    fn acquire(running: &Arc<DashSet<String>>, owner: &str) -> Option<Self> {
        running.insert(owner.to_string()).then(|| RunGuard {
            running: running.clone(),
            owner: owner.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.owner);
    }
}

/// Owns one timer per enabled schedule and the per-owner reentrancy guard.
/// Built once at startup and shared behind an `Arc`.
pub struct SchedulerRegistry {
    store: Arc<dyn BackupStore>,
    runner: Arc<BackupRunner>,
    offset: FixedOffset,
    timers: DashMap<String, TimerEntry>,
    running: Arc<DashSet<String>>,
    // Serializes schedule edits with the end-of-run bookkeeping write.
    bookkeeping: Mutex<()>,
    shutdown: CancellationToken,
}

impl SchedulerRegistry {
    pub fn new(store: Arc<dyn BackupStore>, runner: Arc<BackupRunner>, offset: FixedOffset) -> Arc<Self> {
        Arc::new(SchedulerRegistry {
            store,
            runner,
            offset,
            timers: DashMap::new(),
            running: Arc::new(DashSet::new()),
            bookkeeping: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Brings the timer set in line with the enabled schedules in the store.
    /// Unchanged schedules keep their timer; runs missed while no timer
    /// existed are not replayed.
    pub async fn reload(self: &Arc<Self>) -> Result<usize> {
        let wanted: HashMap<String, BackupSchedule> = self
            .store
            .list_enabled_schedules()
            .await?
            .into_iter()
            .map(|s| (s.owner.clone(), s))
            .collect();

        self.timers.retain(|owner, entry| {
            let keep = wanted
                .get(owner)
                .is_some_and(|s| !entry.config.timer_config_differs(s));
            if !keep {
                debug!(owner = %owner, rule = ?entry.config.rule, "Cancelling schedule timer");
            }
            keep
        });

        let now = Utc::now();
        for (owner, schedule) in wanted {
            let next_run_at = compute_next_run(&schedule.rule, now, self.offset);
            let created = match self.timers.entry(owner.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(self.spawn_timer(schedule, next_run_at));
                    true
                }
            };
            if created {
                info!(owner = %owner, next_run_at = %next_run_at, "Scheduled backups");
                if let Err(e) = self.store.set_next_run(&owner, next_run_at).await {
                    warn!(owner = %owner, error = %e, "Failed to persist next run time");
                }
            }
        }
        Ok(self.timers.len())
    }

    /// Validates and persists a schedule, then refreshes the timers.
    pub async fn upsert_schedule(self: &Arc<Self>, request: &ScheduleRequest) -> Result<BackupSchedule> {
        let mut schedule = request.validate()?;
        let _bookkeeping = self.bookkeeping.lock().await;
        schedule.next_run_at = schedule
            .enabled
            .then(|| compute_next_run(&schedule.rule, Utc::now(), self.offset));
        self.store.upsert_schedule(&schedule).await?;
        self.reload().await?;
        Ok(self
            .store
            .get_schedule(&schedule.owner)
            .await?
            .unwrap_or(schedule))
    }

    pub async fn delete_schedule(&self, owner: &str) -> Result<bool> {
        let _bookkeeping = self.bookkeeping.lock().await;
        let deleted = self.store.delete_schedule(owner).await?;
        self.timers.remove(owner);
        if deleted {
            info!(owner = %owner, "Deleted backup schedule");
        }
        Ok(deleted)
    }

    /// Starts a scheduled run on its own task. Returns `None` when a run for
    /// the owner is still in progress; that trigger is skipped.
    pub fn on_due(self: &Arc<Self>, owner: &str) -> Option<JoinHandle<()>> {
        let Some(guard) = RunGuard::acquire(&self.running, owner) else {
            warn!(owner = %owner, "Previous backup run still in progress, skipping this trigger");
            return None;
        };
        let registry = self.clone();
        Some(tokio::spawn(async move {
            registry.run_scheduled(guard).await;
        }))
    }

    async fn run_scheduled(&self, guard: RunGuard) {
        let owner = guard.owner.as_str();
        let schedule = match self.store.get_schedule(owner).await {
            Ok(Some(schedule)) if schedule.enabled => schedule,
            Ok(_) => {
                info!(owner = %owner, "Schedule removed or disabled before it ran");
                return;
            }
            Err(e) => {
                error!(owner = %owner, error = %e, "Failed to load schedule for due run");
                return;
            }
        };

        let recorder = self.runner.recorder();
        recorder.mark_schedule_running(owner).await;
        let report = self
            .runner
            .run(RunRequest::scheduled(owner, schedule.remote_folder_ref.clone()))
            .await;

        let (status, error) = match &report.outcome {
            Ok(descriptor) => {
                if let (None, Some(folder_ref)) =
                    (&schedule.remote_folder_ref, &descriptor.remote_folder_ref)
                {
                    recorder.remember_folder(owner, folder_ref).await;
                }
                (LastRunStatus::Success, None)
            }
            Err(e) => (LastRunStatus::Failed, Some(e.to_string())),
        };

        // The schedule may have been edited while the run was in flight;
        // the next run follows whatever rule is stored now.
        let _bookkeeping = self.bookkeeping.lock().await;
        let current = match self.store.get_schedule(owner).await {
            Ok(current) => current,
            Err(e) => {
                warn!(owner = %owner, error = %e, "Failed to reload schedule after run");
                Some(schedule)
            }
        };
        let finished_at = Utc::now();
        let next_run_at = current
            .filter(|s| s.enabled)
            .map(|s| compute_next_run(&s.rule, finished_at, self.offset));
        recorder
            .finish_schedule_run(
                owner,
                &ScheduleRunUpdate {
                    finished_at,
                    status,
                    error,
                    next_run_at,
                },
            )
            .await;
        debug!(owner = %owner, next_run_at = ?next_run_at, "Scheduled run complete");
    }

    /// On-demand run. Owned runs share the reentrancy guard with the timers.
    pub async fn run_manual(&self, owner: Option<String>) -> Result<RunReport> {
        let guard = match owner.as_deref() {
            Some(owner) => Some(
                RunGuard::acquire(&self.running, owner)
                    .ok_or_else(|| BackupError::RunInProgress(owner.to_string()))?,
            ),
            None => None,
        };
        let folder_ref = match owner.as_deref() {
            Some(owner) => self
                .store
                .get_schedule(owner)
                .await?
                .and_then(|s| s.remote_folder_ref),
            None => None,
        };

        let runner = self.runner.clone();
        let request = RunRequest {
            folder_ref,
            ..RunRequest::manual(owner)
        };
        // Detached so a dropped caller cannot abort a run halfway.
        let worker = tokio::spawn(async move {
            let report = runner.run(request).await;
            drop(guard);
            report
        });
        worker
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))
    }

    fn spawn_timer(self: &Arc<Self>, config: BackupSchedule, first_due: DateTime<Utc>) -> TimerEntry {
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(timer_loop(
            Arc::downgrade(self),
            config.owner.clone(),
            config.rule,
            self.offset,
            first_due,
            cancel.clone(),
        ));
        TimerEntry {
            config,
            cancel,
            _task: task,
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn has_timer(&self, owner: &str) -> bool {
        self.timers.contains_key(owner)
    }

    pub fn is_running(&self, owner: &str) -> bool {
        self.running.contains(owner)
    }

    /// Cancels every timer. Runs already started finish on their own.
    pub fn shutdown(&self) {
        let timers = self.active_timers();
        self.shutdown.cancel();
        self.timers.clear();
        info!(timers, "Scheduler stopped");
    }
}

async fn timer_loop(
    registry: Weak<SchedulerRegistry>,
    owner: String,
    rule: ScheduleRule,
    offset: FixedOffset,
    first_due: DateTime<Utc>,
    cancel: CancellationToken,
) {
    let mut due = first_due;
    loop {
        loop {
            let remaining = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(remaining.min(MAX_TIMER_SLEEP)) => {}
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        let Some(registry) = registry.upgrade() else {
            return;
        };
        info!(owner = %owner, "Backup schedule due");
        // The worker reports through the store; the timer only needs to fire.
        let _ = registry.on_due(&owner);
        drop(registry);
        due = compute_next_run(&rule, Utc::now(), offset);
    }
}
