//! Cron scheduling of cleanup and refresh configurations.
//!
//! [`TokioScheduler`] keeps one trigger per job key. Each trigger is a tokio
//! task that sleeps until the next cron occurrence and then calls the
//! registered [`JobHandler`]. [`SchedulerAdapter`] maps stored
//! configurations onto triggers: enabled configs are scheduled, disabled or
//! deleted ones are removed.

pub mod cron;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use self::cron::{next_occurrence, parse_cron, validate_cron};

use crate::core::{CleanupConfig, RefreshConfig, Result, TdmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobGroup {
    Refresh,
    Cleanup,
}

impl fmt::Display for JobGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refresh => write!(f, "refresh"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub group: JobGroup,
    pub config_id: Uuid,
}

impl JobKey {
    pub fn new(group: JobGroup, config_id: Uuid) -> Self {
        Self { group, config_id }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.config_id)
    }
}

/// Called when a trigger fires. Failures are the handler's to log; they
/// never reach the scheduler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run_job(&self, group: JobGroup, config_id: Uuid);
}

pub trait JobScheduler: Send + Sync {
    /// Create the trigger, or replace the existing one for `key`.
    fn schedule_or_update(&self, key: JobKey, cron: &str) -> Result<()>;

    /// Remove the trigger. Returns false when there was none.
    fn unschedule(&self, key: JobKey) -> Result<bool>;

    fn next_fire_time(&self, key: JobKey) -> Option<DateTime<Utc>>;

    /// True when no trigger can fire again.
    fn is_standby(&self) -> bool;
}

struct Trigger {
    cron: Cron,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Trigger {
    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

// A job already running when its trigger goes away runs to completion;
// only future firings are cancelled.
impl Drop for Trigger {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Trigger table driven by tokio timers.
///
/// A paused scheduler records triggers and answers fire-time queries but
/// spawns no tasks.
pub struct TokioScheduler {
    running: bool,
    handler: RwLock<Option<Weak<dyn JobHandler>>>,
    triggers: Mutex<HashMap<JobKey, Trigger>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self {
            running: true,
            handler: RwLock::new(None),
            triggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn paused() -> Self {
        Self {
            running: false,
            ..Self::new()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The handler is held weakly; once it is dropped triggers stop firing.
    pub fn set_handler(&self, handler: Weak<dyn JobHandler>) -> Result<()> {
        *self.handler.write()? = Some(handler);
        Ok(())
    }

    pub fn job_keys(&self) -> Vec<JobKey> {
        self.triggers
            .lock()
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Stop every trigger and wait for running jobs to finish.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<Trigger> = {
            let mut triggers = self.triggers.lock()?;
            triggers.drain().map(|(_, t)| t).collect()
        };

        for mut trigger in drained {
            trigger.stop();
            if let Some(join_handle) = trigger.join_handle.take() {
                join_handle
                    .await
                    .map_err(|err| TdmError::Scheduler(format!("trigger join: {}", err)))?;
            }
        }
        Ok(())
    }

    fn spawn_trigger(
        &self,
        key: JobKey,
        cron: Cron,
        handler: Weak<dyn JobHandler>,
    ) -> Result<(oneshot::Sender<()>, JoinHandle<()>)> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TdmError::Scheduler(format!("no tokio runtime for trigger {}: {}", key, e)))?;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = runtime.spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = next_occurrence(&cron, now) else {
                    debug!(job = %key, "trigger has no further occurrences");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        let Some(handler) = handler.upgrade() else {
                            break;
                        };
                        debug!(job = %key, "trigger fired");
                        handler.run_job(key.group, key.config_id).await;
                    }
                }
            }
        });

        Ok((stop_tx, join_handle))
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler for TokioScheduler {
    fn schedule_or_update(&self, key: JobKey, cron: &str) -> Result<()> {
        let mut trigger = Trigger {
            cron: parse_cron(cron)?,
            stop_tx: None,
            join_handle: None,
        };

        if self.running {
            let handler = self.handler.read()?.clone().ok_or_else(|| {
                TdmError::Scheduler("no job handler registered".into())
            })?;
            let (stop_tx, join_handle) = self.spawn_trigger(key, parse_cron(cron)?, handler)?;
            trigger.stop_tx = Some(stop_tx);
            trigger.join_handle = Some(join_handle);
        }

        // the replaced trigger, if any, stops on drop
        let previous = self.triggers.lock()?.insert(key, trigger);
        info!(job = %key, cron, replaced = previous.is_some(), "job scheduled");
        Ok(())
    }

    fn unschedule(&self, key: JobKey) -> Result<bool> {
        let removed = self.triggers.lock()?.remove(&key);
        if removed.is_some() {
            info!(job = %key, "job unscheduled");
        }
        Ok(removed.is_some())
    }

    fn next_fire_time(&self, key: JobKey) -> Option<DateTime<Utc>> {
        let triggers = self.triggers.lock().ok()?;
        next_occurrence(&triggers.get(&key)?.cron, Utc::now())
    }

    fn is_standby(&self) -> bool {
        let Ok(triggers) = self.triggers.lock() else {
            return true;
        };
        let now = Utc::now();
        triggers
            .values()
            .all(|t| next_occurrence(&t.cron, now).is_none())
    }
}

/// Observable state of one configuration's job. A trigger that can never
/// fire again counts as unscheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleState {
    Unscheduled,
    Scheduled { next_fire_time: DateTime<Utc> },
}

pub struct SchedulerAdapter {
    scheduler: Arc<dyn JobScheduler>,
}

impl SchedulerAdapter {
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }

    /// Schedule an enabled config, remove a disabled one. The cron is
    /// validated in both cases.
    pub fn reschedule(
        &self,
        group: JobGroup,
        config_id: Uuid,
        cron: &str,
        enabled: bool,
    ) -> Result<ScheduleState> {
        validate_cron(cron)?;
        let key = JobKey::new(group, config_id);

        if enabled {
            self.scheduler.schedule_or_update(key, cron)?;
        } else {
            self.scheduler.unschedule(key)?;
        }

        if self.scheduler.is_standby() {
            debug!("no trigger can fire, scheduler in standby");
        }
        Ok(self.state(group, config_id))
    }

    /// Unconditional removal; absent jobs are fine.
    pub fn delete_job(&self, group: JobGroup, config_id: Uuid) -> Result<()> {
        self.scheduler.unschedule(JobKey::new(group, config_id))?;
        Ok(())
    }

    /// Schedule every enabled stored config. Configs whose cron no longer
    /// parses are skipped with a warning. Returns the number scheduled.
    pub fn restore(&self, cleanups: &[CleanupConfig], refreshes: &[RefreshConfig]) -> usize {
        let jobs = cleanups
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (JobGroup::Cleanup, c.id, c.schedule.as_str()))
            .chain(
                refreshes
                    .iter()
                    .filter(|c| c.enabled)
                    .map(|c| (JobGroup::Refresh, c.id, c.schedule.as_str())),
            );

        let mut scheduled = 0;
        for (group, id, cron) in jobs {
            match self.scheduler.schedule_or_update(JobKey::new(group, id), cron) {
                Ok(()) => scheduled += 1,
                Err(err) => warn!(%group, config_id = %id, error = %err, "stored job not restored"),
            }
        }
        info!(scheduled, "stored jobs restored");
        scheduled
    }

    pub fn state(&self, group: JobGroup, config_id: Uuid) -> ScheduleState {
        match self.scheduler.next_fire_time(JobKey::new(group, config_id)) {
            Some(next_fire_time) => ScheduleState::Scheduled { next_fire_time },
            None => ScheduleState::Unscheduled,
        }
    }

    pub fn is_standby(&self) -> bool {
        self.scheduler.is_standby()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        fired: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Counter {
        async fn run_job(&self, _group: JobGroup, _config_id: Uuid) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_enable_disable_delete() {
        let scheduler = Arc::new(TokioScheduler::new());
        let handler: Arc<dyn JobHandler> = Arc::new(Counter {
            fired: AtomicUsize::new(0),
        });
        scheduler.set_handler(Arc::downgrade(&handler)).unwrap();
        let adapter = SchedulerAdapter::new(scheduler.clone());
        let id = Uuid::new_v4();

        let state = adapter.reschedule(JobGroup::Cleanup, id, "0 0 3 * * *", false).unwrap();
        assert_eq!(state, ScheduleState::Unscheduled);
        assert!(adapter.is_standby());

        let state = adapter.reschedule(JobGroup::Cleanup, id, "0 0 3 * * *", true).unwrap();
        match state {
            ScheduleState::Scheduled { next_fire_time } => assert!(next_fire_time > Utc::now()),
            other => panic!("expected a live trigger, got {:?}", other),
        }
        assert!(!adapter.is_standby());

        adapter.delete_job(JobGroup::Cleanup, id).unwrap();
        adapter.delete_job(JobGroup::Cleanup, id).unwrap();
        assert_eq!(adapter.state(JobGroup::Cleanup, id), ScheduleState::Unscheduled);
        assert!(scheduler.job_keys().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected_even_when_disabled() {
        let adapter = SchedulerAdapter::new(Arc::new(TokioScheduler::paused()));
        let result = adapter.reschedule(JobGroup::Refresh, Uuid::new_v4(), "* * * * * *", false);
        assert!(matches!(result, Err(TdmError::Validation(_))));
    }

    #[tokio::test]
    async fn test_trigger_fires() {
        let scheduler = Arc::new(TokioScheduler::new());
        let counter = Arc::new(Counter {
            fired: AtomicUsize::new(0),
        });
        let handler: Arc<dyn JobHandler> = counter.clone();
        scheduler.set_handler(Arc::downgrade(&handler)).unwrap();

        // every-second schedules are refused by parse_cron, so build the cron directly
        let every_second = Cron::new("* * * * * *").with_seconds_optional().parse().unwrap();
        let key = JobKey::new(JobGroup::Cleanup, Uuid::new_v4());
        let (stop_tx, join) = scheduler
            .spawn_trigger(key, every_second, Arc::downgrade(&handler))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2200)).await;
        let _ = stop_tx.send(());
        join.await.unwrap();
        assert!(counter.fired.load(Ordering::SeqCst) >= 1);
        scheduler.shutdown().await.unwrap();
    }
}
