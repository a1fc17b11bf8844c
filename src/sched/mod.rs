//! Time-driven action planner and runner.
//!
//! The scheduler materialises one in-memory job per configured action for
//! the window from now until the next 23:01 UTC boundary, where a
//! self-replanning job rebuilds the whole schedule for the following day.
//! Jobs fire on the main loop but run their task bodies on the blocking
//! pool — a task enqueues modem traffic, it never transmits synchronously.
//! Outcomes are routed to `on_ok`/`on_warning`/`on_critical`/`on_invalid`
//! follow-on bindings through a one-way command channel, so tasks never
//! hold a reference back into the scheduler.

pub mod cron;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{parse_hhmm, ActionConfig, Config};
use crate::modem::Connection;
use crate::sched::cron::{CronParts, CronSchedule};
use crate::tasks::{self, Outcome, RegisteredTask, TaskShared};

/// Idle wait when no job is materialised at all.
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("action \"{id}\": {reason}")]
    BadAction { id: String, reason: String },
    #[error("initial check \"{id}\" returned {outcome}")]
    InitialCheckFailed { id: String, outcome: Outcome },
    #[error("too long until next schedule boundary: {0}")]
    HorizonExceeded(String),
}

#[derive(Debug, Clone)]
enum Recurrence {
    Interval(chrono::Duration),
    Cron(CronSchedule),
    /// Fire once and remove.
    Once,
}

struct Job {
    action_idx: Option<usize>,
    next_run: DateTime<Utc>,
    recurrence: Recurrence,
    /// Set while an instance is running; late firings coalesce against it.
    running: Arc<AtomicBool>,
}

enum SchedCommand {
    Outcome { action_idx: usize, outcome: Outcome },
}

pub struct Scheduler {
    cfg: Arc<Config>,
    connection: Arc<dyn Connection>,
    registry: HashMap<String, Arc<RegisteredTask>>,
    jobs: Vec<Job>,
    planned_once: bool,
    cmd_tx: mpsc::UnboundedSender<SchedCommand>,
    cmd_rx: mpsc::UnboundedReceiver<SchedCommand>,
}

impl Scheduler {
    /// Instantiate every configured task (and probe every follow-on
    /// binding) so that bad configuration fails before anything runs.
    pub fn new(
        cfg: Arc<Config>,
        connection: Arc<dyn Connection>,
    ) -> Result<Self, SchedulerError> {
        info!("Configuring tasks from defined actions");
        let mut registry = HashMap::new();

        for action in &cfg.actions {
            debug!("Configuring action instance {}: type {}", action.id, action.task);
            let registered = tasks::build(&action.task, &action.id, &action.args, &connection)
                .map_err(|reason| SchedulerError::BadAction {
                    id: action.id.clone(),
                    reason,
                })?;
            registry.insert(action.id.clone(), Arc::new(registered));

            for outcome in [
                Outcome::Ok,
                Outcome::Warning,
                Outcome::Critical,
                Outcome::Invalid,
            ] {
                if let Some((kind, args)) = action.follow_on(outcome) {
                    tasks::build(kind, &format!("{}_probe", action.id), args, &connection)
                        .map_err(|reason| SchedulerError::BadAction {
                            id: action.id.clone(),
                            reason: format!("follow-on {kind}: {reason}"),
                        })?;
                }
            }

            if action.has_cron_fields() {
                CronSchedule::parse(&cron_parts(action)).map_err(|reason| {
                    SchedulerError::BadAction {
                        id: action.id.clone(),
                        reason,
                    }
                })?;
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cfg,
            connection,
            registry,
            jobs: Vec::new(),
            planned_once: false,
            cmd_tx,
            cmd_rx,
        })
    }

    /// Run `on_start` actions before any planning. A result worse than OK
    /// aborts startup unless `start_when_fail` is configured.
    pub fn initial_checks(&self) -> Result<(), SchedulerError> {
        for action in &self.cfg.actions {
            if !action.on_start {
                continue;
            }
            info!("Running initial check {}", action.id);
            let registered = &self.registry[&action.id];
            let outcome =
                tasks::run_boundary(registered, action.action.as_deref(), None);
            if outcome != Outcome::Ok {
                if self.cfg.general.start_when_fail {
                    warn!("Initial check {} returned {outcome}, starting anyway", action.id);
                } else {
                    return Err(SchedulerError::InitialCheckFailed {
                        id: action.id.clone(),
                        outcome,
                    });
                }
            }
        }
        Ok(())
    }

    /// Main loop: fire due jobs, replan at the boundary, route outcomes.
    /// Runs until the surrounding select drops it at shutdown.
    pub async fn run(&mut self) -> Result<(), SchedulerError> {
        self.plan_schedule(Utc::now())?;

        loop {
            let wait = self
                .jobs
                .iter()
                .map(|job| job.next_run)
                .min()
                .map_or(IDLE_WAIT, |next| {
                    (next - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                });

            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    self.fire_due()?;
                }
                cmd = self.cmd_rx.recv() => {
                    if let Some(SchedCommand::Outcome { action_idx, outcome }) = cmd {
                        self.route_outcome(action_idx, outcome);
                    }
                }
            }
        }
    }

    /// Stop supervisor threads owned by task instances.
    pub fn stop_tasks(&self) {
        for registered in self.registry.values() {
            registered.task.stop();
        }
    }

    /// Rebuild the in-memory schedule for (now, next 23:01 UTC]. Runs at
    /// boot and from the self-replanning job at the boundary.
    fn plan_schedule(&mut self, reference: DateTime<Utc>) -> Result<(), SchedulerError> {
        let boundary = next_plan_boundary(reference)?;
        info!("Planning schedule up to {boundary}");

        let first_pass = !self.planned_once;
        self.jobs.clear();

        // The replanning job itself.
        self.jobs.push(Job {
            action_idx: None,
            next_run: boundary,
            recurrence: Recurrence::Once,
            running: Arc::new(AtomicBool::new(false)),
        });

        for (idx, action) in self.cfg.actions.iter().enumerate() {
            debug!("Planning {}", action.id);

            if action.onboot && first_pass {
                self.jobs.push(Job {
                    action_idx: Some(idx),
                    next_run: reference,
                    recurrence: Recurrence::Once,
                    running: Arc::new(AtomicBool::new(false)),
                });
            }

            if let Some(interval) = interval_of(action) {
                if interval > chrono::Duration::days(1) {
                    warn!(
                        "Interval for {} exceeds the daily replanning window and will never fire",
                        action.id
                    );
                }
                self.jobs.push(Job {
                    action_idx: Some(idx),
                    next_run: reference + interval,
                    recurrence: Recurrence::Interval(interval),
                    running: Arc::new(AtomicBool::new(false)),
                });
            } else if action.date.is_some() || action.time.is_some() {
                let run_at = parse_one_shot(action, reference).map_err(|reason| {
                    SchedulerError::BadAction {
                        id: action.id.clone(),
                        reason,
                    }
                })?;
                if run_at <= reference {
                    info!(
                        "Job {} does not need to be scheduled as it is prior to current time",
                        action.id
                    );
                } else if run_at > boundary {
                    info!(
                        "Job {} does not need to be scheduled as it is after the next planning time",
                        action.id
                    );
                } else {
                    self.jobs.push(Job {
                        action_idx: Some(idx),
                        next_run: run_at,
                        recurrence: Recurrence::Once,
                        running: Arc::new(AtomicBool::new(false)),
                    });
                }
            } else if action.has_cron_fields() {
                let schedule =
                    CronSchedule::parse(&cron_parts(action)).map_err(|reason| {
                        SchedulerError::BadAction {
                            id: action.id.clone(),
                            reason,
                        }
                    })?;
                match schedule.next_after(reference) {
                    Some(next) if next <= boundary => {
                        self.jobs.push(Job {
                            action_idx: Some(idx),
                            next_run: next,
                            recurrence: Recurrence::Cron(schedule),
                            running: Arc::new(AtomicBool::new(false)),
                        });
                    }
                    Some(next) => debug!(
                        "Cron job {} next fires {next}, beyond this planning window",
                        action.id
                    ),
                    None => warn!("Cron job {} has no future firing at all", action.id),
                }
            } else if action.onboot {
                if first_pass {
                    warn!("{} will only be run at startup", action.id);
                }
            } else if !action.on_start {
                // Validation rejects this earlier; belt and braces.
                warn!("No compatible timing schedule present for {}", action.id);
            }
        }

        self.planned_once = true;
        Ok(())
    }

    /// Fire every job whose time has come.
    fn fire_due(&mut self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let mut replan = false;
        let mut remove = Vec::new();

        for idx in 0..self.jobs.len() {
            if self.jobs[idx].next_run > now {
                continue;
            }
            match self.jobs[idx].action_idx {
                None => replan = true,
                Some(action_idx) => {
                    let running = Arc::clone(&self.jobs[idx].running);
                    self.spawn_action(action_idx, running, None);
                }
            }

            // Coalesce: late firings collapse into one, and the next run
            // is measured from now.
            let advance = match &self.jobs[idx].recurrence {
                Recurrence::Once => None,
                Recurrence::Interval(interval) => Some(now + *interval),
                Recurrence::Cron(schedule) => schedule.next_after(now),
            };
            match advance {
                Some(next) => self.jobs[idx].next_run = next,
                None => remove.push(idx),
            }
        }

        for idx in remove.into_iter().rev() {
            self.jobs.remove(idx);
        }
        if replan {
            self.plan_schedule(now)?;
        }
        Ok(())
    }

    /// Run one task instance on the blocking pool. A still-running previous
    /// instance coalesces this firing away (`max_instances = 1`).
    fn spawn_action(
        &self,
        action_idx: usize,
        running: Arc<AtomicBool>,
        invoking: Option<Arc<TaskShared>>,
    ) {
        let action = &self.cfg.actions[action_idx];
        if running.swap(true, Ordering::SeqCst) {
            warn!(
                "Skipping firing of {}: previous instance still running",
                action.id
            );
            return;
        }

        let registered = Arc::clone(&self.registry[&action.id]);
        let sub_action = action.action.clone();
        let id = action.id.clone();
        let tx = self.cmd_tx.clone();

        tokio::task::spawn_blocking(move || {
            let outcome = tasks::run_boundary(&registered, sub_action.as_deref(), invoking);
            debug!("Task {id} returned {outcome}");
            running.store(false, Ordering::SeqCst);
            let _ = tx.send(SchedCommand::Outcome {
                action_idx,
                outcome,
            });
        });
    }

    /// Instantiate and immediately run the follow-on bound to this outcome,
    /// passing the producing task's shared state as `invoking`.
    fn route_outcome(&self, action_idx: usize, outcome: Outcome) {
        let action = &self.cfg.actions[action_idx];
        let Some((kind, args)) = routed_follow_on(action, outcome) else {
            return;
        };

        let follow_id = format!("{}_{}", action.id, Utc::now().format("%H%M%S%f"));
        debug!("Submitting {}-status invocation id {follow_id}", outcome);

        let registered = match tasks::build(kind, &follow_id, args, &self.connection) {
            Ok(registered) => Arc::new(registered),
            Err(reason) => {
                error!("Cannot build follow-on {kind} for {}: {reason}", action.id);
                return;
            }
        };
        let invoking = Arc::clone(&self.registry[&action.id].shared);

        tokio::task::spawn_blocking(move || {
            let outcome = tasks::run_boundary(&registered, None, Some(invoking));
            debug!("Follow-on {} returned {outcome}", registered.shared.id);
        });
    }
}

/// The follow-on binding the scheduler will actually fire. Only non-
/// `INVALID` outcomes route; an `on_invalid` binding is parsed and
/// validated but never invoked.
fn routed_follow_on(
    action: &ActionConfig,
    outcome: Outcome,
) -> Option<(&str, &BTreeMap<String, String>)> {
    if outcome == Outcome::Invalid {
        return None;
    }
    action.follow_on(outcome)
}

/// The 23:01 UTC boundary strictly after `reference`. The distance can
/// never legitimately exceed a day.
fn next_plan_boundary(reference: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let boundary_time = NaiveTime::from_hms_opt(23, 1, 0).expect("valid boundary time");
    let mut boundary = reference.date_naive().and_time(boundary_time).and_utc();
    if boundary <= reference {
        boundary += chrono::Duration::days(1);
    }
    let remaining = boundary - reference;
    if remaining > chrono::Duration::days(1) {
        return Err(SchedulerError::HorizonExceeded(format!("{remaining}")));
    }
    Ok(boundary)
}

fn interval_of(action: &ActionConfig) -> Option<chrono::Duration> {
    if let Some(minutes) = action.interval {
        return Some(chrono::Duration::minutes(i64::from(minutes)));
    }
    action
        .interval_secs
        .map(|secs| chrono::Duration::seconds(i64::from(secs)))
}

/// Resolve a one-shot `date`/`time` pair; the time defaults to 1200, the
/// date to today.
fn parse_one_shot(
    action: &ActionConfig,
    reference: DateTime<Utc>,
) -> Result<DateTime<Utc>, String> {
    let date = match &action.date {
        Some(date) => chrono::NaiveDate::parse_from_str(date, "%Y%m%d")
            .map_err(|_| format!("date is not YYYYMMDD: \"{date}\""))?,
        None => reference.date_naive(),
    };
    let time = match &action.time {
        Some(time) => parse_hhmm(time).ok_or_else(|| format!("time is not HHMM: \"{time}\""))?,
        None => NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default(),
    };
    Ok(date.and_time(time).and_utc())
}

fn cron_parts(action: &ActionConfig) -> CronParts {
    CronParts {
        year: action.year.clone(),
        month: action.month.clone(),
        day: action.day.clone(),
        week: action.week.clone(),
        day_of_week: action.day_of_week.clone(),
        hour: action.hour.clone(),
        minute: action.minute.clone(),
        second: action.second.clone(),
        start_date: action.start_date.clone(),
        end_date: action.end_date.clone(),
    }
}
