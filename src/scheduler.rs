//! Program Scheduler: every 30 seconds, checks whether any program is due
//! right now and starts it automatically, evaluating calendar-recurrence
//! rules rather than a sensor threshold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

use crate::actuator::ZoneActuator;
use crate::clock::{parse_date_to_absolute_day, Clock};
use crate::error::KernelResult;
use crate::executor::ProgramExecutor;
use crate::store::{Program, Recurrence, Settings, Store};

pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

struct CurrentRun {
    program_id: String,
    manual: bool,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct ProgramScheduler {
    clock: Arc<dyn Clock>,
    store: Store,
    actuator: Arc<ZoneActuator>,
    executor: Arc<ProgramExecutor>,
    current: Mutex<Option<CurrentRun>>,
}

impl ProgramScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Store,
        actuator: Arc<ZoneActuator>,
        executor: Arc<ProgramExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            store,
            actuator,
            executor,
            current: Mutex::new(None),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.current.lock().expect("current run poisoned").is_some()
    }

    pub fn current_program_id(&self) -> Option<String> {
        self.current
            .lock()
            .expect("current run poisoned")
            .as_ref()
            .map(|c| c.program_id.clone())
    }

    /// Starts `program` running, preempting whatever is currently running
    /// (manual or automatic). Returns once the new run has been spawned —
    /// it does not wait for it to finish.
    pub async fn start_program(
        self: &Arc<Self>,
        program: Program,
        manual: bool,
        pins: HashMap<u32, u8>,
    ) -> KernelResult<()> {
        self.preempt_current().await;

        let cancel = Arc::new(AtomicBool::new(false));
        let executor = Arc::clone(&self.executor);
        let program_id = program.id.clone();
        let cancel_for_task = Arc::clone(&cancel);
        let handle = tokio::spawn(async move {
            if let Err(e) = executor.run(&program, &pins, cancel_for_task).await {
                error!(program_id = %program.id, "program run failed: {e}");
            }
        });

        *self.current.lock().expect("current run poisoned") = Some(CurrentRun {
            program_id,
            manual,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Cancels whatever's running, if anything, and waits for its zones to
    /// be stopped before returning.
    pub async fn stop_current(&self) {
        self.preempt_current().await;
    }

    async fn preempt_current(&self) {
        let previous = self.current.lock().expect("current run poisoned").take();
        if let Some(prev) = previous {
            prev.cancel.store(true, Ordering::SeqCst);
            self.actuator.stop_all();
            let _ = prev.handle.await;
        }
    }

    /// Checks every program against the current time and fires the first
    /// one (ascending numeric id) that's due, unless it would have to
    /// preempt another automatic run already in progress — automatic
    /// programs preempt a manual run, but never another automatic one.
    pub async fn tick(self: &Arc<Self>) {
        let settings = self.store.load_settings().await;
        if !settings.automatic_programs_enabled {
            return;
        }

        let programs = self.store.load_programs().await;
        let local = self.clock.local_time();
        let today_absolute = local.absolute_day();
        let today_date = local.date_str();
        let hhmm = local.hhmm();

        let mut ids: Vec<&String> = programs.keys().collect();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));

        for id in ids {
            let program = &programs[id];
            if program.activation_time != hhmm {
                continue;
            }
            if !program.months.contains(&local.month) {
                continue;
            }
            if program.last_run_date.as_deref() == Some(today_date.as_str()) {
                continue;
            }
            if !is_due_today(program, today_absolute) {
                continue;
            }

            let busy_with_manual = self
                .current
                .lock()
                .expect("current run poisoned")
                .as_ref()
                .map(|c| c.manual)
                .unwrap_or(false);
            if self.is_busy() && !busy_with_manual {
                continue;
            }

            let mut fired = program.clone();
            fired.last_run_date = Some(today_date.clone());
            let mut updated = programs.clone();
            updated.insert(id.clone(), fired.clone());
            if let Err(e) = self.store.save_programs(&updated).await {
                error!("failed to persist program last_run_date: {e}");
            }

            let pins = zone_pins(&settings);
            if let Err(e) = self.start_program(fired, false, pins).await {
                error!(program_id = %id, "failed to start due program: {e}");
            }
            break;
        }
    }

    /// Spawns the 30-second tick loop as a background task.
    pub fn spawn_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}

fn zone_pins(settings: &Settings) -> HashMap<u32, u8> {
    settings.zones.iter().map(|z| (z.id, z.pin)).collect()
}

/// A program is due today if its recurrence interval has elapsed since its
/// last run. A program that has never run is due immediately.
fn is_due_today(program: &Program, today_absolute_day: i64) -> bool {
    match &program.recurrence {
        Recurrence::Daily => true,
        _ => {
            let interval = program.recurrence.interval_days() as i64;
            match program.last_run_date.as_deref().and_then(parse_date_to_absolute_day) {
                None => true,
                Some(last) => today_absolute_day - last >= interval,
            }
        }
    }
}
