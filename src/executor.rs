//! Program Executor: runs a program's steps sequentially, one zone at a
//! time, cooperatively cancellable by polling a flag once a second. A
//! `RunGuard` gives the run unconditional cleanup — whatever step is running
//! when the guard drops (completion, cancellation, or an early `?` return)
//! gets stopped and the run-state document is reset to idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, warn};

use crate::actuator::ZoneActuator;
use crate::error::KernelResult;
use crate::store::{Program, RunState, Store};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Unconditional cleanup for a program run. Whatever zone is mid-step when
/// this drops gets stopped, and the run-state document is reset to idle,
/// covering early returns, cancellation, and panics alike.
struct RunGuard {
    actuator: Arc<ZoneActuator>,
    store: Store,
    active_zone: Arc<Mutex<Option<u32>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(zone_id) = self.active_zone.lock().expect("active zone slot poisoned").take() {
            self.actuator.stop_zone(zone_id);
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_run_state(&RunState::default()).await {
                error!("failed to persist idle run state during cleanup: {e}");
            }
        });
    }
}

pub struct ProgramExecutor {
    actuator: Arc<ZoneActuator>,
    store: Store,
}

impl ProgramExecutor {
    pub fn new(actuator: Arc<ZoneActuator>, store: Store) -> Self {
        Self { actuator, store }
    }

    /// Runs `program`'s steps in order. `pins` maps zone id to GPIO pin, as
    /// resolved from the current settings document. Returns once every step
    /// has completed or `cancel` is observed set.
    pub async fn run(
        &self,
        program: &Program,
        pins: &HashMap<u32, u8>,
        cancel: Arc<AtomicBool>,
    ) -> KernelResult<()> {
        let active_zone = Arc::new(Mutex::new(None));
        let _guard = RunGuard {
            actuator: Arc::clone(&self.actuator),
            store: self.store.clone(),
            active_zone: Arc::clone(&active_zone),
        };

        let running = RunState {
            program_running: true,
            current_program_id: Some(program.id.clone()),
        };
        self.store.save_run_state(&running).await?;

        for step in &program.steps {
            if cancel.load(Ordering::SeqCst) {
                break;
            }

            let Some(&pin) = pins.get(&step.zone_id) else {
                warn!(zone_id = step.zone_id, "skipping step: zone not configured");
                continue;
            };

            *active_zone.lock().expect("active zone slot poisoned") = Some(step.zone_id);
            if let Err(e) = self.actuator.start_zone(step.zone_id, pin, step.duration_minutes) {
                warn!(zone_id = step.zone_id, "skipping step: failed to start zone: {e}");
                *active_zone.lock().expect("active zone slot poisoned") = None;
                continue;
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(step.duration_minutes as u64 * 60);
            while tokio::time::Instant::now() < deadline {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
            }

            self.actuator.stop_zone(step.zone_id);
            *active_zone.lock().expect("active zone slot poisoned") = None;
        }

        Ok(())
    }
}
