//! Zone Actuator: owns the active-zone table and the safety-relay invariant
//! (relay energized iff at least one zone is active), plus per-zone
//! auto-stop timers built on spawned tasks for time-driven state
//! transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

use crate::clock::Clock;
use crate::error::{KernelError, KernelResult};
use crate::gpio::GpioDriver;

struct ActiveZoneEntry {
    pin: u8,
    started_monotonic: i64,
    duration_minutes: u32,
    stop_task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ZoneStatus {
    pub zone_id: u32,
    pub pin: u8,
    pub started_monotonic: i64,
    pub duration_minutes: u32,
    pub remaining_secs: i64,
}

/// Owns the relay board's active-low quirks and the safety-relay refcount.
/// Policy (how long a zone may run, how many may run concurrently) lives one
/// layer up in the kernel; this type only ever does what it's told.
pub struct ZoneActuator {
    gpio: Arc<dyn GpioDriver>,
    clock: Arc<dyn Clock>,
    safety_relay_pin: u8,
    active: Mutex<HashMap<u32, ActiveZoneEntry>>,
}

impl ZoneActuator {
    pub fn new(gpio: Arc<dyn GpioDriver>, clock: Arc<dyn Clock>, safety_relay_pin: u8) -> Arc<Self> {
        Arc::new(Self {
            gpio,
            clock,
            safety_relay_pin,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active zone table poisoned").len()
    }

    pub fn is_active(&self, zone_id: u32) -> bool {
        self.active
            .lock()
            .expect("active zone table poisoned")
            .contains_key(&zone_id)
    }

    pub fn status(&self) -> Vec<ZoneStatus> {
        let now = self.clock.monotonic_secs();
        self.active
            .lock()
            .expect("active zone table poisoned")
            .iter()
            .map(|(&zone_id, e)| {
                let elapsed = now - e.started_monotonic;
                let total_secs = e.duration_minutes as i64 * 60;
                ZoneStatus {
                    zone_id,
                    pin: e.pin,
                    started_monotonic: e.started_monotonic,
                    duration_minutes: e.duration_minutes,
                    remaining_secs: (total_secs - elapsed).max(0),
                }
            })
            .collect()
    }

    /// Starts `zone_id` on `pin` for `duration_minutes`, energizing the
    /// safety relay if this is the first active zone. If the zone is
    /// already running, its existing timer is cancelled and replaced —
    /// calling `start_zone` again simply restarts the countdown.
    pub fn start_zone(self: &Arc<Self>, zone_id: u32, pin: u8, duration_minutes: u32) -> KernelResult<()> {
        if duration_minutes == 0 {
            return Err(KernelError::validation("zone duration must be at least 1 minute"));
        }
        self.stop_zone_internal(zone_id);

        let mut active = self.active.lock().expect("active zone table poisoned");
        let was_empty = active.is_empty();
        self.gpio.set_pin(pin, true)?;
        if was_empty {
            self.gpio.set_pin(self.safety_relay_pin, true)?;
        }

        let this = Arc::clone(self);
        let stop_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration_minutes as u64 * 60)).await;
            this.stop_zone(zone_id);
        });

        active.insert(
            zone_id,
            ActiveZoneEntry {
                pin,
                started_monotonic: self.clock.monotonic_secs(),
                duration_minutes,
                stop_task,
            },
        );
        Ok(())
    }

    /// Stops `zone_id` if active. A no-op if it isn't — stopping an idle
    /// zone is not an error.
    pub fn stop_zone(&self, zone_id: u32) {
        self.stop_zone_internal(zone_id);
    }

    fn stop_zone_internal(&self, zone_id: u32) {
        let mut active = self.active.lock().expect("active zone table poisoned");
        if let Some(entry) = active.remove(&zone_id) {
            entry.stop_task.abort();
            if let Err(e) = self.gpio.set_pin(entry.pin, false) {
                error!(zone_id, "failed to de-energize zone pin: {e}");
            }
            if active.is_empty() {
                if let Err(e) = self.gpio.set_pin(self.safety_relay_pin, false) {
                    error!("failed to de-energize safety relay: {e}");
                }
            }
        }
    }

    /// Stops every active zone and, as a consequence, the safety relay.
    pub fn stop_all(&self) {
        let zone_ids: Vec<u32> = self
            .active
            .lock()
            .expect("active zone table poisoned")
            .keys()
            .copied()
            .collect();
        for zone_id in zone_ids {
            self.stop_zone_internal(zone_id);
        }
    }
}
