//! Kernel façade: the single entry point the web adapter (and anything
//! else) talks to. Owns the store, actuator, scheduler, connectivity
//! supervisor and log sink, validates every command, and translates
//! failures into [`KernelError`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::actuator::{ZoneActuator, ZoneStatus};
use crate::clock::Clock;
use crate::connectivity::{ConnectivityStatus, ConnectivitySupervisor};
use crate::error::{KernelError, KernelResult};
use crate::executor::ProgramExecutor;
use crate::gpio::GpioDriver;
use crate::logsink::{LogEntry, LogSink};
use crate::scheduler::ProgramScheduler;
use crate::store::{next_program_id, Program, ProgramsDocument, RunState, Settings, Store};

/// Exit code `main` uses when a restart was requested through the API.
/// An external supervisor (systemd, a container restart policy) is
/// expected to relaunch the process on seeing it — a userspace binary has
/// no `machine.reset()` to fall back on.
pub const EXIT_CODE_RESTART_REQUESTED: i32 = 75;

#[derive(Debug, Clone, serde::Serialize)]
pub struct KernelStatus {
    pub zones: Vec<ZoneStatus>,
    pub program_running: bool,
    pub current_program_id: Option<String>,
    pub automatic_programs_enabled: bool,
}

pub struct Kernel {
    store: Store,
    clock: Arc<dyn Clock>,
    actuator: Arc<ZoneActuator>,
    scheduler: Arc<ProgramScheduler>,
    connectivity: Arc<ConnectivitySupervisor>,
    log: Arc<LogSink>,
    last_zone_start: Mutex<Option<i64>>,
}

impl Kernel {
    pub async fn new(
        data_dir: impl Into<PathBuf>,
        gpio: Arc<dyn GpioDriver>,
        clock: Arc<dyn Clock>,
        log: Arc<LogSink>,
    ) -> Arc<Self> {
        let data_dir = data_dir.into();
        let store = Store::new(data_dir.clone());
        let settings = store.load_settings().await;

        let actuator = ZoneActuator::new(Arc::clone(&gpio), Arc::clone(&clock), settings.safety_relay.pin);
        let executor = Arc::new(ProgramExecutor::new(Arc::clone(&actuator), store.clone()));
        let scheduler = ProgramScheduler::new(Arc::clone(&clock), store.clone(), Arc::clone(&actuator), executor);
        let connectivity = ConnectivitySupervisor::new(store.clone());

        // A crash or power loss can leave run_state claiming a program is
        // still running; the actuator always boots with every relay off,
        // so the run-state document must agree.
        let _ = store.save_run_state(&RunState::default()).await;

        let kernel = Arc::new(Self {
            store,
            clock,
            actuator,
            scheduler: Arc::clone(&scheduler),
            connectivity: Arc::clone(&connectivity),
            log,
            last_zone_start: Mutex::new(None),
        });

        scheduler.spawn_loop();
        connectivity.spawn_loop();

        kernel
    }

    pub async fn status(&self) -> KernelStatus {
        let settings = self.store.load_settings().await;
        KernelStatus {
            zones: self.actuator.status(),
            program_running: self.scheduler.is_busy(),
            current_program_id: self.scheduler.current_program_id(),
            automatic_programs_enabled: settings.automatic_programs_enabled,
        }
    }

    pub fn connectivity_status(&self) -> ConnectivityStatus {
        self.connectivity.status()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.log.snapshot()
    }

    // -- settings ----------------------------------------------------------

    pub async fn get_settings(&self) -> Settings {
        self.store.load_settings().await
    }

    pub async fn update_settings(&self, settings: Settings) -> KernelResult<Settings> {
        if settings.zones.is_empty() {
            return Err(KernelError::validation("at least one zone must be configured"));
        }
        if settings.max_active_zones == 0 {
            return Err(KernelError::validation("max_active_zones must be at least 1"));
        }
        if settings.max_zone_duration == 0 {
            return Err(KernelError::validation("max_zone_duration must be at least 1 minute"));
        }
        self.store.save_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn reset_settings(&self) -> KernelResult<Settings> {
        let defaults = Settings::default();
        self.store.save_settings(&defaults).await?;
        Ok(defaults)
    }

    pub async fn reset_factory_data(&self) -> KernelResult<()> {
        self.stop_all().await;
        self.store.save_settings(&Settings::default()).await?;
        self.store.save_programs(&ProgramsDocument::new()).await?;
        self.store.save_run_state(&RunState::default()).await?;
        self.log.record("WARN", "factory reset: settings and programs cleared");
        Ok(())
    }

    /// Stops all zones and exits the process after a short settle delay, so
    /// the relay board and any in-flight HTTP response finish cleanly
    /// before an external supervisor relaunches the binary.
    pub fn request_restart(&self) {
        self.actuator.stop_all();
        self.log.record("WARN", "restart requested; exiting for supervisor relaunch");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            std::process::exit(EXIT_CODE_RESTART_REQUESTED);
        });
    }

    // -- zones ---------------------------------------------------------

    pub async fn start_zone(&self, zone_id: u32, duration_minutes: u32) -> KernelResult<()> {
        if self.scheduler.is_busy() {
            return Err(KernelError::busy("a program is currently running"));
        }
        let settings = self.store.load_settings().await;
        let zone = settings
            .zone(zone_id)
            .ok_or_else(|| KernelError::not_found(format!("zone {zone_id} is not configured")))?
            .clone();
        if duration_minutes == 0 || duration_minutes > settings.max_zone_duration {
            return Err(KernelError::validation(format!(
                "duration must be between 1 and {} minutes",
                settings.max_zone_duration
            )));
        }
        if !self.actuator.is_active(zone_id) && self.actuator.active_count() >= settings.max_active_zones as usize {
            return Err(KernelError::busy("maximum number of simultaneously active zones reached"));
        }
        self.enforce_activation_delay(&settings)?;

        self.actuator.start_zone(zone_id, zone.pin, duration_minutes)?;
        self.log
            .record("INFO", format!("zone {zone_id} started manually for {duration_minutes} minute(s)"));
        Ok(())
    }

    pub fn stop_zone(&self, zone_id: u32) {
        self.actuator.stop_zone(zone_id);
        self.log.record("INFO", format!("zone {zone_id} stopped"));
    }

    pub async fn stop_all(&self) {
        self.scheduler.stop_current().await;
        self.actuator.stop_all();
        self.log.record("INFO", "all zones stopped");
    }

    /// Relay boards need a settle gap between activations; a zone start
    /// request inside that window is rejected rather than queued.
    fn enforce_activation_delay(&self, settings: &Settings) -> KernelResult<()> {
        let now = self.clock.monotonic_secs();
        let mut last = self.last_zone_start.lock().expect("last zone start poisoned");
        if let Some(prev) = *last {
            let elapsed = now - prev;
            let delay = settings.activation_delay as i64;
            if elapsed < delay {
                return Err(KernelError::busy(format!(
                    "wait {} more second(s) before activating another zone",
                    delay - elapsed
                )));
            }
        }
        *last = Some(now);
        Ok(())
    }

    // -- programs ------------------------------------------------------

    pub async fn list_programs(&self) -> ProgramsDocument {
        self.store.load_programs().await
    }

    pub async fn create_program(&self, mut program: Program) -> KernelResult<Program> {
        let settings = self.store.load_settings().await;
        let mut programs = self.store.load_programs().await;
        validate_program(&program, &settings, &programs, None)?;
        program.id = next_program_id(&programs);
        check_conflicts(&programs, &program, None)?;
        programs.insert(program.id.clone(), program.clone());
        self.store.save_programs(&programs).await?;
        Ok(program)
    }

    pub async fn update_program(&self, id: &str, mut program: Program) -> KernelResult<Program> {
        let settings = self.store.load_settings().await;
        let mut programs = self.store.load_programs().await;
        if !programs.contains_key(id) {
            return Err(KernelError::not_found(format!("program {id} not found")));
        }
        validate_program(&program, &settings, &programs, Some(id))?;
        program.id = id.to_string();
        check_conflicts(&programs, &program, Some(id))?;
        if self.scheduler.current_program_id().as_deref() == Some(id) {
            self.scheduler.stop_current().await;
        }
        programs.insert(id.to_string(), program.clone());
        self.store.save_programs(&programs).await?;
        Ok(program)
    }

    pub async fn delete_program(&self, id: &str) -> KernelResult<()> {
        let mut programs = self.store.load_programs().await;
        if programs.remove(id).is_none() {
            return Err(KernelError::not_found(format!("program {id} not found")));
        }
        if self.scheduler.current_program_id().as_deref() == Some(id) {
            self.scheduler.stop_current().await;
        }
        self.store.save_programs(&programs).await
    }

    // -- connectivity ----------------------------------------------------

    pub async fn connect_wifi(&self, ssid: String, password: String) -> KernelResult<Settings> {
        if ssid.is_empty() {
            return Err(KernelError::validation("ssid must not be empty"));
        }
        let mut settings = self.store.load_settings().await;
        settings.wifi.ssid = ssid;
        settings.wifi.password = password;
        settings.client_enabled = true;
        self.store.save_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn disconnect_wifi(&self) -> KernelResult<Settings> {
        let mut settings = self.store.load_settings().await;
        settings.client_enabled = false;
        self.store.save_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn activate_ap(&self) -> KernelResult<Settings> {
        self.disconnect_wifi().await
    }

    /// No real radio to scan with in userspace — returns an empty network
    /// list and persists it to the transient `wifi_scan.json` file, for
    /// API-shape compatibility with a real scan result.
    pub async fn scan_wifi(&self) -> Vec<String> {
        let networks: Vec<String> = Vec::new();
        if let Ok(bytes) = serde_json::to_vec_pretty(&networks) {
            let _ = tokio::fs::write(self.store.data_dir().join("wifi_scan.json"), bytes).await;
        }
        networks
    }

    pub async fn run_program_now(&self, id: &str) -> KernelResult<()> {
        let programs = self.store.load_programs().await;
        let program = programs
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::not_found(format!("program {id} not found")))?;
        let settings = self.store.load_settings().await;
        let pins = settings.zones.iter().map(|z| (z.id, z.pin)).collect();
        self.log.record("INFO", format!("program {id} started manually"));
        self.scheduler.start_program(program, true, pins).await
    }
}

fn validate_program(
    program: &Program,
    settings: &Settings,
    programs: &ProgramsDocument,
    exclude_id: Option<&str>,
) -> KernelResult<()> {
    if program.name.len() > 16 {
        return Err(KernelError::validation("program name must be 16 characters or fewer"));
    }
    if programs
        .iter()
        .any(|(id, other)| Some(id.as_str()) != exclude_id && other.name == program.name)
    {
        return Err(KernelError::validation(format!(
            "program name '{}' is already in use",
            program.name
        )));
    }
    if program.months.is_empty() {
        return Err(KernelError::validation("program must select at least one month"));
    }
    if program.months.iter().any(|&m| !(1..=12).contains(&m)) {
        return Err(KernelError::validation("months must be between 1 and 12"));
    }
    if !is_valid_hhmm(&program.activation_time) {
        return Err(KernelError::validation("activation_time must be HH:MM"));
    }
    if program.steps.is_empty() {
        return Err(KernelError::validation("program must have at least one step"));
    }
    for step in &program.steps {
        if settings.zone(step.zone_id).is_none() {
            return Err(KernelError::validation(format!("zone {} is not configured", step.zone_id)));
        }
        if step.duration_minutes == 0 || step.duration_minutes > settings.max_zone_duration {
            return Err(KernelError::validation(format!(
                "step duration must be between 1 and {} minutes",
                settings.max_zone_duration
            )));
        }
    }
    Ok(())
}

fn check_conflicts(programs: &ProgramsDocument, candidate: &Program, exclude_id: Option<&str>) -> KernelResult<()> {
    for (id, other) in programs {
        if Some(id.as_str()) == exclude_id {
            continue;
        }
        if !other.months.is_disjoint(&candidate.months) {
            return Err(KernelError::validation(format!(
                "program '{}' already shares a month with this program",
                other.name
            )));
        }
    }
    Ok(())
}

fn is_valid_hhmm(s: &str) -> bool {
    let mut parts = s.split(':');
    let (Some(h), Some(m), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if h.len() != 2 || m.len() != 2 {
        return false;
    }
    matches!((h.parse::<u8>(), m.parse::<u8>()), (Ok(h), Ok(m)) if h < 24 && m < 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::gpio::MockGpio;
    use crate::store::{ProgramStep, Recurrence};
    use std::collections::BTreeSet;

    async fn kernel() -> (Arc<Kernel>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "irrigation_kernel_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let gpio = Arc::new(MockGpio::new());
        let clock = FakeClock::new(1_718_431_200);
        let log = LogSink::new(&dir, clock.clone());
        (Kernel::new(&dir, gpio, clock, log).await, dir)
    }

    fn make_program(months: &[u8], time: &str) -> Program {
        Program {
            id: String::new(),
            name: "Test".to_string(),
            months: months.iter().copied().collect::<BTreeSet<_>>(),
            recurrence: Recurrence::Daily,
            activation_time: time.to_string(),
            steps: vec![ProgramStep { zone_id: 0, duration_minutes: 10 }],
            last_run_date: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_zone_rejects_unknown_zone() {
        let (kernel, dir) = kernel().await;
        let err = kernel.start_zone(99, 5).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn start_zone_rejects_zero_duration() {
        let (kernel, dir) = kernel().await;
        let err = kernel.start_zone(0, 0).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn start_zone_rejects_duration_over_max() {
        let (kernel, dir) = kernel().await;
        let err = kernel.start_zone(0, 181).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn start_zone_rejects_when_max_active_zones_reached() {
        let (kernel, dir) = kernel().await;
        let mut settings = kernel.get_settings().await;
        settings.activation_delay = 0;
        kernel.update_settings(settings).await.unwrap();

        for zone_id in 0..3u32 {
            kernel.start_zone(zone_id, 10).await.unwrap();
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        let err = kernel.start_zone(3, 10).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn create_program_rejects_unconfigured_zone() {
        let (kernel, dir) = kernel().await;
        let mut program = make_program(&[6, 7], "06:00");
        program.steps = vec![ProgramStep { zone_id: 99, duration_minutes: 5 }];
        let err = kernel.create_program(program).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn create_program_rejects_overlapping_conflict() {
        let (kernel, dir) = kernel().await;
        let mut first = make_program(&[6, 7], "06:00");
        first.name = "First".to_string();
        let mut second = make_program(&[7, 8], "06:00");
        second.name = "Second".to_string();
        kernel.create_program(first).await.unwrap();
        let err = kernel.create_program(second).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn create_program_allows_disjoint_months_at_the_same_time() {
        let (kernel, dir) = kernel().await;
        let mut first = make_program(&[6], "06:00");
        first.name = "June".to_string();
        let mut second = make_program(&[7], "06:00");
        second.name = "July".to_string();
        kernel.create_program(first).await.unwrap();
        kernel.create_program(second).await.unwrap();
        let programs = kernel.list_programs().await;
        assert_eq!(programs.len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn create_program_rejects_overlapping_months_at_a_different_time() {
        let (kernel, dir) = kernel().await;
        let mut first = make_program(&[6, 7], "06:00");
        first.name = "First".to_string();
        let mut second = make_program(&[7, 8], "18:00");
        second.name = "Second".to_string();
        kernel.create_program(first).await.unwrap();
        let err = kernel.create_program(second).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn create_program_rejects_name_over_16_chars() {
        let (kernel, dir) = kernel().await;
        let mut program = make_program(&[6], "06:00");
        program.name = "a_name_far_too_long_for_the_panel".to_string();
        let err = kernel.create_program(program).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn create_program_rejects_duplicate_name() {
        let (kernel, dir) = kernel().await;
        kernel.create_program(make_program(&[6], "06:00")).await.unwrap();
        let err = kernel
            .create_program(make_program(&[7], "07:00"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn update_program_allows_reusing_its_own_name() {
        let (kernel, dir) = kernel().await;
        let created = kernel.create_program(make_program(&[6], "06:00")).await.unwrap();
        let mut updated = make_program(&[6], "07:00");
        updated.name = created.name.clone();
        kernel.update_program(&created.id, updated).await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn start_zone_rejects_while_a_program_is_running() {
        let (kernel, dir) = kernel().await;
        let program = kernel.create_program(make_program(&[6], "06:00")).await.unwrap();
        kernel.run_program_now(&program.id).await.unwrap();
        let err = kernel.start_zone(1, 5).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn update_program_not_found_is_404() {
        let (kernel, dir) = kernel().await;
        let err = kernel
            .update_program("99", make_program(&[6], "06:00"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_program_not_found_is_404() {
        let (kernel, dir) = kernel().await;
        let err = kernel.delete_program("99").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_factory_data_clears_programs_and_settings() {
        let (kernel, dir) = kernel().await;
        kernel.create_program(make_program(&[6], "06:00")).await.unwrap();
        let mut settings = kernel.get_settings().await;
        settings.max_active_zones = 7;
        kernel.update_settings(settings).await.unwrap();

        kernel.reset_factory_data().await.unwrap();

        assert!(kernel.list_programs().await.is_empty());
        assert_eq!(kernel.get_settings().await.max_active_zones, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn request_restart_stops_all_zones_immediately() {
        let (kernel, dir) = kernel().await;
        kernel.start_zone(0, 10).await.unwrap();
        kernel.request_restart();
        assert_eq!(kernel.actuator.active_count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn hhmm_validation() {
        assert!(is_valid_hhmm("06:00"));
        assert!(is_valid_hhmm("23:59"));
        assert!(!is_valid_hhmm("24:00"));
        assert!(!is_valid_hhmm("6:00"));
        assert!(!is_valid_hhmm("06:60"));
        assert!(!is_valid_hhmm("not-a-time"));
    }
}
