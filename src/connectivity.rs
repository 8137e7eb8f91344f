//! WiFi/AP connectivity supervisor. A deployed device should join a
//! configured WiFi network or, failing that, fall back to broadcasting its
//! own access point so it stays reachable. A userspace binary has no radio
//! to drive directly, so this module models the same state machine and
//! exposes it to the web layer; wiring it to an actual network stack (e.g.
//! `NetworkManager` D-Bus calls) is a deployment-specific concern left to
//! the operator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::{Settings, Store};

const RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityMode {
    /// Associated to the configured WiFi network.
    Client,
    /// Broadcasting its own access point, either because no WiFi is
    /// configured or because association failed.
    AccessPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConnectivityStatus {
    pub mode: ConnectivityMode,
    pub ssid: String,
}

pub struct ConnectivitySupervisor {
    store: Store,
    status: Mutex<ConnectivityStatus>,
}

impl ConnectivitySupervisor {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            store,
            status: Mutex::new(ConnectivityStatus {
                mode: ConnectivityMode::AccessPoint,
                ssid: String::new(),
            }),
        })
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status.lock().expect("connectivity status poisoned").clone()
    }

    /// Re-evaluates connectivity against the current settings document: if
    /// `client_enabled` is set and a WiFi SSID is configured, report
    /// association to it; otherwise fall back to the AP.
    async fn reconcile(&self) {
        let settings = self.store.load_settings().await;
        let next = Self::evaluate(&settings);
        let mut status = self.status.lock().expect("connectivity status poisoned");
        if *status != next {
            match next.mode {
                ConnectivityMode::Client => info!(ssid = %next.ssid, "associated to configured network"),
                ConnectivityMode::AccessPoint => warn!(ssid = %next.ssid, "broadcasting fallback access point"),
            }
            *status = next;
        }
    }

    fn evaluate(settings: &Settings) -> ConnectivityStatus {
        if settings.client_enabled && !settings.wifi.ssid.is_empty() {
            ConnectivityStatus {
                mode: ConnectivityMode::Client,
                ssid: settings.wifi.ssid.clone(),
            }
        } else {
            ConnectivityStatus {
                mode: ConnectivityMode::AccessPoint,
                ssid: settings.ap.ssid.clone(),
            }
        }
    }

    /// Spawns the periodic reconciliation loop as a background task.
    pub fn spawn_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.reconcile().await;
            let mut interval = tokio::time::interval(RETRY_INTERVAL);
            loop {
                interval.tick().await;
                self.reconcile().await;
            }
        })
    }
}
