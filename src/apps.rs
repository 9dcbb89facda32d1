//! Applications and the pool that owns them.
//!
//! The router only depends on the [`ApplicationPool`] trait. [`AppPool`] is the
//! in-memory implementation used by the binary: apps are declared in the
//! configuration with a fixed scheme and address, and the first lookup of a
//! dead app boots it by probing its address until it accepts connections.

use crate::config::{AppConfig, PoolSettings};
use crate::error::PoolError;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Name of the app used when no other app matches a host
pub const DEFAULT_APP: &str = "default";

/// Lifecycle state of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Dead,
    Booting,
    Running,
    /// Any state this build does not recognise
    Unknown,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Dead => "dead",
            AppStatus::Booting => "booting",
            AppStatus::Running => "running",
            AppStatus::Unknown => "unknown",
        }
    }
}

impl From<u8> for AppStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => AppStatus::Dead,
            1 => AppStatus::Booting,
            2 => AppStatus::Running,
            _ => AppStatus::Unknown,
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named backend reachable at `scheme://address`
pub struct App {
    name: String,
    scheme: String,
    address: String,
    status_tx: watch::Sender<AppStatus>,
    log: Mutex<VecDeque<String>>,
    log_capacity: usize,
    boot_timeout: Duration,
}

impl App {
    pub fn new(name: &str, config: &AppConfig, settings: &PoolSettings) -> Self {
        let (status_tx, _) = watch::channel(AppStatus::Dead);
        Self {
            name: name.to_string(),
            scheme: config.scheme.clone(),
            address: config.address.clone(),
            status_tx,
            log: Mutex::new(VecDeque::new()),
            log_capacity: settings.log_lines.max(1),
            boot_timeout: settings.boot_timeout(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> AppStatus {
        *self.status_tx.borrow()
    }

    /// Set the status and wake every request waiting on this app
    pub fn set_status(&self, status: AppStatus) {
        self.status_tx.send_replace(status);
    }

    /// Move from `from` to `to` only if the app is currently in `from`
    fn transition(&self, from: AppStatus, to: AppStatus) -> bool {
        self.status_tx.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    /// Append a line to the app's recent log, dropping the oldest past capacity
    pub fn append_log(&self, line: impl Into<String>) {
        let mut log = self.log.lock();
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(line.into());
    }

    /// The recent log excerpt, oldest line first
    pub fn log(&self) -> String {
        let log = self.log.lock();
        let mut out = String::new();
        for line in log.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn matches(&self, config: &AppConfig) -> bool {
        self.scheme == config.scheme && self.address == config.address
    }

    /// Wait until the app is running.
    ///
    /// Returns immediately if it already is. Fails if the app is dead (or in
    /// an unrecognised state) or does not leave `Booting` within the boot
    /// timeout.
    pub async fn wait_until_ready(&self) -> Result<(), PoolError> {
        let mut status_rx = self.status_tx.subscribe();

        let wait = async {
            loop {
                let status = *status_rx.borrow_and_update();
                match status {
                    AppStatus::Running => return Ok(()),
                    AppStatus::Booting => {}
                    AppStatus::Dead | AppStatus::Unknown => {
                        return Err(PoolError::BootFailed {
                            name: self.name.clone(),
                            reason: format!("app is {}", status),
                        });
                    }
                }

                if status_rx.changed().await.is_err() {
                    return Err(PoolError::BootFailed {
                        name: self.name.clone(),
                        reason: "app was dropped".to_string(),
                    });
                }
            }
        };

        match tokio::time::timeout(self.boot_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::BootTimeout {
                name: self.name.clone(),
                timeout: self.boot_timeout,
            }),
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("address", &self.address)
            .field("status", &self.status())
            .finish()
    }
}

/// Callback invoked whenever an app is closed
pub type AppClosedCallback = Box<dyn Fn(&App) + Send + Sync>;

/// What the router needs from whoever owns the applications
pub trait ApplicationPool: Send + Sync + 'static {
    /// Find the app registered under `name`, booting it if necessary.
    ///
    /// Must fail with [`PoolError::UnknownApp`] when nothing is registered
    /// under that name.
    fn lookup(&self, name: &str) -> Result<Arc<App>, PoolError>;

    /// Visit every known app. Must not start, wait on or mutate any app.
    fn for_each_app(&self, visit: &mut dyn FnMut(&App));

    /// Register a callback run whenever any app is closed
    fn on_app_closed(&self, callback: AppClosedCallback);
}

/// Result of a configuration reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    /// Closed and removed
    pub removed: Vec<String>,
    /// Closed and re-registered with a new scheme or address
    pub updated: Vec<String>,
}

/// In-memory application pool
pub struct AppPool {
    apps: DashMap<String, Arc<App>>,
    settings: PoolSettings,
    closed_callbacks: RwLock<Vec<AppClosedCallback>>,
}

impl AppPool {
    /// Create an empty pool. Returned as `Arc` because boot probes hold a
    /// reference to the apps they drive.
    pub fn new(settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            apps: DashMap::new(),
            settings,
            closed_callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Create a pool with every app from `apps` registered
    pub fn with_apps(settings: PoolSettings, apps: &HashMap<String, AppConfig>) -> Arc<Self> {
        let pool = Self::new(settings);
        for (name, config) in apps {
            pool.register(name, config);
        }
        pool
    }

    /// Register an app in the `Dead` state, closing any app it replaces
    pub fn register(&self, name: &str, config: &AppConfig) -> Arc<App> {
        let app = Arc::new(App::new(name, config, &self.settings));
        app.append_log(format!("registered at {}://{}", config.scheme, config.address));
        debug!(app = name, scheme = %config.scheme, address = %config.address, "App registered");

        if let Some(previous) = self.apps.insert(name.to_string(), Arc::clone(&app)) {
            self.notify_closed(&previous);
        }
        app
    }

    /// Get an app without booting it
    pub fn get(&self, name: &str) -> Option<Arc<App>> {
        self.apps.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Sorted names of all registered apps
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remove an app, mark it dead and notify every closed-callback.
    /// Returns false if no such app was registered.
    pub fn close(&self, name: &str) -> bool {
        let Some((_, app)) = self.apps.remove(name) else {
            return false;
        };
        self.notify_closed(&app);
        true
    }

    fn notify_closed(&self, app: &App) {
        app.set_status(AppStatus::Dead);
        app.append_log("closed");
        info!(app = app.name(), "App closed");

        let callbacks = self.closed_callbacks.read();
        for callback in callbacks.iter() {
            callback(app);
        }
    }

    /// Replace the registered apps with `apps`.
    ///
    /// Removed apps and apps whose scheme or address changed are closed;
    /// unchanged apps keep running untouched.
    pub fn apply_config(&self, apps: &HashMap<String, AppConfig>) -> ReloadResult {
        let mut result = ReloadResult::default();

        for name in self.names() {
            if !apps.contains_key(&name) {
                info!(app = %name, "Removing app (config reload)");
                self.close(&name);
                result.removed.push(name);
            }
        }

        let mut names: Vec<&String> = apps.keys().collect();
        names.sort();
        for name in names {
            let config = &apps[name];
            match self.get(name) {
                Some(app) if app.matches(config) => {}
                Some(_) => {
                    info!(app = %name, "Updating app (config reload)");
                    self.register(name, config);
                    result.updated.push(name.clone());
                }
                None => {
                    info!(app = %name, "Adding app (config reload)");
                    self.register(name, config);
                    result.added.push(name.clone());
                }
            }
        }

        result
    }

    /// Start probing a dead app. No-op for apps in any other state.
    fn boot(&self, app: &Arc<App>) {
        if !app.transition(AppStatus::Dead, AppStatus::Booting) {
            return;
        }

        info!(app = app.name(), address = app.address(), "Booting app");
        app.append_log(format!("booting, waiting for {}", app.address()));

        let app = Arc::clone(app);
        let interval = self.settings.probe_interval();
        let timeout = self.settings.boot_timeout();
        tokio::spawn(async move {
            probe_until_ready(app, interval, timeout).await;
        });
    }
}

impl ApplicationPool for AppPool {
    fn lookup(&self, name: &str) -> Result<Arc<App>, PoolError> {
        let app = self
            .get(name)
            .ok_or_else(|| PoolError::UnknownApp(name.to_string()))?;
        self.boot(&app);
        Ok(app)
    }

    fn for_each_app(&self, visit: &mut dyn FnMut(&App)) {
        for entry in self.apps.iter() {
            visit(entry.value());
        }
    }

    fn on_app_closed(&self, callback: AppClosedCallback) {
        self.closed_callbacks.write().push(callback);
    }
}

/// Poll the app's address until it accepts a TCP connection
async fn probe_until_ready(app: Arc<App>, interval: Duration, timeout: Duration) {
    let start = Instant::now();
    let connect_timeout = interval.max(Duration::from_millis(50));

    loop {
        if app.status() != AppStatus::Booting {
            debug!(app = app.name(), status = %app.status(), "Stopping boot probe, status changed");
            return;
        }

        match tokio::time::timeout(connect_timeout, TcpStream::connect(app.address())).await {
            Ok(Ok(_)) => {
                if app.transition(AppStatus::Booting, AppStatus::Running) {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    info!(app = app.name(), elapsed_ms, "App is now running");
                    app.append_log(format!("running after {}ms", elapsed_ms));
                }
                return;
            }
            Ok(Err(e)) => {
                debug!(app = app.name(), error = %e, "Boot probe failed");
            }
            Err(_) => {
                debug!(app = app.name(), "Boot probe timed out");
            }
        }

        if start.elapsed() >= timeout {
            if app.transition(AppStatus::Booting, AppStatus::Dead) {
                warn!(app = app.name(), timeout_secs = timeout.as_secs(), "App did not come up in time");
                app.append_log(format!(
                    "did not accept connections within {}s",
                    timeout.as_secs()
                ));
            }
            return;
        }

        tokio::time::sleep(interval).await;
    }
}
