//! Service lifecycle: state, background tasks and graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::constants::{SHUTDOWN_WAIT_SECS, TASK_TIMEOUT_SECS};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Initializing,
    Running,
    Stopping,
    Stopped,
    Error,
}

type ShutdownCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    state: ServiceState,
    start_time: DateTime<Local>,
    stop_time: Option<DateTime<Local>>,
    error_message: Option<String>,
    active_tasks: HashMap<String, DateTime<Local>>,
    callbacks: Vec<(String, ShutdownCallback)>,
    handles: Vec<(String, JoinHandle<()>)>,
    cpu_sample: Option<(Instant, f64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub state: ServiceState,
    pub uptime: f64,
    pub pid: u32,
    pub total_requests: u64,
    pub active_connections: usize,
    pub active_tasks: usize,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub start_time: String,
    pub stop_time: Option<String>,
    pub shutdown_requested: bool,
    pub error_message: Option<String>,
    pub working_dir: String,
}

/// Removes its task from the active set when dropped, so panics and aborts are covered too.
struct TaskGuard {
    service: Arc<ServiceManager>,
    task_id: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(task = %self.task_id, "Background task panicked");
        }
        self.service.finish_task(&self.task_id);
    }
}

pub struct ServiceManager {
    inner: Mutex<Inner>,
    total_requests: AtomicU64,
    active_connections: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    working_dir: PathBuf,
}

impl ServiceManager {
    pub fn new(working_dir: PathBuf) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                state: ServiceState::Initializing,
                start_time: Local::now(),
                stop_time: None,
                error_message: None,
                active_tasks: HashMap::new(),
                callbacks: Vec::new(),
                handles: Vec::new(),
                cpu_sample: None,
            }),
            total_requests: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
            shutdown_tx,
            working_dir,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner().state
    }

    pub fn set_running(&self) {
        let mut inner = self.inner();
        inner.state = ServiceState::Running;
        inner.start_time = Local::now();
        info!("Service is running");
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Service error: {message}");
        let mut inner = self.inner();
        inner.state = ServiceState::Error;
        inner.error_message = Some(message);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Flag shutdown and wake every waiter. Returns false if already requested.
    pub fn initiate_shutdown(&self, reason: &str) -> bool {
        if self.is_shutdown_requested() {
            info!("Shutdown already in progress");
            return false;
        }
        info!(reason, "Initiating graceful shutdown");
        {
            let mut inner = self.inner();
            if inner.state != ServiceState::Error {
                inner.state = ServiceState::Stopping;
            }
        }
        self.shutdown_tx.send_replace(true);
        true
    }

    /// Resolves on Ctrl+C, SIGTERM or [`initiate_shutdown`](Self::initiate_shutdown).
    pub fn shutdown_signal(self: &Arc<Self>) -> impl Future<Output = ()> + Send + 'static {
        let service = Arc::clone(self);
        let mut rx = self.shutdown_tx.subscribe();
        async move {
            let ctrl_c = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {err}");
                    std::future::pending::<()>().await;
                }
            };
            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(err) => {
                        error!("Failed to listen for SIGTERM: {err}");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    service.initiate_shutdown("SIGINT");
                }
                _ = terminate => {
                    service.initiate_shutdown("SIGTERM");
                }
                _ = rx.wait_for(|requested| *requested) => {}
            }
        }
    }

    pub fn add_shutdown_callback(&self, name: &str, callback: impl FnOnce() + Send + 'static) {
        self.inner()
            .callbacks
            .push((name.to_string(), Box::new(callback)));
    }

    pub fn start_task(&self, name: &str) -> String {
        let task_id = format!("{name}_{}", uuid::Uuid::new_v4().simple());
        self.inner().active_tasks.insert(task_id.clone(), Local::now());
        task_id
    }

    pub fn finish_task(&self, task_id: &str) {
        self.inner().active_tasks.remove(task_id);
    }

    pub fn active_task_count(&self) -> usize {
        self.inner().active_tasks.len()
    }

    /// Spawn a tracked background task.
    pub fn spawn_task<F>(self: &Arc<Self>, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_id = self.start_task(name);
        let guard = TaskGuard {
            service: Arc::clone(self),
            task_id: task_id.clone(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await;
        });
        let mut inner = self.inner();
        inner.handles.retain(|(_, h)| !h.is_finished());
        inner.handles.push((task_id, handle));
    }

    pub fn increment_connections(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ServiceState::Running && !self.is_shutdown_requested()
    }

    pub fn uptime(&self) -> Duration {
        let inner = self.inner();
        let end = inner.stop_time.unwrap_or_else(Local::now);
        (end - inner.start_time).to_std().unwrap_or_default()
    }

    /// Tasks running for longer than `threshold_secs`.
    pub fn timed_out_tasks(&self, threshold_secs: i64) -> Vec<String> {
        let now = Local::now();
        let mut ids: Vec<String> = self
            .inner()
            .active_tasks
            .iter()
            .filter(|(_, started)| (now - **started).num_seconds() > threshold_secs)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// CPU use of this process since the previous call.
    pub fn cpu_usage_percent(&self) -> f64 {
        let Some(snapshot) = metrics::process_snapshot() else {
            return 0.0;
        };
        let now = Instant::now();
        let mut inner = self.inner();
        let percent = match inner.cpu_sample {
            Some((at, cpu)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    ((snapshot.cpu_seconds_total - cpu) / wall * 100.0).max(0.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        inner.cpu_sample = Some((now, snapshot.cpu_seconds_total));
        percent
    }

    pub fn service_info(&self) -> ServiceInfo {
        let memory_usage_mb = metrics::process_snapshot()
            .map(|s| s.resident_memory_bytes / 1024.0 / 1024.0)
            .unwrap_or(0.0);
        let cpu_usage_percent = self.cpu_usage_percent();
        let uptime = self.uptime().as_secs_f64();
        let inner = self.inner();
        ServiceInfo {
            state: inner.state,
            uptime,
            pid: std::process::id(),
            total_requests: self.total_requests(),
            active_connections: self.active_connections(),
            active_tasks: inner.active_tasks.len(),
            memory_usage_mb,
            cpu_usage_percent,
            start_time: inner.start_time.to_rfc3339(),
            stop_time: inner.stop_time.map(|t| t.to_rfc3339()),
            shutdown_requested: self.is_shutdown_requested(),
            error_message: inner.error_message.clone(),
            working_dir: self.working_dir.display().to_string(),
        }
    }

    /// Drain tasks, run callbacks, abort what is left and mark the service stopped.
    pub async fn graceful_shutdown(&self) {
        let started = Instant::now();
        self.initiate_shutdown("graceful shutdown");

        let deadline = started + Duration::from_secs(SHUTDOWN_WAIT_SECS);
        loop {
            let stale = self.timed_out_tasks(TASK_TIMEOUT_SECS);
            if !stale.is_empty() {
                warn!(tasks = ?stale, "Dropping timed out tasks");
                let mut inner = self.inner();
                for id in &stale {
                    inner.active_tasks.remove(id);
                }
            }
            let remaining = self.active_task_count();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Shutdown wait elapsed with tasks still active");
                break;
            }
            info!(remaining, "Waiting for active tasks");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let (callbacks, handles) = {
            let mut inner = self.inner();
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.handles),
            )
        };
        for (name, callback) in callbacks {
            info!(callback = %name, "Running shutdown callback");
            callback();
        }
        for (name, handle) in handles {
            if !handle.is_finished() {
                warn!(task = %name, "Aborting background task");
                handle.abort();
            }
        }
        if let Some(snapshot) = metrics::process_snapshot() {
            info!(
                memory_mb = snapshot.resident_memory_bytes / 1024.0 / 1024.0,
                "Memory usage at shutdown"
            );
        }

        {
            let mut inner = self.inner();
            if inner.state != ServiceState::Error {
                inner.state = ServiceState::Stopped;
            }
            inner.stop_time = Some(Local::now());
        }
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            total_requests = self.total_requests(),
            "Graceful shutdown completed"
        );
    }
}
