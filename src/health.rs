//! Component health checks behind `/overview`.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LlmConfig;
use crate::constants::TASK_TIMEOUT_SECS;
use crate::manager::LightRagManager;
use crate::metrics;
use crate::paths::is_directory_writable;
use crate::service::ServiceManager;

const HISTORY_LIMIT: usize = 100;
const JSON_SAMPLE: usize = 5;
const MIN_DISK_FREE_PERCENT: f64 = 10.0;
const MEMORY_WARN_PERCENT: f64 = 80.0;
const MEMORY_CRITICAL_PERCENT: f64 = 90.0;
const CPU_WARN_PERCENT: f64 = 90.0;
const VECTOR_DB_MAX_BYTES: u64 = 1024 * 1024 * 1024;
const GRAPH_DB_MAX_BYTES: u64 = 500 * 1024 * 1024;
const GRAPH_FILE: &str = "graph_chunk_entity_relation.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Healthy without issues, degraded up to `tolerated`, unhealthy beyond.
    fn from_issues(issues: usize, tolerated: usize) -> Self {
        match issues {
            0 => HealthStatus::Healthy,
            n if n <= tolerated => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub details: Map<String, Value>,
    pub timestamp: String,
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub timestamp: String,
    pub components: BTreeMap<String, ComponentHealth>,
    pub resource_usage: Map<String, Value>,
    pub warnings: Vec<String>,
    pub check_duration_ms: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn component(
    name: &str,
    status: HealthStatus,
    message: String,
    details: Map<String, Value>,
    started: Instant,
) -> ComponentHealth {
    ComponentHealth {
        name: name.to_string(),
        status,
        message,
        details,
        timestamp: chrono::Local::now().to_rfc3339(),
        response_time_ms: round2(started.elapsed().as_secs_f64() * 1000.0),
    }
}

fn issues_message(ok: &str, issues: &[String]) -> String {
    if issues.is_empty() {
        ok.to_string()
    } else {
        format!("Issues: {}", issues.join("; "))
    }
}

fn disk_free_percent(path: &Path) -> Option<f64> {
    let total = fs2::total_space(path).ok()?;
    let free = fs2::available_space(path).ok()?;
    (total > 0).then(|| free as f64 / total as f64 * 100.0)
}

/// Resident memory as a share of `MemTotal`.
fn memory_percent(resident_bytes: f64) -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let total_kb: f64 = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    (total_kb > 0.0).then(|| resident_bytes / (total_kb * 1024.0) * 100.0)
}

fn files_named(root: &Path, matches: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    WalkDir::new(root)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| matches(&e.file_name().to_string_lossy()))
        .map(|e| e.into_path())
        .collect()
}

fn total_size(files: &[PathBuf]) -> u64 {
    files
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum()
}

pub fn check_storage(working_dir: &Path) -> ComponentHealth {
    let started = Instant::now();
    let mut issues = Vec::new();
    let mut details = Map::new();
    details.insert("working_dir".into(), json!(working_dir.display().to_string()));

    if !working_dir.is_dir() {
        issues.push("Working directory does not exist".to_string());
    } else {
        if !is_directory_writable(working_dir) {
            issues.push("Working directory is not writable".to_string());
        }
        if let Some(free) = disk_free_percent(working_dir) {
            details.insert("disk_free_percent".into(), json!(round2(free)));
            if free < MIN_DISK_FREE_PERCENT {
                issues.push(format!("Low disk space: {free:.1}% free"));
            }
        }
        let sample: Vec<PathBuf> = files_named(working_dir, |n| n.ends_with(".json"))
            .into_iter()
            .take(JSON_SAMPLE)
            .collect();
        let corrupted: Vec<String> = sample
            .iter()
            .filter(|path| {
                std::fs::read_to_string(path)
                    .ok()
                    .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                    .is_none()
            })
            .map(|path| path.display().to_string())
            .collect();
        details.insert("checked_files".into(), json!(sample.len()));
        if !corrupted.is_empty() {
            issues.push(format!("Corrupted JSON files: {}", corrupted.join(", ")));
        }
    }

    details.insert("issues".into(), json!(issues));
    component(
        "storage",
        HealthStatus::from_issues(issues.len(), 2),
        issues_message("Storage is healthy", &issues),
        details,
        started,
    )
}

pub fn check_llm(config: &LlmConfig) -> ComponentHealth {
    let started = Instant::now();
    let mut issues = Vec::new();
    let binding = config.llm_binding.clone().unwrap_or_default();
    let model = config.llm_model.clone().unwrap_or_default();

    if model.trim().is_empty() {
        issues.push("LLM_MODEL is not configured".to_string());
    }
    let has_key = config
        .llm_binding_api_key
        .as_deref()
        .is_some_and(|k| !k.trim().is_empty());
    if model.starts_with("gpt") && (binding.is_empty() || binding == "openai") && !has_key {
        issues.push("OpenAI API key is missing".to_string());
    }

    let mut details = Map::new();
    details.insert("binding".into(), json!(binding));
    details.insert("model".into(), json!(model));
    details.insert("host".into(), json!(config.llm_binding_host));
    details.insert("issues".into(), json!(issues));
    component(
        "llm",
        HealthStatus::from_issues(issues.len(), 1),
        issues_message("LLM configuration is valid", &issues),
        details,
        started,
    )
}

fn check_data_files(
    name: &str,
    working_dir: &Path,
    files: Vec<PathBuf>,
    max_bytes: u64,
) -> ComponentHealth {
    let started = Instant::now();
    let mut details = Map::new();
    details.insert("file_count".into(), json!(files.len()));
    if files.is_empty() {
        details.insert("initialized".into(), json!(false));
        return component(
            name,
            HealthStatus::Healthy,
            format!("{name} not initialized"),
            details,
            started,
        );
    }

    let mut issues = Vec::new();
    if !is_directory_writable(working_dir) {
        issues.push("Working directory is not writable".to_string());
    }
    let size = total_size(&files);
    details.insert("total_size_mb".into(), json!(round2(size as f64 / 1024.0 / 1024.0)));
    if size > max_bytes {
        issues.push(format!("{name} files exceed {} MB", max_bytes / 1024 / 1024));
    }
    details.insert("issues".into(), json!(issues));
    component(
        name,
        HealthStatus::from_issues(issues.len(), 1),
        issues_message(&format!("{name} is healthy"), &issues),
        details,
        started,
    )
}

pub fn check_vector_db(working_dir: &Path) -> ComponentHealth {
    let files = files_named(working_dir, |n| n.starts_with("vdb_") && n.ends_with(".json"));
    check_data_files("vector_db", working_dir, files, VECTOR_DB_MAX_BYTES)
}

pub fn check_graph_db(working_dir: &Path) -> ComponentHealth {
    let files = files_named(working_dir, |n| n == GRAPH_FILE);
    check_data_files("graph_db", working_dir, files, GRAPH_DB_MAX_BYTES)
}

pub fn check_system_resources(service: &ServiceManager, working_dir: &Path) -> ComponentHealth {
    let started = Instant::now();
    let mut issues = Vec::new();

    let snapshot = metrics::process_snapshot();
    let memory_mb = snapshot
        .map(|s| s.resident_memory_bytes / 1024.0 / 1024.0)
        .unwrap_or(0.0);
    let memory_percent = snapshot
        .and_then(|s| memory_percent(s.resident_memory_bytes))
        .unwrap_or(0.0);
    if memory_percent > MEMORY_CRITICAL_PERCENT {
        issues.push(format!("Critical memory usage: {memory_percent:.1}%"));
    } else if memory_percent > MEMORY_WARN_PERCENT {
        issues.push(format!("High memory usage: {memory_percent:.1}%"));
    }

    let cpu_percent = service.cpu_usage_percent();
    if cpu_percent > CPU_WARN_PERCENT {
        issues.push(format!("High CPU usage: {cpu_percent:.1}%"));
    }

    let disk_free = disk_free_percent(working_dir).unwrap_or(100.0);
    if disk_free < MIN_DISK_FREE_PERCENT {
        issues.push(format!("Low disk space: {disk_free:.1}% free"));
    }

    let timed_out = service.timed_out_tasks(TASK_TIMEOUT_SECS);
    if !timed_out.is_empty() {
        issues.push(format!("{} task(s) running longer than {TASK_TIMEOUT_SECS}s", timed_out.len()));
    }

    if !service.is_healthy() {
        issues.push(format!("Service state is {:?}", service.state()));
    }

    let mut details = Map::new();
    details.insert("memory_percent".into(), json!(round2(memory_percent)));
    details.insert("cpu_percent".into(), json!(round2(cpu_percent)));
    details.insert("disk_free_percent".into(), json!(round2(disk_free)));
    details.insert("active_connections".into(), json!(service.active_connections()));
    details.insert("active_tasks".into(), json!(service.active_task_count()));
    details.insert("timed_out_tasks".into(), json!(timed_out.len()));
    details.insert("uptime_seconds".into(), json!(round2(service.uptime().as_secs_f64())));
    details.insert("memory_usage_mb".into(), json!(round2(memory_mb)));
    details.insert("issues".into(), json!(issues));
    component(
        "system_resources",
        HealthStatus::from_issues(issues.len(), 2),
        issues_message("System resources are within limits", &issues),
        details,
        started,
    )
}

/// Overall status plus warnings derived from component results.
pub fn summarize(components: Vec<ComponentHealth>, started: Instant) -> SystemHealth {
    let healthy = components
        .iter()
        .filter(|c| c.status == HealthStatus::Healthy)
        .count();
    let overall_status = if healthy == components.len() {
        HealthStatus::Healthy
    } else if healthy > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    };

    let mut warnings: Vec<String> = components
        .iter()
        .filter(|c| matches!(c.status, HealthStatus::Degraded | HealthStatus::Unhealthy))
        .map(|c| format!("{} is {}", c.name, c.status.as_str()))
        .collect();

    let resource_usage = components
        .iter()
        .find(|c| c.name == "system_resources")
        .map(|c| c.details.clone())
        .unwrap_or_default();
    let metric = |key: &str| resource_usage.get(key).and_then(Value::as_f64);
    if metric("memory_percent").is_some_and(|v| v > MEMORY_WARN_PERCENT) {
        warnings.push("High memory usage detected".to_string());
    }
    if metric("cpu_percent").is_some_and(|v| v > CPU_WARN_PERCENT) {
        warnings.push("High CPU usage detected".to_string());
    }
    if metric("disk_free_percent").is_some_and(|v| v < MIN_DISK_FREE_PERCENT) {
        warnings.push("Low disk space detected".to_string());
    }

    SystemHealth {
        overall_status,
        timestamp: chrono::Local::now().to_rfc3339(),
        components: components.into_iter().map(|c| (c.name.clone(), c)).collect(),
        resource_usage,
        warnings,
        check_duration_ms: round2(started.elapsed().as_secs_f64() * 1000.0),
    }
}

pub struct HealthChecker {
    service: Arc<ServiceManager>,
    manager: Arc<LightRagManager>,
    history: Mutex<VecDeque<SystemHealth>>,
}

impl HealthChecker {
    pub fn new(service: Arc<ServiceManager>, manager: Arc<LightRagManager>) -> Self {
        Self {
            service,
            manager,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn check_all_components(&self) -> SystemHealth {
        let started = Instant::now();
        let working_dir = self.manager.working_dir().await;
        let llm_config = match self.manager.config().get().await {
            Ok(config) => config.llm_config,
            Err(err) => {
                warn!("Health check could not load config: {err}");
                LlmConfig::default()
            }
        };

        let (storage, llm, vector_db, graph_db, system) = tokio::join!(
            async { check_storage(&working_dir) },
            async { check_llm(&llm_config) },
            async { check_vector_db(&working_dir) },
            async { check_graph_db(&working_dir) },
            async { check_system_resources(&self.service, &working_dir) },
        );
        let report = summarize(vec![storage, llm, vector_db, graph_db, system], started);
        debug!(
            status = report.overall_status.as_str(),
            duration_ms = report.check_duration_ms,
            "Health check finished"
        );

        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push_back(report.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        report
    }

    pub fn health_summary(&self) -> Value {
        let history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(last) = history.back() else {
            return json!({"message": "No health check history available"});
        };
        let errors = last
            .components
            .values()
            .filter(|c| c.status == HealthStatus::Unhealthy)
            .count();
        json!({
            "last_check": last.timestamp,
            "overall_status": last.overall_status,
            "component_count": last.components.len(),
            "warning_count": last.warnings.len(),
            "error_count": errors,
            "check_duration_ms": last.check_duration_ms,
            "total_checks": history.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn with_status(name: &str, status: HealthStatus) -> ComponentHealth {
        component(name, status, String::new(), Map::new(), Instant::now())
    }

    #[test]
    fn overall_status_rules() {
        let all = summarize(
            vec![with_status("a", HealthStatus::Healthy), with_status("b", HealthStatus::Healthy)],
            Instant::now(),
        );
        assert_eq!(all.overall_status, HealthStatus::Healthy);
        assert!(all.warnings.is_empty());

        let some = summarize(
            vec![with_status("a", HealthStatus::Healthy), with_status("b", HealthStatus::Degraded)],
            Instant::now(),
        );
        assert_eq!(some.overall_status, HealthStatus::Degraded);
        assert_eq!(some.warnings, vec!["b is degraded"]);

        let none = summarize(vec![with_status("a", HealthStatus::Unhealthy)], Instant::now());
        assert_eq!(none.overall_status, HealthStatus::Unhealthy);
        assert_eq!(none.warnings, vec!["a is unhealthy"]);
    }

    #[test]
    fn storage_flags_corrupted_json() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ok.json"), "{}").unwrap();
        assert_eq!(check_storage(tmp.path()).status, HealthStatus::Healthy);

        std::fs::write(tmp.path().join("bad.json"), "{oops").unwrap();
        let health = check_storage(tmp.path());
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.message.contains("Corrupted JSON files"));

        let missing = check_storage(&tmp.path().join("nope"));
        assert_eq!(missing.status, HealthStatus::Degraded);
    }

    #[test]
    fn llm_check_counts_issues() {
        let ok = LlmConfig {
            llm_binding: Some("openai".into()),
            llm_model: Some("gpt-4o-mini".into()),
            llm_binding_api_key: Some("sk-test".into()),
            ..Default::default()
        };
        assert_eq!(check_llm(&ok).status, HealthStatus::Healthy);

        let no_key = LlmConfig {
            llm_binding_api_key: None,
            ..ok.clone()
        };
        assert_eq!(check_llm(&no_key).status, HealthStatus::Degraded);

        let nothing = LlmConfig::default();
        assert_eq!(check_llm(&nothing).status, HealthStatus::Degraded);
    }

    #[test]
    fn empty_data_dirs_are_not_initialized() {
        let tmp = TempDir::new().unwrap();
        let vdb = check_vector_db(tmp.path());
        assert_eq!(vdb.status, HealthStatus::Healthy);
        assert_eq!(vdb.message, "vector_db not initialized");

        let collection = tmp.path().join("docs");
        std::fs::create_dir_all(&collection).unwrap();
        std::fs::write(collection.join(GRAPH_FILE), "{}").unwrap();
        let graph = check_graph_db(tmp.path());
        assert_eq!(graph.status, HealthStatus::Healthy);
        assert_eq!(graph.details["file_count"], 1);
    }
}
